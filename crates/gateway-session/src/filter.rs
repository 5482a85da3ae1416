use std::{fmt, sync::Arc};

use gateway_buffer::IoBuffer;
use tracing::debug;

use crate::{error::BridgeError, idle::IdleClass, session::Session, write::WriteRequest};

/// 过滤器：消费会话生命周期与数据事件的协议/处理阶段。
///
/// # 教案式说明
/// - **意图 (Why)**：编解码、鉴权、统计等协作者只通过这组回调观察会话，不参与桥接层内部的
///   并发设计；
/// - **契约 (What)**：
///   - 除 `on_session_idle` 的投递源头外，所有回调都在会话的亲和线程上按事件顺序执行；
///   - 回调中可以调用 [`Session::write`]、[`Session::close`] 等方法，写入会在当前刷新循环中
///     继续发出；
///   - 每个方法都有空实现，过滤器只覆写关心的事件。
pub trait Filter: Send + Sync + 'static {
    fn on_session_created(&self, session: &Session) {
        let _ = session;
    }

    fn on_session_opened(&self, session: &Session) {
        let _ = session;
    }

    /// 收到的字节以独占缓冲交付，过滤器按顺序观察同一个缓冲，可推进其游标。
    fn on_message_received(&self, session: &Session, message: &mut IoBuffer) {
        let _ = (session, message);
    }

    fn on_message_sent(&self, session: &Session, request: &WriteRequest) {
        let _ = (session, request);
    }

    fn on_session_idle(&self, session: &Session, class: IdleClass) {
        let _ = (session, class);
    }

    fn on_session_closed(&self, session: &Session) {
        let _ = session;
    }

    fn on_exception_caught(&self, session: &Session, cause: &BridgeError) {
        let _ = (session, cause);
    }
}

/// 有序、构建后不可变的过滤器链。
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Arc<[(String, Arc<dyn Filter>)]>,
}

impl FilterChain {
    pub fn builder() -> FilterChainBuilder {
        FilterChainBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Filter>> {
        self.filters
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, filter)| filter)
    }

    pub(crate) fn fire_session_created(&self, session: &Session) {
        for (_, filter) in self.filters.iter() {
            filter.on_session_created(session);
        }
    }

    pub(crate) fn fire_session_opened(&self, session: &Session) {
        for (_, filter) in self.filters.iter() {
            filter.on_session_opened(session);
        }
    }

    pub(crate) fn fire_message_received(&self, session: &Session, message: &mut IoBuffer) {
        for (_, filter) in self.filters.iter() {
            filter.on_message_received(session, message);
        }
    }

    pub(crate) fn fire_message_sent(&self, session: &Session, request: &WriteRequest) {
        for (_, filter) in self.filters.iter() {
            filter.on_message_sent(session, request);
        }
    }

    pub(crate) fn fire_session_idle(&self, session: &Session, class: IdleClass) {
        for (_, filter) in self.filters.iter() {
            filter.on_session_idle(session, class);
        }
    }

    pub(crate) fn fire_session_closed(&self, session: &Session) {
        for (_, filter) in self.filters.iter() {
            filter.on_session_closed(session);
        }
    }

    pub(crate) fn fire_exception_caught(&self, session: &Session, cause: &BridgeError) {
        if self.filters.is_empty() {
            debug!(session = %session.id(), code = cause.code(), "exception without filters: {cause}");
        }
        for (_, filter) in self.filters.iter() {
            filter.on_exception_caught(session, cause);
        }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// [`FilterChain`] 的构建器，名称重复时后加入者替换先加入者的位置。
#[derive(Default)]
pub struct FilterChainBuilder {
    filters: Vec<(String, Arc<dyn Filter>)>,
}

impl FilterChainBuilder {
    pub fn add_last(mut self, name: impl Into<String>, filter: impl Filter) -> Self {
        self.insert(name.into(), Arc::new(filter), false);
        self
    }

    pub fn add_first(mut self, name: impl Into<String>, filter: impl Filter) -> Self {
        self.insert(name.into(), Arc::new(filter), true);
        self
    }

    /// 加入已被其它位置共享的过滤器实例。
    pub fn add_shared(mut self, name: impl Into<String>, filter: Arc<dyn Filter>) -> Self {
        self.insert(name.into(), filter, false);
        self
    }

    pub fn build(self) -> FilterChain {
        FilterChain {
            filters: self.filters.into(),
        }
    }

    fn insert(&mut self, name: String, filter: Arc<dyn Filter>, front: bool) {
        if let Some(slot) = self.filters.iter_mut().find(|(existing, _)| *existing == name) {
            slot.1 = filter;
        } else if front {
            self.filters.insert(0, (name, filter));
        } else {
            self.filters.push((name, filter));
        }
    }
}

/// 写超时策略：在空闲事件中检查“有待写数据却长期没有写出”的会话并强制关闭。
///
/// # 教案式说明
/// - **意图 (Why)**：桥接层的单个写请求没有独立超时，写超时以过滤器阶段的形式实现；
/// - **逻辑 (How)**：任意空闲事件到达时，若会话仍有排队或在途的写请求，且距上次写出已超过
///   配置的 `write_timeout`，则向过滤器链抛出 [`BridgeError::WriteTimeout`] 并关闭会话；
/// - **前置条件**：会话需要配置写空闲或双向空闲检测，否则本过滤器收不到检查时机；
///   `write_timeout` 为 0 时不做任何检查。
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteTimeoutFilter;

impl Filter for WriteTimeoutFilter {
    fn on_session_idle(&self, session: &Session, _class: IdleClass) {
        let timeout = session.config().write_timeout;
        if timeout.is_zero() || session.scheduled_write_messages() == 0 {
            return;
        }
        let elapsed = session
            .now()
            .saturating_duration_since(session.last_write_time());
        if elapsed < timeout {
            return;
        }
        session.raise_exception(BridgeError::WriteTimeout {
            session_id: session.id(),
            elapsed,
        });
        let _ = session.close();
    }
}
