use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use gateway_buffer::IoBuffer;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    affinity::{Affinity, Confined},
    clock::Clock,
    config::SessionConfig,
    error::{BridgeError, DiscardedWrite},
    executor::IoExecutor,
    filter::FilterChain,
    future::{CloseFuture, ReadFuture, WriteFuture},
    idle::{IdleClass, IdleGate, IdleSupervisor, IdleTarget},
    message::Message,
    service::ServiceCore,
    stats::{SessionStatistics, SessionStats},
    transport::{ReadBufferSizing, TransportChannel},
    write::{self, WriteQueue, WriteRequest},
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 会话标识，进程内单调递增。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 会话状态：`Created → Open → Closing → Closed`，`Closed` 为终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Created,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// 只由亲和线程访问的会话内部状态。
pub(crate) struct Interior {
    pub(crate) queue: WriteQueue,
    pub(crate) flushing: bool,
    next_request_id: u64,
    reads: VecDeque<Bytes>,
    waiting_reads: VecDeque<ReadFuture>,
}

/// 一个存活连接在桥接层的表示。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把回调式通道包装为带写队列、过滤器链、空闲监督与生命周期通知的会话；
/// - 会话被服务层会话组、空闲监督线程、写完成回调等跨线程持有，但其内部状态只允许亲和线程修改。
///
/// ## 逻辑 (How)
/// - 写队列与读取队列放在 [`Confined`] 中，每次访问都校验调用线程；
/// - 状态、计数器、关闭锁存等跨线程可见的字段使用原子量；
/// - 关闭分两步：[`Session::close`] 以 CAS 抢占 `Closing` 并请求传输层关闭；传输层投递
///   `on_closed` 后在亲和线程上执行拆除（丢弃写队列、撤销空闲定时器、通知过滤器链）。
///
/// ## 契约 (What)
/// - `write`/`flush`/`read`/`suspend_read`/`resume_read`/`attach`/`detach` 只能在亲和线程调用，
///   否则返回 [`BridgeError::ConfinementViolation`]；
/// - [`Session::notify_idle`] 是唯一允许从任意线程调用的事件入口，它只把空闲事件投递回
///   亲和线程；
/// - `close` 可在任意线程调用且幂等，`on_session_closed` 恰好通知一次。
///
/// ## 注意事项 (Trade-offs)
/// - I/O 类异常默认只投递第一个，后续的同类异常只记录 debug 日志；阈值由服务配置
///   `exception_threshold` 调整。
pub struct Session {
    id: SessionId,
    self_ref: Weak<Session>,
    channel: Arc<dyn TransportChannel>,
    executor: Arc<dyn IoExecutor>,
    chain: FilterChain,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    affinity: Affinity,
    state: AtomicU8,
    pub(crate) interior: Confined<Interior>,
    pub(crate) stats: SessionStats,
    attributes: DashMap<String, Arc<dyn Any + Send + Sync>>,
    idle: Mutex<Option<IdleSupervisor>>,
    close_future: CloseFuture,
    close_latched: AtomicBool,
    torn_down: AtomicBool,
    read_suspended: AtomicBool,
    exception_threshold: usize,
    io_exceptions: AtomicUsize,
    service: Weak<ServiceCore>,
}

impl Session {
    /// 在当前线程上构造会话，当前线程即亲和线程。
    pub(crate) fn new(core: &Arc<ServiceCore>, channel: Arc<dyn TransportChannel>) -> Arc<Self> {
        let service_config = core.config();
        let clock = Arc::clone(&core.clock);
        let now = clock.now();
        let affinity = Affinity::current();
        let owner = affinity.owner();
        Arc::new_cyclic(|self_ref| Session {
            id: SessionId::next(),
            self_ref: self_ref.clone(),
            executor: channel.executor(),
            channel,
            chain: core.chain.clone(),
            config: service_config.session.clone(),
            clock,
            affinity,
            state: AtomicU8::new(SessionState::Created as u8),
            interior: Confined::new(
                owner,
                Interior {
                    queue: WriteQueue::default(),
                    flushing: false,
                    next_request_id: 1,
                    reads: VecDeque::new(),
                    waiting_reads: VecDeque::new(),
                },
            ),
            stats: SessionStats::new(now),
            attributes: DashMap::new(),
            idle: Mutex::new(None),
            close_future: CloseFuture::new(),
            close_latched: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            read_suspended: AtomicBool::new(false),
            exception_threshold: service_config.exception_threshold,
            io_exceptions: AtomicUsize::new(0),
            service: Arc::downgrade(core),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// 已进入 `Closing` 或 `Closed`。
    pub fn is_closing(&self) -> bool {
        self.state() >= SessionState::Closing
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.remote_addr()
    }

    /// 会话创建时拷贝的配置快照。
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// 当前线程是否为本会话的亲和线程。
    pub fn is_affinity_thread(&self) -> bool {
        self.affinity.is_owner()
    }

    pub fn is_attached(&self) -> bool {
        self.affinity.is_attached()
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.stats
            .update_throughput(self.now(), self.config.throughput_interval, false);
        self.stats.snapshot()
    }

    pub fn last_read_time(&self) -> Instant {
        self.stats.last_read()
    }

    pub fn last_write_time(&self) -> Instant {
        self.stats.last_write()
    }

    pub fn last_io_time(&self) -> Instant {
        self.stats.last_activity(IdleClass::Both)
    }

    /// 已入队或在途、尚未解决的写请求数。
    pub fn scheduled_write_messages(&self) -> usize {
        self.stats.scheduled_write_messages()
    }

    pub fn scheduled_write_bytes(&self) -> usize {
        self.stats.scheduled_write_bytes()
    }

    pub fn idle_count(&self, class: IdleClass) -> u64 {
        self.stats.idle_count(class)
    }

    /// 将消息加入写队列并立即刷新。
    ///
    /// 会话已在关闭时，返回的完成信号直接以 [`BridgeError::WriteToClosedSession`] 失败。
    pub fn write(&self, message: impl Into<Message>) -> Result<WriteFuture, BridgeError> {
        self.affinity.check(self.id)?;
        let message = message.into();
        let future = WriteFuture::new();
        let request_id = self.interior.with(self.id, |interior| {
            let id = interior.next_request_id;
            interior.next_request_id += 1;
            id
        })?;
        if self.is_closing() {
            future.fail(BridgeError::WriteToClosedSession {
                session_id: self.id,
                requests: Arc::new(vec![DiscardedWrite {
                    request_id,
                    remaining: message.remaining(),
                }]),
            });
            return Ok(future);
        }
        let request = WriteRequest::new(request_id, message, future.clone());
        self.stats.schedule_write(request.scheduled_bytes());
        self.interior
            .with(self.id, |interior| interior.queue.push(request))?;
        write::flush(self)?;
        Ok(future)
    }

    /// 把写队列中的请求交给传输层。
    pub fn flush(&self) -> Result<(), BridgeError> {
        self.affinity.check(self.id)?;
        write::flush(self)
    }

    /// 请求关闭；首个调用者驱动 `Closing → Closed`，其余调用者只拿到同一个完成信号。
    pub fn close(&self) -> CloseFuture {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return self.close_future.clone();
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        debug!(session = %self.id, "closing session");
        self.channel.close();
        self.close_future.clone()
    }

    pub fn close_future(&self) -> CloseFuture {
        self.close_future.clone()
    }

    /// 关闭传输层读兴趣。
    pub fn suspend_read(&self) -> Result<(), BridgeError> {
        self.affinity.check(self.id)?;
        if !self.read_suspended.swap(true, Ordering::AcqRel) {
            self.channel.set_readable(false);
        }
        Ok(())
    }

    pub fn resume_read(&self) -> Result<(), BridgeError> {
        self.affinity.check(self.id)?;
        if self.read_suspended.swap(false, Ordering::AcqRel) {
            self.channel.set_readable(true);
        }
        Ok(())
    }

    pub fn is_read_suspended(&self) -> bool {
        self.read_suspended.load(Ordering::Acquire)
    }

    /// 读取下一条收到的消息，需要配置 `use_read_operation`。
    ///
    /// 已有排队消息时返回已完成的 future；会话关闭后等待中的读取以
    /// [`BridgeError::SessionClosed`] 失败。
    pub fn read(&self) -> Result<ReadFuture, BridgeError> {
        self.affinity.check(self.id)?;
        if !self.config.use_read_operation {
            return Err(BridgeError::ReadOperationDisabled {
                session_id: self.id,
            });
        }
        let closed = self.torn_down.load(Ordering::Acquire);
        self.interior.with(self.id, |interior| {
            if let Some(bytes) = interior.reads.pop_front() {
                return ReadFuture::succeeded(bytes);
            }
            if closed {
                return ReadFuture::failed(BridgeError::SessionClosed {
                    session_id: self.id,
                });
            }
            let future = ReadFuture::new();
            interior.waiting_reads.push_back(future.clone());
            future
        })
    }

    /// 投递空闲事件，可在任意线程调用。
    ///
    /// 会话正在关闭或暂未接入亲和线程时不投递，返回 `false`。
    pub fn notify_idle(&self, class: IdleClass) -> bool {
        self.deliver_idle(class, self.now())
    }

    fn deliver_idle(&self, class: IdleClass, at: Instant) -> bool {
        if self.idle_gate() != IdleGate::Active {
            return false;
        }
        self.stats.record_idle(class, at);
        self.run_on_affinity(move |session| {
            if session.idle_gate() == IdleGate::Active {
                session.chain.fire_session_idle(session, class);
            }
        });
        true
    }

    /// 向过滤器链抛出异常；I/O 类异常超过阈值后只记录日志。
    pub fn raise_exception(&self, cause: BridgeError) {
        if cause.is_io_class() && self.exception_threshold > 0 {
            let seen = self.io_exceptions.fetch_add(1, Ordering::AcqRel);
            if seen >= self.exception_threshold {
                debug!(session = %self.id, code = cause.code(), "suppressed exception: {cause}");
                return;
            }
        }
        self.run_on_affinity(move |session| session.chain.fire_exception_caught(session, &cause));
    }

    /// 暂时解除与亲和线程执行器的接入，例如在迁移处理管道期间。
    pub fn detach(&self) -> Result<(), BridgeError> {
        self.affinity.check(self.id)?;
        self.affinity.set_attached(false);
        Ok(())
    }

    /// 重新接入；期间锁存的关闭事件在此重放。
    pub fn attach(&self) -> Result<(), BridgeError> {
        self.affinity.check(self.id)?;
        self.affinity.set_attached(true);
        if self.close_latched.swap(false, Ordering::AcqRel) {
            debug!(session = %self.id, "replaying latched close");
            self.teardown();
        }
        Ok(())
    }

    pub fn set_attribute<T>(&self, key: impl Into<String>, value: T) -> Option<Arc<dyn Any + Send + Sync>>
    where
        T: Any + Send + Sync,
    {
        self.attributes.insert(key.into(), Arc::new(value))
    }

    pub fn attribute<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.attributes.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attributes.remove(key).map(|(_, value)| value)
    }

    pub fn contains_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub(crate) fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    pub(crate) fn handle(&self) -> Option<Arc<Session>> {
        self.self_ref.upgrade()
    }

    /// 在亲和线程上执行 `task`：已在该线程时直接执行，否则投递到执行器。
    pub(crate) fn run_on_affinity(&self, task: impl FnOnce(&Session) + Send + 'static) {
        if self.affinity.is_owner() {
            task(self);
            return;
        }
        match self.handle() {
            Some(session) => self.executor.execute(Box::new(move || task(session.as_ref()))),
            None => trace!(session = %self.id, "session dropped before task could run"),
        }
    }

    pub(crate) fn fire_created(&self) {
        self.chain.fire_session_created(self);
    }

    /// 完成初始化并进入 `Open`：配置读缓冲、登记会话组与空闲监督、接入亲和线程。
    pub(crate) fn open(&self) -> Result<(), BridgeError> {
        self.affinity.check(self.id)?;
        self.channel.configure_reads(ReadBufferSizing {
            min: self.config.min_read_buffer_size,
            initial: self.config.read_buffer_size,
            max: self.config.max_read_buffer_size,
        });
        let Some(this) = self.handle() else {
            return Err(BridgeError::SessionClosed { session_id: self.id });
        };
        if let Some(core) = self.service.upgrade() {
            core.register(&this);
            let supervisor = core.idle.next();
            let target: Arc<dyn IdleTarget> = this;
            for class in IdleClass::ALL {
                supervisor.reschedule(&target, class);
            }
            *self.idle.lock() = Some(supervisor);
        }
        self.affinity.set_attached(true);
        let opened = self
            .state
            .compare_exchange(
                SessionState::Created as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if opened {
            self.chain.fire_session_opened(self);
        }
        if self.close_latched.swap(false, Ordering::AcqRel) {
            self.teardown();
        }
        Ok(())
    }

    pub(crate) fn receive(&self, payload: BytesMut) {
        if self.torn_down.load(Ordering::Acquire) {
            trace!(session = %self.id, bytes = payload.len(), "dropping data after close");
            return;
        }
        let now = self.now();
        self.stats.record_read(payload.len(), now);
        let mut buffer = IoBuffer::from_bytes_mut(payload);
        if self.config.use_read_operation {
            self.offer_read(buffer.duplicate().into_bytes());
        }
        self.chain.fire_message_received(self, &mut buffer);
        self.stats
            .update_throughput(now, self.config.throughput_interval, false);
    }

    pub(crate) fn write_completed(&self, written: usize) {
        self.stats.record_written_bytes(written, self.now());
    }

    /// 传输层报告连接已关闭。空闲定时器立即撤销，即使拆除因未接入而被锁存。
    pub(crate) fn transport_closed(&self) {
        if let Some(supervisor) = self.idle.lock().take() {
            supervisor.deregister(self.id.get());
        }
        if !self.affinity.is_attached() || !self.affinity.is_owner() {
            debug!(session = %self.id, "close received while detached, latching");
            self.close_latched.store(true, Ordering::Release);
            return;
        }
        self.teardown();
    }

    fn offer_read(&self, bytes: Bytes) {
        let waiter = self.interior.with(self.id, |interior| match interior.waiting_reads.pop_front() {
            Some(waiter) => Some((waiter, bytes)),
            None => {
                interior.reads.push_back(bytes);
                None
            }
        });
        match waiter {
            Ok(Some((waiter, bytes))) => {
                waiter.succeed(bytes);
            }
            Ok(None) => {}
            Err(err) => warn!(session = %self.id, "cannot queue read: {err}"),
        }
    }

    /// 拆除：丢弃写队列、撤销空闲定时器、通知过滤器链，恰好执行一次。
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.state.fetch_max(SessionState::Closing as u8, Ordering::AcqRel);
        if let Some(supervisor) = self.idle.lock().take() {
            supervisor.deregister(self.id.get());
        }
        write::drain_on_close(self);
        match self
            .interior
            .with(self.id, |interior| std::mem::take(&mut interior.waiting_reads))
        {
            Ok(waiting) => {
                for waiter in waiting {
                    waiter.fail(BridgeError::SessionClosed { session_id: self.id });
                }
            }
            Err(err) => warn!(session = %self.id, "cannot fail pending reads: {err}"),
        }
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.stats
            .update_throughput(self.now(), self.config.throughput_interval, true);
        self.chain.fire_session_closed(self);
        if let Some(core) = self.service.upgrade() {
            core.unregister(self.id);
        }
        self.close_future.succeed(());
        debug!(session = %self.id, "session closed");
    }

    fn idle_gate(&self) -> IdleGate {
        if self.is_closing() {
            IdleGate::Closing
        } else if !self.affinity.is_attached() {
            IdleGate::Detached
        } else {
            IdleGate::Active
        }
    }
}

impl IdleTarget for Session {
    fn idle_key(&self) -> u64 {
        self.id.get()
    }

    fn idle_interval(&self, class: IdleClass) -> Duration {
        self.config.idle_time(class)
    }

    fn last_activity(&self, class: IdleClass) -> Instant {
        self.stats.last_activity(class)
    }

    fn last_idle_fire(&self, class: IdleClass) -> Option<Instant> {
        self.stats.last_idle(class)
    }

    fn idle_gate(&self) -> IdleGate {
        Session::idle_gate(self)
    }

    fn raise_idle(&self, class: IdleClass, at: Instant) {
        self.deliver_idle(class, at);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("remote", &self.channel.remote_addr())
            .field("chain", &self.chain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use tracing_test::traced_test;

    use crate::{
        IdleDriver, ServiceBuilder,
        error::BridgeError,
        filter::FilterChain,
        testing::{FilterEvent, MockTransport, RecordingFilter},
    };

    #[test]
    #[traced_test]
    fn io_exceptions_beyond_threshold_are_logged_not_delivered() {
        let transport = MockTransport::new();
        let recorder = RecordingFilter::new();
        let acceptor = ServiceBuilder::new(Arc::new(transport.clone()))
            .filter_chain(FilterChain::builder().add_last("recorder", recorder.clone()).build())
            .idle_driver(IdleDriver::Manual)
            .build_acceptor()
            .expect("构建接受端");
        let listen: SocketAddr = "127.0.0.1:7100".parse().expect("合法地址");
        acceptor.bind(&[listen]).expect("绑定");
        transport.connect_peer(listen).expect("建立连接");
        let session = acceptor.managed_sessions().pop().expect("存在会话");

        session.raise_exception(BridgeError::SessionClosed { session_id: session.id() });
        session.raise_exception(BridgeError::SessionClosed { session_id: session.id() });
        transport.event_loop().drain();

        assert_eq!(
            recorder.count(|event| matches!(event, FilterEvent::Exception(..))),
            1
        );
        assert!(logs_contain("suppressed exception"));
    }
}
