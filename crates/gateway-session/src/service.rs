//! 服务层公共骨架：会话组、配置快照、空闲监督器组与构建器。
//!
//! # 教案式说明
//! - **意图 (Why)**：接受端与连接端共享同一套会话管理逻辑，差别只在于连接从哪里来；
//! - **逻辑 (How)**：[`ServiceCore`] 持有会话组（`DashMap`）、以 `ArcSwap` 发布的配置快照、
//!   过滤器链与空闲监督器组；[`ServiceBuilder`] 校验配置后构造核心，再包装为
//!   [`Acceptor`] 或 [`Connector`]；
//! - **契约 (What)**：配置在会话创建时按快照拷贝，运行期更新只影响之后创建的会话。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use gateway_buffer::SharedBuffer;
use tracing::{debug, info, warn};

use crate::{
    acceptor::Acceptor,
    clock::{Clock, SystemClock},
    config::ServiceConfig,
    connector::Connector,
    error::{self, BridgeError},
    filter::FilterChain,
    future::WriteFuture,
    idle::IdleSupervisorPool,
    session::{Session, SessionId},
    stats::{ServiceStatistics, ServiceStats},
    transport::Transport,
};

/// 会话进入 `Open` 之前调用的初始化钩子，可用于设置属性或调整读兴趣。
pub type SessionInitializer = Arc<dyn Fn(&Session) + Send + Sync + 'static>;

/// 空闲监督器的驱动方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdleDriver {
    /// 每个监督器启动一条后台节拍线程。
    #[default]
    Background,
    /// 不启动线程，由调用方通过 `IdleSupervisorPool::tick` 推进。
    Manual,
}

pub(crate) struct ServiceCore {
    config: ArcSwap<ServiceConfig>,
    pub(crate) chain: FilterChain,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) idle: IdleSupervisorPool,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) initializer: Option<SessionInitializer>,
    sessions: DashMap<SessionId, Arc<Session>>,
    stats: ServiceStats,
    disposed: AtomicBool,
}

impl ServiceCore {
    pub(crate) fn config(&self) -> Arc<ServiceConfig> {
        self.config.load_full()
    }

    pub(crate) fn set_config(&self, config: ServiceConfig) -> Result<(), BridgeError> {
        self.ensure_active()?;
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub(crate) fn register(&self, session: &Arc<Session>) {
        if self
            .sessions
            .insert(session.id(), Arc::clone(session))
            .is_none()
        {
            self.stats.session_added();
        }
    }

    pub(crate) fn unregister(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            self.stats.session_removed();
        }
    }

    pub(crate) fn managed_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn statistics(&self) -> ServiceStatistics {
        self.stats.snapshot()
    }

    /// 把同一段字节写给全部受管会话；每个会话在自己的亲和线程上入队一个独立游标的共享缓冲。
    pub(crate) fn broadcast(&self, payload: Bytes) -> Vec<WriteFuture> {
        let shared = SharedBuffer::new(payload);
        self.managed_sessions()
            .into_iter()
            .map(|session| {
                let future = WriteFuture::new();
                let message = shared.fork();
                let relay = future.clone();
                session.run_on_affinity(move |session| match session.write(message) {
                    Ok(written) => written.add_listener(move |outcome| {
                        relay.complete(outcome.clone());
                    }),
                    Err(err) => {
                        relay.fail(err);
                    }
                });
                future
            })
            .collect()
    }

    /// 关闭全部受管会话并等待它们进入 `Closed`。
    pub(crate) fn close_sessions(&self, wait: Duration) {
        let pending: Vec<_> = self
            .managed_sessions()
            .into_iter()
            .map(|session| (session.id(), session.close()))
            .collect();
        for (id, future) in pending {
            if future.wait_timeout(wait).is_none() {
                warn!(session = %id, "session did not close within {:?}", wait);
            }
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), BridgeError> {
        if self.is_disposed() {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }

    /// 标记为已释放；只有第一个调用者返回 `true`。
    pub(crate) fn begin_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for ServiceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCore")
            .field("sessions", &self.sessions.len())
            .field("chain", &self.chain)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// 接受端与连接端的统一构建器。
///
/// ```ignore
/// let acceptor = ServiceBuilder::new(transport)
///     .config(ServiceConfig::from_toml_str(text)?)
///     .filter_chain(FilterChain::builder().add_last("timeout", WriteTimeoutFilter).build())
///     .build_acceptor()?;
/// ```
pub struct ServiceBuilder {
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    chain: FilterChain,
    clock: Arc<dyn Clock>,
    initializer: Option<SessionInitializer>,
    idle_driver: IdleDriver,
}

impl ServiceBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ServiceConfig::default(),
            chain: FilterChain::empty(),
            clock: Arc::new(SystemClock),
            initializer: None,
            idle_driver: IdleDriver::Background,
        }
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn filter_chain(mut self, chain: FilterChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn session_initializer(
        mut self,
        initializer: impl Fn(&Session) + Send + Sync + 'static,
    ) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn idle_driver(mut self, driver: IdleDriver) -> Self {
        self.idle_driver = driver;
        self
    }

    pub fn build_acceptor(self) -> Result<Acceptor, BridgeError> {
        Ok(Acceptor::from_core(self.build_core("acceptor")?))
    }

    pub fn build_connector(self) -> Result<Connector, BridgeError> {
        Ok(Connector::from_core(self.build_core("connector")?))
    }

    fn build_core(self, role: &'static str) -> Result<Arc<ServiceCore>, BridgeError> {
        self.config.validate()?;
        let size = self.config.idle_supervisors;
        let tick = self.config.idle_tick;
        let idle = match self.idle_driver {
            IdleDriver::Background => IdleSupervisorPool::spawn(size, Arc::clone(&self.clock), tick)
                .map_err(|err| BridgeError::from_io(error::CONFIGURE, err))?,
            IdleDriver::Manual => IdleSupervisorPool::manual(size, Arc::clone(&self.clock), tick),
        };
        info!(
            role,
            idle_supervisors = size,
            idle_tick_ms = tick.as_millis() as u64,
            filters = self.chain.len(),
            "session service ready"
        );
        debug!(role, driver = ?self.idle_driver, "idle supervisors started");
        Ok(Arc::new(ServiceCore {
            config: ArcSwap::from_pointee(self.config),
            chain: self.chain,
            clock: self.clock,
            idle,
            transport: self.transport,
            initializer: self.initializer,
            sessions: DashMap::new(),
            stats: ServiceStats::default(),
            disposed: AtomicBool::new(false),
        }))
    }
}

impl fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("config", &self.config)
            .field("chain", &self.chain)
            .field("idle_driver", &self.idle_driver)
            .finish()
    }
}
