//! 连接端：发起出站连接，每次成功连接产生一个会话。

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    config::ServiceConfig,
    error::BridgeError,
    future::CompletionFuture,
    handler::BridgeHandler,
    idle::IdleSupervisorPool,
    service::{ServiceCore, SessionInitializer},
    session::{Session, SessionId},
    stats::ServiceStatistics,
    transport::ConnectRequest,
};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// 出站连接的完成信号，成功时交付已进入 `Open` 的会话。
pub type ConnectFuture = CompletionFuture<Arc<Session>>;

/// 会话连接端。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - [`Connector::connect`] 返回的 future 恰好解决一次：建连失败或超时时以
///   [`BridgeError::Connect`]/[`BridgeError::ConnectTimeout`] 失败；成功时在会话完成初始化
///   （过滤器链、空闲监督登记、进入 `Open`）后交付会话；
/// - 连接超时取自服务配置 `connect_timeout`，由传输层执行；
/// - 释放流程与 [`Acceptor`](crate::Acceptor) 对称：关闭会话组、释放传输资源、释放空闲监督器。
pub struct Connector {
    core: Arc<ServiceCore>,
}

impl Connector {
    pub(crate) fn from_core(core: Arc<ServiceCore>) -> Self {
        Self { core }
    }

    /// 以服务级初始化钩子连接 `remote`。
    pub fn connect(&self, remote: SocketAddr) -> ConnectFuture {
        self.connect_with(remote, None, None)
    }

    /// 发起连接；`initializer` 覆盖服务级初始化钩子，仅作用于本次连接产生的会话。
    pub fn connect_with(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        initializer: Option<SessionInitializer>,
    ) -> ConnectFuture {
        let established = ConnectFuture::new();
        if let Err(err) = self.core.ensure_active() {
            established.fail(err);
            return established;
        }
        let timeout = self.core.config().connect_timeout;
        debug!(%remote, ?local, timeout_ms = timeout.as_millis() as u64, "connecting");
        let handler = BridgeHandler::outbound(
            Arc::clone(&self.core),
            initializer,
            established.clone(),
        );
        let attempt = self.core.transport.connect(
            ConnectRequest {
                remote,
                local,
                timeout,
            },
            Box::new(handler),
        );
        let relay = established.clone();
        attempt.add_listener(move |outcome| {
            if let Err(err) = outcome {
                warn!(%remote, code = err.code(), "connect failed: {err}");
                relay.fail(err.clone());
            }
        });
        established
    }

    pub fn managed_sessions(&self) -> Vec<Arc<Session>> {
        self.core.managed_sessions()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.core.session(id)
    }

    pub fn statistics(&self) -> ServiceStatistics {
        self.core.statistics()
    }

    pub fn config(&self) -> Arc<ServiceConfig> {
        self.core.config()
    }

    pub fn set_config(&self, config: ServiceConfig) -> Result<(), BridgeError> {
        self.core.set_config(config)
    }

    pub fn idle_supervisors(&self) -> &IdleSupervisorPool {
        &self.core.idle
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// 释放连接端。阻塞直到会话组全部关闭。
    pub fn dispose(&self) {
        if !self.core.begin_dispose() {
            return;
        }
        info!(sessions = self.core.statistics().managed_sessions, "disposing connector");
        self.core.close_sessions(SHUTDOWN_WAIT);
        self.core.transport.shutdown();
        self.core.idle.dispose();
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector").field("core", &self.core).finish()
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.dispose();
    }
}
