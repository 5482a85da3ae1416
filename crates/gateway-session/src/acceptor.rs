//! 接受端：监听一组地址，为每个入站连接创建一个会话。

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::{
    config::ServiceConfig,
    error::{self, BindFailure, BridgeError},
    future::WriteFuture,
    handler::BridgeHandler,
    idle::IdleSupervisorPool,
    service::ServiceCore,
    session::{Session, SessionId},
    stats::ServiceStatistics,
    transport::{BoundChannel, ChannelEvents, ChannelInitializer},
};

/// 关停时等待单个会话或监听句柄关闭的上限。
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// 会话接受端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 管理“地址 → 监听句柄”映射与入站会话组；
/// - 绑定、解绑与释放发生在管理线程上，与 I/O 工作线程上的会话事件互不阻塞。
///
/// ## 契约 (What)
/// - [`Acceptor::bind`] 对每个地址独立绑定；部分失败不回滚已成功的地址，整体返回
///   [`BridgeError::Bind`]，其中逐个列出失败地址及原始原因；
/// - [`Acceptor::unbind`] 同步等待监听句柄真正关闭；
/// - [`Acceptor::dispose`] 依次关闭会话组、解绑全部地址、释放传输资源、释放空闲监督器，
///   只有第一次调用生效。
///
/// ## 注意事项 (Trade-offs)
/// - `unbind` 与 `dispose` 会阻塞调用线程，不能在 I/O 工作线程的事件回调中调用。
pub struct Acceptor {
    core: Arc<ServiceCore>,
    bindings: DashMap<SocketAddr, Box<dyn BoundChannel>>,
}

impl Acceptor {
    pub(crate) fn from_core(core: Arc<ServiceCore>) -> Self {
        Self {
            core,
            bindings: DashMap::new(),
        }
    }

    /// 绑定一组地址，返回实际绑定的本地地址（端口为 0 时由系统分配）。
    pub fn bind(&self, addresses: &[SocketAddr]) -> Result<Vec<SocketAddr>, BridgeError> {
        self.core.ensure_active()?;
        let initializer = self.channel_initializer();
        let mut bound = Vec::with_capacity(addresses.len());
        let mut failures = Vec::new();
        for &address in addresses {
            match self
                .core
                .transport
                .bind(address, Arc::clone(&initializer))
            {
                Ok(channel) => {
                    let local = channel.local_addr();
                    info!(%address, %local, "bound");
                    if let Some(previous) = self.bindings.insert(local, channel) {
                        let _ = previous.close();
                    }
                    bound.push(local);
                }
                Err(cause) => {
                    warn!(%address, "bind failed: {cause}");
                    failures.push(BindFailure {
                        address,
                        cause: Arc::new(cause),
                    });
                }
            }
        }
        if failures.is_empty() {
            Ok(bound)
        } else {
            Err(BridgeError::Bind {
                failures: Arc::new(failures),
            })
        }
    }

    /// 同步解绑；未绑定的地址被忽略。
    pub fn unbind(&self, addresses: &[SocketAddr]) -> Result<(), BridgeError> {
        let mut first_error = None;
        for address in addresses {
            let Some((_, channel)) = self.bindings.remove(address) else {
                debug!(%address, "unbind of unknown address ignored");
                continue;
            };
            let outcome = channel.close().wait_timeout(SHUTDOWN_WAIT).unwrap_or_else(|| {
                Err(BridgeError::from_io(
                    error::SHUTDOWN,
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "listener close timed out"),
                ))
            });
            match outcome {
                Ok(()) => info!(%address, "unbound"),
                Err(err) => {
                    warn!(%address, "unbind failed: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn local_addresses(&self) -> Vec<SocketAddr> {
        self.bindings.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_bound(&self, address: SocketAddr) -> bool {
        self.bindings.contains_key(&address)
    }

    pub fn managed_sessions(&self) -> Vec<Arc<Session>> {
        self.core.managed_sessions()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.core.session(id)
    }

    /// 向全部受管会话写出同一段字节，返回每个会话的写完成信号。
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> Vec<WriteFuture> {
        self.core.broadcast(payload.into())
    }

    pub fn statistics(&self) -> ServiceStatistics {
        self.core.statistics()
    }

    pub fn config(&self) -> Arc<ServiceConfig> {
        self.core.config()
    }

    /// 替换配置；只影响之后创建的会话。
    pub fn set_config(&self, config: ServiceConfig) -> Result<(), BridgeError> {
        self.core.set_config(config)
    }

    pub fn idle_supervisors(&self) -> &IdleSupervisorPool {
        &self.core.idle
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// 释放接受端。阻塞直到会话组与监听句柄全部关闭。
    pub fn dispose(&self) {
        if !self.core.begin_dispose() {
            return;
        }
        info!(sessions = self.core.statistics().managed_sessions, "disposing acceptor");
        self.core.close_sessions(SHUTDOWN_WAIT);
        let addresses = self.local_addresses();
        if let Err(err) = self.unbind(&addresses) {
            warn!("unbind during dispose failed: {err}");
        }
        self.core.transport.shutdown();
        self.core.idle.dispose();
    }

    fn channel_initializer(&self) -> Arc<dyn ChannelInitializer> {
        let core = Arc::clone(&self.core);
        Arc::new(move |_remote: SocketAddr| -> Box<dyn ChannelEvents> {
            Box::new(BridgeHandler::inbound(Arc::clone(&core)))
        })
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("bindings", &self.local_addresses())
            .field("core", &self.core)
            .finish()
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.dispose();
    }
}
