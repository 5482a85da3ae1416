//! [`Transport`] 的 TCP 实现。

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use gateway_session::{
    BridgeError, ServiceConfig, error,
    future::CompletionFuture,
    transport::{BoundChannel, ChannelEvents, ChannelInitializer, ConnectRequest, Transport},
};
use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    channel::{Command, Connection, ConnectionRegistry},
    config::{TcpConfigError, TcpTransportConfig},
    error::TcpTransportError,
    listener::{self, BoundListener, ListenerControl, ListenerRegistry},
    worker::Worker,
};

/// 工作线程池与连接登记，接受循环与建连任务共享。
pub(crate) struct Pool {
    config: TcpTransportConfig,
    workers: Vec<Arc<Worker>>,
    next_worker: AtomicUsize,
    next_channel: AtomicU64,
    connections: Arc<ConnectionRegistry>,
}

impl Pool {
    fn pick_worker(&self) -> Arc<Worker> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[index])
    }

    /// 应用套接字选项并组装连接；流必须已注册到 `worker` 的反应器。
    fn connection(
        &self,
        stream: TcpStream,
        worker: Arc<Worker>,
        events: Box<dyn ChannelEvents>,
    ) -> io::Result<Connection> {
        stream.set_nodelay(self.config.nodelay)?;
        SockRef::from(&stream).set_keepalive(self.config.keepalive)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Connection {
            id: self.next_channel.fetch_add(1, Ordering::Relaxed),
            stream,
            local,
            remote,
            events,
            worker,
            registry: Arc::clone(&self.connections),
            grace: self.config.shutdown_grace(),
        })
    }

    /// 把接受到的流迁移到轮转选出的工作线程并开始驱动。
    pub(crate) fn adopt(self: &Arc<Self>, stream: TcpStream, events: Box<dyn ChannelEvents>) {
        let detached = match stream.into_std() {
            Ok(detached) => detached,
            Err(cause) => {
                let cause = BridgeError::from_io(error::ACCEPT, cause);
                warn!(code = cause.code(), "dropping accepted connection: {cause}");
                return;
            }
        };
        let worker = self.pick_worker();
        let pool = Arc::clone(self);
        let target = Arc::clone(&worker);
        worker.spawn_task(async move {
            let adopted = TcpStream::from_std(detached)
                .and_then(|stream| pool.connection(stream, target, events));
            match adopted {
                Ok(connection) => connection.drive().await,
                Err(cause) => {
                    let cause = BridgeError::from_io(error::CONFIGURE, cause);
                    warn!(code = cause.code(), "dropping accepted connection: {cause}");
                }
            }
        });
    }
}

/// 基于 Tokio 的回调式 TCP 传输。
///
/// # 教案式说明
/// - **意图 (Why)**：为会话桥接层提供真实套接字上的 [`Transport`]，满足“连接固定在一个线程、
///   写按序完成、关闭恰好一次”的契约；
/// - **逻辑 (How)**：
///   - 启动固定数量的工作线程，连接按轮转分配；
///   - 绑定在调用线程上同步完成，接受循环运行在某个工作线程上；
///   - 建连在目标工作线程上执行并受请求中的超时约束；
/// - **契约 (What)**：
///   - [`TcpTransport::shutdown`] 关闭全部监听器，请求全部连接关闭，然后停止工作线程；
///     之后的绑定与建连立即失败；
///   - 丢弃传输等同于关停。
/// - **风险 (Trade-offs)**：关停只等待 `shutdown_grace_ms`；超时仍未收尾的连接随运行时一起丢弃，
///   丢弃时在途写以失败解决并补发 `on_closed`，但尚未写出的字节不再送达对端。
pub struct TcpTransport {
    pool: Arc<Pool>,
    listeners: Arc<ListenerRegistry>,
    shut: AtomicBool,
}

impl TcpTransport {
    /// 以 `workers` 个工作线程启动传输。
    pub fn new(workers: usize, config: TcpTransportConfig) -> Result<Self, TcpTransportError> {
        config.validate()?;
        if workers == 0 {
            return Err(TcpConfigError::Zero { key: "workers" }.into());
        }
        let grace = config.shutdown_grace();
        let mut spawned = Vec::with_capacity(workers);
        for index in 0..workers {
            match Worker::spawn(index, grace) {
                Ok(worker) => spawned.push(worker),
                Err(cause) => {
                    for worker in &spawned {
                        worker.stop();
                    }
                    return Err(TcpTransportError::Worker { index, cause });
                }
            }
        }
        info!(workers, "tcp transport started");
        Ok(Self {
            pool: Arc::new(Pool {
                config,
                workers: spawned,
                next_worker: AtomicUsize::new(0),
                next_channel: AtomicU64::new(1),
                connections: Arc::new(ConnectionRegistry::default()),
            }),
            listeners: Arc::new(ListenerRegistry::default()),
            shut: AtomicBool::new(false),
        })
    }

    /// 按服务配置的 `io_workers` 启动传输。
    pub fn for_service(
        service: &ServiceConfig,
        config: TcpTransportConfig,
    ) -> Result<Self, TcpTransportError> {
        Self::new(service.io_workers, config)
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.pool.config
    }

    pub fn worker_count(&self) -> usize {
        self.pool.workers.len()
    }

    pub fn live_connections(&self) -> usize {
        self.pool.connections.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> io::Result<()> {
        if self.is_shut_down() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tcp transport is shut down",
            ));
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn bind(
        &self,
        address: SocketAddr,
        initializer: Arc<dyn ChannelInitializer>,
    ) -> io::Result<Box<dyn BoundChannel>> {
        self.ensure_running()?;
        let bound = listener::listen(address, self.pool.config.backlog)?;
        let local = bound.local_addr()?;
        let worker = self.pool.pick_worker();
        let listener = worker.enter(|| TcpListener::from_std(bound))?;

        let (control, stopped) = ListenerControl::new(local, &self.listeners);
        self.listeners.insert(local, Arc::clone(&control));
        worker.spawn_task(listener::accept_loop(
            listener,
            Arc::clone(&self.pool),
            initializer,
            stopped,
            Arc::clone(&control),
        ));
        info!(%local, "tcp listener bound");
        Ok(Box::new(BoundListener { control }))
    }

    fn connect(
        &self,
        request: ConnectRequest,
        events: Box<dyn ChannelEvents>,
    ) -> CompletionFuture<()> {
        let established = CompletionFuture::new();
        if let Err(cause) = self.ensure_running() {
            established.fail(BridgeError::connect(request.remote, cause));
            return established;
        }
        let worker = self.pool.pick_worker();
        let pool = Arc::clone(&self.pool);
        let target = Arc::clone(&worker);
        let outcome = established.clone();
        worker.spawn_task(async move {
            let remote = request.remote;
            let timeout = request.timeout;
            let stream = match tokio::time::timeout(timeout, open_stream(request)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(cause)) => {
                    debug!(%remote, "connect failed: {cause}");
                    outcome.fail(BridgeError::connect(remote, cause));
                    return;
                }
                Err(_) => {
                    debug!(%remote, ?timeout, "connect timed out");
                    outcome.fail(BridgeError::ConnectTimeout { remote, timeout });
                    return;
                }
            };
            match pool.connection(stream, target, events) {
                Ok(connection) => {
                    outcome.succeed(());
                    connection.drive().await;
                }
                Err(cause) => {
                    outcome.fail(BridgeError::connect(remote, cause));
                }
            }
        });
        established
    }

    fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        let grace = self.pool.config.shutdown_grace();
        let controls: Vec<_> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for control in controls {
            if control.close().wait_timeout(grace).is_none() {
                debug!("listener did not close within the shutdown grace");
            }
        }
        for entry in self.pool.connections.iter() {
            let _ = entry.value().send(Command::Close);
        }
        for worker in &self.pool.workers {
            worker.stop();
        }
        info!("tcp transport shut down");
    }
}

async fn open_stream(request: ConnectRequest) -> io::Result<TcpStream> {
    let socket = if request.remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = request.local {
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;
    }
    socket.connect(request.remote).await
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("workers", &self.pool.workers)
            .field("listeners", &self.listeners.len())
            .field("connections", &self.live_connections())
            .field("shut", &self.is_shut_down())
            .finish()
    }
}
