//! 监听套接字与接受循环。
//!
//! # 教案式说明
//! - **意图 (Why)**：绑定失败（地址占用、权限不足）必须在 [`Transport::bind`] 返回前同步报告，
//!   接受到的连接则要分散到各个工作线程；
//! - **逻辑 (How)**：
//!   - 用 `socket2` 创建、绑定并监听套接字，再在某个工作线程的运行时上下文中注册为 Tokio 监听器；
//!   - 接受循环把每个入站流转回标准库套接字，交给轮转选出的工作线程重新注册并驱动；
//! - **契约 (What)**：[`BoundListener::close`] 返回的 future 在监听套接字真正关闭后完成，
//!   重复调用返回同一个 future。
//!
//! [`Transport::bind`]: gateway_session::transport::Transport::bind

use std::{
    io,
    net::{self, SocketAddr},
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use gateway_session::{
    BridgeError, error,
    future::CompletionFuture,
    transport::{BoundChannel, ChannelInitializer},
};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{debug, info, warn};

use crate::transport::Pool;

/// 接受失败（例如文件描述符耗尽）后的退避时长。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) type ListenerRegistry = DashMap<SocketAddr, Arc<ListenerControl>>;

/// 创建处于监听状态的非阻塞标准库监听器。
pub(crate) fn listen(address: SocketAddr, backlog: u32) -> io::Result<net::TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    Ok(socket.into())
}

pub(crate) struct ListenerControl {
    local: SocketAddr,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    closed: CompletionFuture<()>,
    registry: Weak<ListenerRegistry>,
}

impl ListenerControl {
    pub(crate) fn new(
        local: SocketAddr,
        registry: &Arc<ListenerRegistry>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (stop, stopped) = oneshot::channel();
        let control = Arc::new(Self {
            local,
            stop: Mutex::new(Some(stop)),
            closed: CompletionFuture::new(),
            registry: Arc::downgrade(registry),
        });
        (control, stopped)
    }

    pub(crate) fn close(&self) -> CompletionFuture<()> {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.local, |_, entry| std::ptr::eq(Arc::as_ptr(entry), self));
        }
        if let Some(stop) = self.stop.lock().take()
            && stop.send(()).is_err()
        {
            // 接受循环已经退出
            self.closed.succeed(());
        }
        self.closed.clone()
    }
}

/// [`Transport::bind`](gateway_session::transport::Transport::bind) 返回的监听句柄。
pub(crate) struct BoundListener {
    pub(crate) control: Arc<ListenerControl>,
}

impl BoundChannel for BoundListener {
    fn local_addr(&self) -> SocketAddr {
        self.control.local
    }

    fn close(&self) -> CompletionFuture<()> {
        self.control.close()
    }
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    pool: Arc<Pool>,
    initializer: Arc<dyn ChannelInitializer>,
    mut stopped: oneshot::Receiver<()>,
    control: Arc<ListenerControl>,
) {
    let local = control.local;
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%local, %remote, "accepted connection");
                    let events = initializer.init_channel(remote);
                    pool.adopt(stream, events);
                }
                Err(cause) => {
                    let cause = BridgeError::from_io(error::ACCEPT, cause);
                    warn!(%local, code = cause.code(), "accept failed: {cause}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    drop(listener);
    info!(%local, "tcp listener closed");
    control.closed.succeed(());
}
