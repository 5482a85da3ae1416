//! 传输层契约：桥接层只通过这里的 trait 与回调式通道传输交互。
//!
//! # 教案式说明
//! - **意图 (Why)**：套接字轮询循环由宿主平台的异步 I/O 提供，桥接层不关心其实现，
//!   只消费“已连接、收到消息、写完成、已关闭、异常”五类事件；
//! - **契约 (What)**：
//!   - 一个连接的全部事件在同一个工作线程上按顺序投递，该线程即会话的亲和线程，
//!     [`TransportChannel::executor`] 投递的任务也在该线程执行；
//!   - 同一通道上依次发出的写按顺序送达对端，写完成信号之间也不乱序；
//!   - `on_closed` 在 `on_connected` 之后恰好投递一次；投递前，所有在途写的完成信号都已解决；
//!   - 建连失败时，[`Transport::connect`] 返回的 future 以失败结束，事件处理器被直接丢弃。

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};

use crate::{
    error::BridgeError, executor::IoExecutor, future::CompletionFuture, message::FileRegion,
};

/// 交给传输层写出的负载。
#[derive(Clone, Debug)]
pub enum OutboundPayload {
    Bytes(Bytes),
    File(FileRegion),
}

impl OutboundPayload {
    pub fn len(&self) -> usize {
        match self {
            OutboundPayload::Bytes(bytes) => bytes.len(),
            OutboundPayload::File(region) => usize::try_from(region.count()).unwrap_or(usize::MAX),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 写完成信号，成功时交付写出的字节数。
pub type WriteCompletion = CompletionFuture<usize>;

/// 读缓冲的自适应范围。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadBufferSizing {
    pub min: usize,
    pub initial: usize,
    pub max: usize,
}

/// 单个连接的通道句柄。
pub trait TransportChannel: Send + Sync + 'static {
    fn id(&self) -> u64;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// 连接所在工作线程的执行器。
    fn executor(&self) -> Arc<dyn IoExecutor>;

    /// 发出一次写；返回的完成信号可能在返回前就已解决。
    fn write(&self, payload: OutboundPayload) -> WriteCompletion;

    /// 打开或关闭读兴趣。
    fn set_readable(&self, readable: bool);

    fn configure_reads(&self, sizing: ReadBufferSizing);

    /// 发起关闭，可在任意线程调用；关闭完成后投递 `on_closed`。
    fn close(&self);
}

/// 单个连接的事件处理器，由传输层独占并在连接所在线程上调用。
pub trait ChannelEvents: Send + 'static {
    fn on_connected(&mut self, channel: Arc<dyn TransportChannel>);

    fn on_message(&mut self, payload: BytesMut);

    fn on_write_complete(&mut self, written: usize);

    fn on_closed(&mut self);

    fn on_exception(&mut self, cause: BridgeError);
}

/// 为每个入站连接创建事件处理器。
pub trait ChannelInitializer: Send + Sync + 'static {
    fn init_channel(&self, remote: SocketAddr) -> Box<dyn ChannelEvents>;
}

impl<F> ChannelInitializer for F
where
    F: Fn(SocketAddr) -> Box<dyn ChannelEvents> + Send + Sync + 'static,
{
    fn init_channel(&self, remote: SocketAddr) -> Box<dyn ChannelEvents> {
        self(remote)
    }
}

/// 已绑定的监听句柄。
pub trait BoundChannel: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// 停止监听；监听套接字真正关闭后完成。
    fn close(&self) -> CompletionFuture<()>;
}

/// 一次出站连接请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
    pub timeout: Duration,
}

/// 回调式通道传输。
pub trait Transport: Send + Sync + 'static {
    /// 绑定地址并开始接受连接，每个入站连接通过 `initializer` 取得事件处理器。
    fn bind(
        &self,
        address: SocketAddr,
        initializer: Arc<dyn ChannelInitializer>,
    ) -> io::Result<Box<dyn BoundChannel>>;

    /// 发起连接；超时由传输层执行，失败以 [`BridgeError::Connect`] 或
    /// [`BridgeError::ConnectTimeout`] 结束。
    fn connect(
        &self,
        request: ConnectRequest,
        events: Box<dyn ChannelEvents>,
    ) -> CompletionFuture<()>;

    /// 释放传输资源。之后的绑定与连接请求全部失败。
    fn shutdown(&self);
}
