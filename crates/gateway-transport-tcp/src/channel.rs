//! 单个 TCP 连接：通道句柄与驱动任务。
//!
//! # 教案式说明
//! - **意图 (Why)**：会话只认识 [`TransportChannel`] 与 [`ChannelEvents`]，
//!   本模块把一条 Tokio `TcpStream` 变成这两个契约；
//! - **逻辑 (How)**：
//!   - 通道句柄只持有命令发送端，写、读兴趣、读缓冲范围与关闭都以命令送达驱动任务；
//!   - 驱动任务独占事件处理器，在 `select!` 中依次照看命令、写完成与读取；
//!   - 写半部交给同线程上的写任务，写按提交顺序写出，结果按同样顺序回报；
//!   - 读缓冲大小按最近的读取量自适应调整；
//! - **契约 (What)**：
//!   - 全部回调在连接所在的工作线程上执行；
//!   - 写失败时先让全部在途写失败，再投递异常，最后投递 `on_closed`；
//!   - 本端请求关闭时先停止读取，等已发出的写在宽限期内写完，再关闭连接；
//!   - 对端正常关闭或本端请求关闭时不投递异常。

use std::{collections::VecDeque, io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use gateway_session::{
    BridgeError, error,
    executor::IoExecutor,
    transport::{
        ChannelEvents, OutboundPayload, ReadBufferSizing, TransportChannel, WriteCompletion,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::mpsc,
};
use tracing::{debug, trace};

use crate::worker::Worker;

/// 会话未配置读缓冲范围前使用的默认值。
pub(crate) const DEFAULT_SIZING: ReadBufferSizing = ReadBufferSizing {
    min: 64,
    initial: 2048,
    max: 65_536,
};

pub(crate) enum Command {
    Write(OutboundPayload, WriteCompletion),
    SetReadable(bool),
    Configure(ReadBufferSizing),
    Close,
}

/// 存活连接的命令入口，供传输关停时逐个关闭。
pub(crate) type ConnectionRegistry = DashMap<u64, mpsc::UnboundedSender<Command>>;

pub(crate) struct TcpChannel {
    id: u64,
    local: SocketAddr,
    remote: SocketAddr,
    worker: Arc<Worker>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TransportChannel for TcpChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn executor(&self) -> Arc<dyn IoExecutor> {
        self.worker.clone()
    }

    fn write(&self, payload: OutboundPayload) -> WriteCompletion {
        let completion = WriteCompletion::new();
        if self
            .commands
            .send(Command::Write(payload, completion.clone()))
            .is_err()
        {
            completion.fail(channel_gone());
        }
        completion
    }

    fn set_readable(&self, readable: bool) {
        let _ = self.commands.send(Command::SetReadable(readable));
    }

    fn configure_reads(&self, sizing: ReadBufferSizing) {
        let _ = self.commands.send(Command::Configure(sizing));
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

fn channel_gone() -> BridgeError {
    BridgeError::from_io(
        error::WRITE,
        io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"),
    )
}

/// 按读取量自适应的读缓冲大小。
///
/// 一次读取填满缓冲时翻倍；连续两次读取不足一半时减半；结果始终落在 `[min, max]` 内。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReadSizer {
    sizing: ReadBufferSizing,
    current: usize,
    short_reads: u8,
}

impl ReadSizer {
    pub(crate) fn new(sizing: ReadBufferSizing) -> Self {
        Self {
            sizing,
            current: sizing.initial.clamp(sizing.min, sizing.max),
            short_reads: 0,
        }
    }

    pub(crate) fn current(&self) -> usize {
        self.current
    }

    pub(crate) fn record(&mut self, read: usize) {
        if read >= self.current {
            self.current = self.current.saturating_mul(2).min(self.sizing.max);
            self.short_reads = 0;
        } else if read < self.current / 2 {
            self.short_reads += 1;
            if self.short_reads >= 2 {
                self.current = (self.current / 2).max(self.sizing.min);
                self.short_reads = 0;
            }
        } else {
            self.short_reads = 0;
        }
    }
}

/// 驱动任务的退出原因。
enum Ending {
    Requested,
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// 连接的回调端：事件处理器、在途写与命令入口。
///
/// 正常退出时由 [`Endpoint::finish`] 收尾；驱动任务被直接丢弃（工作线程宽限期过后运行时被销毁）
/// 时，`Drop` 按本端中止收尾，在途写与尚未取出的写命令都以失败解决，`on_closed` 照常投递。
struct Endpoint {
    id: u64,
    events: Box<dyn ChannelEvents>,
    commands: mpsc::UnboundedReceiver<Command>,
    in_flight: VecDeque<WriteCompletion>,
    finished: bool,
}

impl Endpoint {
    /// 写任务按提交顺序回报，结果归属队首的在途写。
    fn written(&mut self, written: usize) {
        if let Some(completion) = self.in_flight.pop_front() {
            completion.succeed(written);
        }
        self.events.on_write_complete(written);
    }

    /// 本端关闭后等待已交给写任务的写全部写出；写失败时返回原因。
    async fn flush_in_flight(
        &mut self,
        outcomes: &mut mpsc::UnboundedReceiver<io::Result<usize>>,
    ) -> Option<io::Error> {
        while !self.in_flight.is_empty() {
            match outcomes.recv().await {
                Some(Ok(written)) => self.written(written),
                Some(Err(cause)) => return Some(cause),
                None => return Some(writer_stopped()),
            }
        }
        None
    }

    /// 收下写任务已经回报、但驱动循环还没来得及处理的成功结果。
    fn collect_reported(&mut self, outcomes: &mut mpsc::UnboundedReceiver<io::Result<usize>>) {
        while !self.in_flight.is_empty() {
            match outcomes.try_recv() {
                Ok(Ok(written)) => self.written(written),
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }

    fn finish(&mut self, ending: Ending) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        let id = self.id;
        let (pending_error, exception) = match ending {
            Ending::Requested => (
                io_failure(error::WRITE, io::ErrorKind::ConnectionAborted),
                None,
            ),
            Ending::PeerClosed => (io_failure(error::WRITE, io::ErrorKind::BrokenPipe), None),
            Ending::ReadFailed(cause) => (
                io_failure(error::WRITE, cause.kind()),
                Some(BridgeError::from_io(error::READ, cause)),
            ),
            Ending::WriteFailed(cause) => {
                let failure = BridgeError::from_io(error::WRITE, cause);
                (failure.clone(), Some(failure))
            }
        };
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Write(_, completion) = command {
                self.in_flight.push_back(completion);
            }
        }
        if !self.in_flight.is_empty() {
            debug!(channel = id, pending = self.in_flight.len(), "failing in-flight writes");
        }
        for completion in self.in_flight.drain(..) {
            completion.fail(pending_error.clone());
        }
        if let Some(cause) = exception {
            self.events.on_exception(cause);
        }
        self.events.on_closed();
        trace!(channel = id, "channel closed");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.finished {
            debug!(channel = self.id, "connection task dropped before close");
            self.finish(Ending::Requested);
        }
    }
}

pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) stream: TcpStream,
    pub(crate) local: SocketAddr,
    pub(crate) remote: SocketAddr,
    pub(crate) events: Box<dyn ChannelEvents>,
    pub(crate) worker: Arc<Worker>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    /// 本端关闭后等待在途写写出的上限。
    pub(crate) grace: Duration,
}

impl Connection {
    /// 在连接所在的工作线程上运行，直到连接关闭。
    pub(crate) async fn drive(self) {
        let Connection {
            id,
            stream,
            local,
            remote,
            events,
            worker,
            registry,
            grace,
        } = self;
        let _live = worker.track_connection();
        let (mut reader, writer) = stream.into_split();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        registry.insert(id, commands_tx.clone());

        let (payloads, queued) = mpsc::unbounded_channel();
        let (reports, mut outcomes) = mpsc::unbounded_channel();
        let write_task = tokio::spawn(write_loop(writer, queued, reports));

        let mut endpoint = Endpoint {
            id,
            events,
            commands,
            in_flight: VecDeque::new(),
            finished: false,
        };
        endpoint.events.on_connected(Arc::new(TcpChannel {
            id,
            local,
            remote,
            worker: Arc::clone(&worker),
            commands: commands_tx,
        }));
        trace!(channel = id, %remote, "channel connected");

        let mut sizer = ReadSizer::new(DEFAULT_SIZING);
        let mut readable = true;
        let mut buffer = BytesMut::new();

        let ending = loop {
            if buffer.is_empty() {
                buffer.resize(sizer.current(), 0);
            }
            tokio::select! {
                biased;
                command = endpoint.commands.recv() => match command {
                    Some(Command::Write(payload, completion)) => {
                        if payloads.send(payload).is_err() {
                            completion.fail(channel_gone());
                        } else {
                            endpoint.in_flight.push_back(completion);
                        }
                    }
                    Some(Command::SetReadable(value)) => readable = value,
                    Some(Command::Configure(sizing)) => {
                        sizer = ReadSizer::new(sizing);
                        buffer.clear();
                    }
                    Some(Command::Close) | None => break Ending::Requested,
                },
                outcome = outcomes.recv() => match outcome {
                    Some(Ok(written)) => endpoint.written(written),
                    Some(Err(cause)) => break Ending::WriteFailed(cause),
                    None => break Ending::WriteFailed(writer_stopped()),
                },
                read = reader.read(&mut buffer[..]), if readable => match read {
                    Ok(0) => break Ending::PeerClosed,
                    Ok(count) => {
                        sizer.record(count);
                        buffer.truncate(count);
                        endpoint.events.on_message(std::mem::take(&mut buffer));
                    }
                    Err(cause) => break Ending::ReadFailed(cause),
                },
            }
        };

        registry.remove(&id);
        drop(reader);
        // 不再接收新写；写任务写完已排队的负载后自行退出并关闭写半部
        drop(payloads);
        let ending = match ending {
            Ending::Requested => {
                match tokio::time::timeout(grace, endpoint.flush_in_flight(&mut outcomes)).await {
                    Ok(None) => Ending::Requested,
                    Ok(Some(cause)) => Ending::WriteFailed(cause),
                    Err(_) => {
                        debug!(channel = id, pending = endpoint.in_flight.len(), "close grace elapsed with writes in flight");
                        Ending::Requested
                    }
                }
            }
            ending => {
                endpoint.collect_reported(&mut outcomes);
                ending
            }
        };
        write_task.abort();
        endpoint.finish(ending);
    }
}

fn writer_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped")
}

fn io_failure(operation: error::OperationKind, kind: io::ErrorKind) -> BridgeError {
    BridgeError::from_io(
        operation,
        io::Error::new(kind, "connection closed with pending write"),
    )
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut payloads: mpsc::UnboundedReceiver<OutboundPayload>,
    reports: mpsc::UnboundedSender<io::Result<usize>>,
) {
    while let Some(payload) = payloads.recv().await {
        let outcome = write_payload(&mut writer, payload).await;
        let failed = outcome.is_err();
        if reports.send(outcome).is_err() || failed {
            break;
        }
    }
}

async fn write_payload(writer: &mut OwnedWriteHalf, payload: OutboundPayload) -> io::Result<usize> {
    let bytes: Bytes = match payload {
        OutboundPayload::Bytes(bytes) => bytes,
        OutboundPayload::File(region) => region.read_to_bytes()?,
    };
    writer.write_all(&bytes).await?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// 只记录回调名称的事件处理器。
    struct Journal(Arc<Mutex<Vec<&'static str>>>);

    impl ChannelEvents for Journal {
        fn on_connected(&mut self, _channel: Arc<dyn TransportChannel>) {
            self.0.lock().push("connected");
        }

        fn on_message(&mut self, _payload: BytesMut) {
            self.0.lock().push("message");
        }

        fn on_write_complete(&mut self, _written: usize) {
            self.0.lock().push("write_complete");
        }

        fn on_closed(&mut self) {
            self.0.lock().push("closed");
        }

        fn on_exception(&mut self, _cause: BridgeError) {
            self.0.lock().push("exception");
        }
    }

    fn endpoint(
        calls: &Arc<Mutex<Vec<&'static str>>>,
    ) -> (Endpoint, mpsc::UnboundedSender<Command>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let endpoint = Endpoint {
            id: 1,
            events: Box::new(Journal(Arc::clone(calls))),
            commands,
            in_flight: VecDeque::new(),
            finished: false,
        };
        (endpoint, commands_tx)
    }

    #[test]
    fn dropped_task_fails_outstanding_writes_and_reports_closed() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (mut endpoint, commands) = endpoint(&calls);
        let in_flight = WriteCompletion::new();
        endpoint.in_flight.push_back(in_flight.clone());
        let queued = WriteCompletion::new();
        let payload = OutboundPayload::Bytes(Bytes::from_static(b"late"));
        assert!(commands.send(Command::Write(payload, queued.clone())).is_ok());

        drop(endpoint);

        let err = in_flight
            .result()
            .expect("在途写已解决")
            .expect_err("在途写失败");
        assert_eq!(
            err.io_cause().map(io::Error::kind),
            Some(io::ErrorKind::ConnectionAborted)
        );
        assert!(queued.result().is_some_and(|outcome| outcome.is_err()), "未取出的写命令也失败");
        assert_eq!(*calls.lock(), vec!["closed"], "本端中止不投递异常");
    }

    #[test]
    fn finished_endpoint_reports_closed_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (mut endpoint, _commands) = endpoint(&calls);
        let written = WriteCompletion::new();
        endpoint.in_flight.push_back(written.clone());
        endpoint.written(4);
        endpoint.finish(Ending::PeerClosed);
        drop(endpoint);

        assert_eq!(written.result().and_then(Result::ok), Some(4));
        assert_eq!(*calls.lock(), vec!["write_complete", "closed"]);
    }

    const SIZING: ReadBufferSizing = ReadBufferSizing {
        min: 64,
        initial: 256,
        max: 1024,
    };

    #[test]
    fn full_reads_double_up_to_max() {
        let mut sizer = ReadSizer::new(SIZING);
        sizer.record(256);
        assert_eq!(sizer.current(), 512);
        sizer.record(512);
        sizer.record(1024);
        assert_eq!(sizer.current(), 1024, "不超过上限");
    }

    #[test]
    fn two_consecutive_short_reads_halve() {
        let mut sizer = ReadSizer::new(SIZING);
        sizer.record(10);
        assert_eq!(sizer.current(), 256, "单次短读不收缩");
        sizer.record(10);
        assert_eq!(sizer.current(), 128);
        sizer.record(1);
        sizer.record(1);
        sizer.record(1);
        sizer.record(1);
        assert_eq!(sizer.current(), 64, "不低于下限");
    }

    #[test]
    fn medium_read_resets_the_short_streak() {
        let mut sizer = ReadSizer::new(SIZING);
        sizer.record(10);
        sizer.record(200);
        sizer.record(10);
        assert_eq!(sizer.current(), 256);
    }

    #[test]
    fn initial_size_is_clamped() {
        let sizer = ReadSizer::new(ReadBufferSizing {
            min: 64,
            initial: 4096,
            max: 1024,
        });
        assert_eq!(sizer.current(), 1024);
    }
}
