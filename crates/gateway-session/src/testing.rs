//! 内存测试工具：单线程事件循环、内存传输与记录型过滤器。
//!
//! # 教案式说明
//! - **意图 (Why)**：会话的亲和约束要求事件在固定线程上投递；测试若直接在测试线程上驱动，
//!   就无法验证跨线程调用被拒绝。这里提供一条真实的事件循环线程，测试线程扮演“外部线程”；
//! - **逻辑 (How)**：
//!   - [`EventLoop`] 是一个只执行任务的后台线程，实现 [`IoExecutor`]；
//!   - [`MockTransport`] 实现 [`Transport`]，所有通道事件都投递到同一个事件循环；
//!   - [`MockPeer`] 代表连接的对端，测试通过它注入数据、完成写、关闭或重置连接；
//! - **契约 (What)**：与真实传输相同，`on_closed` 恰好投递一次，投递前所有在途写都已解决。

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use gateway_buffer::IoBuffer;
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{self, BridgeError},
    executor::{IoExecutor, Task},
    filter::Filter,
    future::CompletionFuture,
    idle::IdleClass,
    session::{Session, SessionId},
    transport::{
        BoundChannel, ChannelEvents, ChannelInitializer, ConnectRequest, OutboundPayload,
        ReadBufferSizing, Transport, TransportChannel, WriteCompletion,
    },
    write::WriteRequest,
};

/// 单线程事件循环，扮演传输层的一个 I/O 工作线程。
pub struct EventLoop {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    thread_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn spawn(name: &str) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("启动事件循环线程");
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            thread_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// 在事件循环上执行 `f` 并等待结果；已在循环线程上时直接执行。
    pub fn run_sync<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_loop_thread() {
            return f();
        }
        let (tx, rx) = mpsc::channel();
        self.execute(Box::new(move || {
            let _ = tx.send(f());
        }));
        rx.recv().expect("事件循环任务未返回结果")
    }

    /// 等待此前投递的全部任务执行完毕。
    pub fn drain(&self) {
        self.run_sync(|| ());
    }
}

impl IoExecutor for EventLoop {
    fn execute(&self, task: Task) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(task);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take()
            && thread::current().id() != self.thread_id
        {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

/// 内存传输的写完成方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// 写在 `write` 返回前完成。
    #[default]
    Immediate,
    /// 写保持在途，直到测试调用 [`MockPeer::complete_writes`]。
    Deferred,
}

struct Link {
    id: u64,
    local: SocketAddr,
    remote: SocketAddr,
    event_loop: Arc<EventLoop>,
    events: Mutex<Option<Box<dyn ChannelEvents>>>,
    mode: Arc<Mutex<WriteMode>>,
    written: Mutex<Vec<Bytes>>,
    pending: Mutex<VecDeque<(Bytes, WriteCompletion)>>,
    backlog: Mutex<VecDeque<BytesMut>>,
    readable: AtomicBool,
    sizing: Mutex<Option<ReadBufferSizing>>,
    closed: AtomicBool,
    close_requests: AtomicUsize,
}

impl Link {
    /// 在当前（循环）线程上调用事件处理器；回调期间不持有锁。
    fn with_events(&self, f: impl FnOnce(&mut dyn ChannelEvents)) {
        let taken = self.events.lock().take();
        if let Some(mut events) = taken {
            f(events.as_mut());
            let mut slot = self.events.lock();
            if slot.is_none() && !self.closed.load(Ordering::Acquire) {
                *slot = Some(events);
            }
        }
    }

    fn post(self: &Arc<Self>, f: impl FnOnce(&mut dyn ChannelEvents) + Send + 'static) {
        let link = Arc::clone(self);
        self.event_loop
            .execute(Box::new(move || link.with_events(f)));
    }

    fn deliver(self: &Arc<Self>, payload: BytesMut) {
        if !self.readable.load(Ordering::Acquire) {
            self.backlog.lock().push_back(payload);
            return;
        }
        self.with_events(move |events| events.on_message(payload));
    }

    /// 关闭连接：先让在途写失败，再投递异常（可选）与 `on_closed`。
    fn shut(self: &Arc<Self>, write_error: io::ErrorKind, exception: Option<BridgeError>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        for (_, completion) in pending {
            completion.fail(BridgeError::from_io(
                error::WRITE,
                io::Error::new(write_error, "connection closed with pending write"),
            ));
        }
        if let Some(cause) = exception {
            self.with_events(move |events| events.on_exception(cause));
        }
        let taken = self.events.lock().take();
        self.closed.store(true, Ordering::Release);
        if let Some(mut events) = taken {
            events.on_closed();
        }
    }

    fn record(&self, bytes: Bytes) {
        self.written.lock().push(bytes);
    }
}

struct MockChannel {
    link: Arc<Link>,
}

impl TransportChannel for MockChannel {
    fn id(&self) -> u64 {
        self.link.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.link.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.link.remote
    }

    fn executor(&self) -> Arc<dyn IoExecutor> {
        self.link.event_loop.clone()
    }

    fn write(&self, payload: OutboundPayload) -> WriteCompletion {
        if self.link.closed.load(Ordering::Acquire) {
            return WriteCompletion::failed(BridgeError::from_io(
                error::WRITE,
                io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"),
            ));
        }
        let bytes = match payload {
            OutboundPayload::Bytes(bytes) => bytes,
            OutboundPayload::File(region) => match region.read_to_bytes() {
                Ok(bytes) => bytes,
                Err(err) => return WriteCompletion::failed(BridgeError::from_io(error::WRITE, err)),
            },
        };
        let mode = *self.link.mode.lock();
        match mode {
            WriteMode::Immediate => {
                let len = bytes.len();
                self.link.record(bytes);
                self.link.post(move |events| events.on_write_complete(len));
                WriteCompletion::succeeded(len)
            }
            WriteMode::Deferred => {
                let completion = WriteCompletion::new();
                self.link
                    .pending
                    .lock()
                    .push_back((bytes, completion.clone()));
                completion
            }
        }
    }

    fn set_readable(&self, readable: bool) {
        self.link.readable.store(readable, Ordering::Release);
        if readable {
            let link = Arc::clone(&self.link);
            self.link.event_loop.execute(Box::new(move || {
                while link.readable.load(Ordering::Acquire) {
                    let Some(payload) = link.backlog.lock().pop_front() else {
                        break;
                    };
                    link.with_events(move |events| events.on_message(payload));
                }
            }));
        }
    }

    fn configure_reads(&self, sizing: ReadBufferSizing) {
        *self.link.sizing.lock() = Some(sizing);
    }

    fn close(&self) {
        self.link.close_requests.fetch_add(1, Ordering::AcqRel);
        let link = Arc::clone(&self.link);
        self.link.event_loop.execute(Box::new(move || {
            link.shut(io::ErrorKind::ConnectionAborted, None);
        }));
    }
}

/// 连接的对端，由测试线程操纵。
#[derive(Clone)]
pub struct MockPeer {
    link: Arc<Link>,
}

impl MockPeer {
    /// 对端地址，即会话的 `remote_addr`。
    pub fn addr(&self) -> SocketAddr {
        self.link.remote
    }

    /// 会话一侧的本地地址。
    pub fn session_addr(&self) -> SocketAddr {
        self.link.local
    }

    /// 向会话发送一段数据，返回前数据已交付给事件处理器（读兴趣关闭时进入积压）。
    pub fn send(&self, data: &[u8]) {
        let link = Arc::clone(&self.link);
        let payload = BytesMut::from(data);
        self.link.event_loop.run_sync(move || link.deliver(payload));
    }

    /// 对端已收到的全部字节。
    pub fn written(&self) -> Vec<u8> {
        self.link
            .written
            .lock()
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .collect()
    }

    /// 对端已收到的写，每次传输层写一项。
    pub fn written_chunks(&self) -> Vec<Bytes> {
        self.link.written.lock().clone()
    }

    pub fn pending_writes(&self) -> usize {
        self.link.pending.lock().len()
    }

    /// 按顺序完成至多 `count` 个在途写，返回实际完成的数量。
    pub fn complete_writes(&self, count: usize) -> usize {
        let link = Arc::clone(&self.link);
        self.link.event_loop.run_sync(move || {
            let mut completed = 0;
            while completed < count {
                let Some((bytes, completion)) = link.pending.lock().pop_front() else {
                    break;
                };
                let len = bytes.len();
                link.record(bytes);
                completion.succeed(len);
                link.with_events(move |events| events.on_write_complete(len));
                completed += 1;
            }
            completed
        })
    }

    /// 对端有序关闭。
    pub fn close(&self) {
        let link = Arc::clone(&self.link);
        self.link
            .event_loop
            .run_sync(move || link.shut(io::ErrorKind::BrokenPipe, None));
    }

    /// 对端重置连接：在途写失败，随后投递一个传输异常与 `on_closed`。
    pub fn reset(&self) {
        let link = Arc::clone(&self.link);
        self.link.event_loop.run_sync(move || {
            let cause = BridgeError::from_io(
                error::READ,
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
            );
            link.shut(io::ErrorKind::ConnectionReset, Some(cause));
        });
    }

    /// 直接投递一个异常事件。
    pub fn raise(&self, cause: BridgeError) {
        let link = Arc::clone(&self.link);
        self.link
            .event_loop
            .run_sync(move || link.with_events(move |events| events.on_exception(cause)));
    }

    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::Acquire)
    }

    pub fn is_readable(&self) -> bool {
        self.link.readable.load(Ordering::Acquire)
    }

    pub fn read_sizing(&self) -> Option<ReadBufferSizing> {
        *self.link.sizing.lock()
    }

    /// 会话一侧调用 `TransportChannel::close` 的次数。
    pub fn close_requests(&self) -> usize {
        self.link.close_requests.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeer")
            .field("addr", &self.link.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct MockInner {
    event_loop: Arc<EventLoop>,
    listeners: Mutex<HashMap<SocketAddr, Arc<dyn ChannelInitializer>>>,
    occupied: Mutex<HashSet<SocketAddr>>,
    refused: Mutex<HashSet<SocketAddr>>,
    unresponsive: Mutex<HashSet<SocketAddr>>,
    peers: Mutex<Vec<MockPeer>>,
    connects: Mutex<Vec<ConnectRequest>>,
    mode: Arc<Mutex<WriteMode>>,
    next_id: AtomicU64,
    next_port: AtomicU16,
    shut_down: AtomicBool,
    shutdowns: AtomicUsize,
}

/// 内存传输：所有连接共享一个事件循环线程。
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                event_loop: EventLoop::spawn("gateway-mock-io"),
                listeners: Mutex::new(HashMap::new()),
                occupied: Mutex::new(HashSet::new()),
                refused: Mutex::new(HashSet::new()),
                unresponsive: Mutex::new(HashSet::new()),
                peers: Mutex::new(Vec::new()),
                connects: Mutex::new(Vec::new()),
                mode: Arc::new(Mutex::new(WriteMode::Immediate)),
                next_id: AtomicU64::new(1),
                next_port: AtomicU16::new(40_000),
                shut_down: AtomicBool::new(false),
                shutdowns: AtomicUsize::new(0),
            }),
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.inner.event_loop
    }

    /// 模拟被其它进程占用的地址。
    pub fn occupy(&self, address: SocketAddr) {
        self.inner.occupied.lock().insert(address);
    }

    /// 连接该地址时立即被拒绝。
    pub fn refuse(&self, remote: SocketAddr) {
        self.inner.refused.lock().insert(remote);
    }

    /// 连接该地址时以超时失败。
    pub fn black_hole(&self, remote: SocketAddr) {
        self.inner.unresponsive.lock().insert(remote);
    }

    /// 设置此后所有写的完成方式。
    pub fn set_write_mode(&self, mode: WriteMode) {
        *self.inner.mode.lock() = mode;
    }

    pub fn is_listening(&self, address: SocketAddr) -> bool {
        self.inner.listeners.lock().contains_key(&address)
    }

    pub fn shutdown_count(&self) -> usize {
        self.inner.shutdowns.load(Ordering::Acquire)
    }

    /// 收到的出站连接请求。
    pub fn connect_requests(&self) -> Vec<ConnectRequest> {
        self.inner.connects.lock().clone()
    }

    /// 全部连接的对端（入站与出站）。
    pub fn peers(&self) -> Vec<MockPeer> {
        self.inner.peers.lock().clone()
    }

    /// 模拟一个客户端连接到 `listen` 地址；返回前会话已完成初始化。
    pub fn connect_peer(&self, listen: SocketAddr) -> io::Result<MockPeer> {
        let initializer = self
            .inner
            .listeners
            .lock()
            .get(&listen)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "not listening"))?;
        let remote = self.next_address();
        let events = initializer.init_channel(remote);
        let peer = self.open_link(listen, remote, events);
        Ok(peer)
    }

    fn next_address(&self) -> SocketAddr {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port)
    }

    fn open_link(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        events: Box<dyn ChannelEvents>,
    ) -> MockPeer {
        let link = Arc::new(Link {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            local,
            remote,
            event_loop: Arc::clone(&self.inner.event_loop),
            events: Mutex::new(Some(events)),
            mode: Arc::clone(&self.inner.mode),
            written: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            backlog: Mutex::new(VecDeque::new()),
            readable: AtomicBool::new(true),
            sizing: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_requests: AtomicUsize::new(0),
        });
        let peer = MockPeer {
            link: Arc::clone(&link),
        };
        self.inner.peers.lock().push(peer.clone());
        let channel: Arc<dyn TransportChannel> = Arc::new(MockChannel {
            link: Arc::clone(&link),
        });
        self.inner
            .event_loop
            .run_sync(move || link.with_events(move |events| events.on_connected(channel)));
        peer
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("listeners", &self.inner.listeners.lock().len())
            .field("peers", &self.inner.peers.lock().len())
            .finish()
    }
}

struct MockListener {
    address: SocketAddr,
    inner: Arc<MockInner>,
}

impl BoundChannel for MockListener {
    fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn close(&self) -> CompletionFuture<()> {
        self.inner.listeners.lock().remove(&self.address);
        CompletionFuture::succeeded(())
    }
}

impl Transport for MockTransport {
    fn bind(
        &self,
        address: SocketAddr,
        initializer: Arc<dyn ChannelInitializer>,
    ) -> io::Result<Box<dyn BoundChannel>> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(io::Error::other("transport shut down"));
        }
        let address = if address.port() == 0 {
            SocketAddr::new(
                address.ip(),
                self.inner.next_port.fetch_add(1, Ordering::Relaxed),
            )
        } else {
            address
        };
        let mut listeners = self.inner.listeners.lock();
        if self.inner.occupied.lock().contains(&address) || listeners.contains_key(&address) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("address {address} already in use"),
            ));
        }
        listeners.insert(address, initializer);
        Ok(Box::new(MockListener {
            address,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn connect(
        &self,
        request: ConnectRequest,
        events: Box<dyn ChannelEvents>,
    ) -> CompletionFuture<()> {
        self.inner.connects.lock().push(request);
        if self.inner.shut_down.load(Ordering::Acquire) {
            return CompletionFuture::failed(BridgeError::Disposed);
        }
        let remote = request.remote;
        if self.inner.refused.lock().contains(&remote) {
            return CompletionFuture::failed(BridgeError::connect(
                remote,
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            ));
        }
        if self.inner.unresponsive.lock().contains(&remote) {
            return CompletionFuture::failed(BridgeError::ConnectTimeout {
                remote,
                timeout: request.timeout,
            });
        }
        let local = request.local.unwrap_or_else(|| self.next_address());
        let _ = self.open_link(local, remote, events);
        CompletionFuture::succeeded(())
    }

    fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.listeners.lock().clear();
        self.inner.shutdowns.fetch_add(1, Ordering::AcqRel);
    }
}

/// [`RecordingFilter`] 记录的事件。
#[derive(Clone, Debug, PartialEq)]
pub enum FilterEvent {
    Created(SessionId),
    Opened(SessionId),
    Received(SessionId, Vec<u8>),
    Sent(SessionId, u64),
    Idle(SessionId, IdleClass),
    Closed(SessionId),
    Exception(SessionId, &'static str),
}

impl FilterEvent {
    pub fn session(&self) -> SessionId {
        match self {
            FilterEvent::Created(id)
            | FilterEvent::Opened(id)
            | FilterEvent::Received(id, _)
            | FilterEvent::Sent(id, _)
            | FilterEvent::Idle(id, _)
            | FilterEvent::Closed(id)
            | FilterEvent::Exception(id, _) => *id,
        }
    }
}

#[derive(Default)]
struct Journal {
    events: Mutex<Vec<FilterEvent>>,
    changed: Condvar,
    foreign_thread_callbacks: AtomicUsize,
}

/// 记录全部过滤器回调的过滤器；克隆体共享同一份记录。
#[derive(Clone, Default)]
pub struct RecordingFilter {
    journal: Arc<Journal>,
}

impl RecordingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FilterEvent> {
        self.journal.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&FilterEvent) -> bool) -> usize {
        self.journal
            .events
            .lock()
            .iter()
            .filter(|event| predicate(event))
            .count()
    }

    /// 等待至少 `n` 个满足条件的事件，超时返回 `false`。
    pub fn wait_for(
        &self,
        n: usize,
        timeout: Duration,
        predicate: impl Fn(&FilterEvent) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.journal.events.lock();
        loop {
            if events.iter().filter(|event| predicate(event)).count() >= n {
                return true;
            }
            if self
                .journal
                .changed
                .wait_until(&mut events, deadline)
                .timed_out()
            {
                return events.iter().filter(|event| predicate(event)).count() >= n;
            }
        }
    }

    /// 回调不在会话亲和线程上执行的次数。
    pub fn foreign_thread_callbacks(&self) -> usize {
        self.journal.foreign_thread_callbacks.load(Ordering::Acquire)
    }

    fn push(&self, session: &Session, event: FilterEvent) {
        if !session.is_affinity_thread() {
            self.journal
                .foreign_thread_callbacks
                .fetch_add(1, Ordering::AcqRel);
        }
        self.journal.events.lock().push(event);
        self.journal.changed.notify_all();
    }
}

impl Filter for RecordingFilter {
    fn on_session_created(&self, session: &Session) {
        self.push(session, FilterEvent::Created(session.id()));
    }

    fn on_session_opened(&self, session: &Session) {
        self.push(session, FilterEvent::Opened(session.id()));
    }

    fn on_message_received(&self, session: &Session, message: &mut IoBuffer) {
        self.push(
            session,
            FilterEvent::Received(session.id(), message.as_slice().to_vec()),
        );
    }

    fn on_message_sent(&self, session: &Session, request: &WriteRequest) {
        self.push(session, FilterEvent::Sent(session.id(), request.id()));
    }

    fn on_session_idle(&self, session: &Session, class: IdleClass) {
        self.push(session, FilterEvent::Idle(session.id(), class));
    }

    fn on_session_closed(&self, session: &Session) {
        self.push(session, FilterEvent::Closed(session.id()));
    }

    fn on_exception_caught(&self, session: &Session, cause: &BridgeError) {
        self.push(session, FilterEvent::Exception(session.id(), cause.code()));
    }
}

impl fmt::Debug for RecordingFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingFilter")
            .field("events", &self.journal.events.lock().len())
            .finish()
    }
}
