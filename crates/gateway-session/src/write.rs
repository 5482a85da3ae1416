//! 写队列与写处理器。
//!
//! # 教案式说明
//! - **意图 (Why)**：同一会话的写必须按入队顺序交给传输层，但完成通知可以异步重叠，
//!   不必等上一个写完成再发出下一个；
//! - **逻辑 (How)**：
//!   1. 亲和线程弹出队首请求，请求一经发出即离开队列；
//!   2. 零长度消息不触达传输层，直接视为已发送；
//!   3. 独占缓冲交出 `[position, limit)` 的零拷贝视图；共享缓冲先复制游标再交出，
//!      若写仍在途则把保留的引用替换为同位置的新共享缓冲；文件区间原样交出；
//!   4. 传输层立即完成的写同步解决，异步完成的写挂回调后继续发出下一个；
//!      只要还有先发出的写未解决，后发出的写（包括零长度写）就停在已发出队列里，
//!      按发出顺序逐个解决；
//!   5. 任何失败都停止本轮刷新，失败原因同时交给完成信号与过滤器链；
//! - **契约 (What)**：关闭时剩余的请求全部以同一个 [`BridgeError::WriteToClosedSession`]
//!   失败，该错误只向过滤器链抛出一次。

use std::{collections::VecDeque, sync::Arc};

use tracing::{trace, warn};

use crate::{
    error::{BridgeError, DiscardedWrite},
    future::WriteFuture,
    message::Message,
    session::Session,
    transport::{OutboundPayload, WriteCompletion},
};

/// 一条入队的出站消息及其完成信号。
#[derive(Debug)]
pub struct WriteRequest {
    id: u64,
    message: Message,
    future: WriteFuture,
    original_position: usize,
    scheduled_bytes: usize,
}

impl WriteRequest {
    pub(crate) fn new(id: u64, message: Message, future: WriteFuture) -> Self {
        let original_position = match &message {
            Message::Buffer(buffer) => buffer.position(),
            Message::Shared(_) | Message::File(_) => 0,
        };
        let scheduled_bytes = message.remaining();
        Self {
            id,
            message,
            future,
            original_position,
            scheduled_bytes,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn future(&self) -> &WriteFuture {
        &self.future
    }

    pub(crate) fn scheduled_bytes(&self) -> usize {
        self.scheduled_bytes
    }
}

/// 已交给传输层、等待按发出顺序解决的写。
#[derive(Debug)]
struct Issuing {
    request: WriteRequest,
    outcome: Option<Result<usize, BridgeError>>,
}

/// 会话的先进先出写队列，只由亲和线程读写。
///
/// `issued` 保存已发出但尚未解决的请求；队首未解决时，后面的结果即使已知也只能等待。
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    requests: VecDeque<WriteRequest>,
    issued: VecDeque<Issuing>,
}

impl WriteQueue {
    pub(crate) fn push(&mut self, request: WriteRequest) {
        self.requests.push_back(request);
    }

    pub(crate) fn pop(&mut self) -> Option<WriteRequest> {
        self.requests.pop_front()
    }

    pub(crate) fn take_all(&mut self) -> Vec<WriteRequest> {
        self.requests.drain(..).collect()
    }

    /// 是否还有先发出、尚未解决的写。
    fn has_unresolved(&self) -> bool {
        !self.issued.is_empty()
    }

    fn park(&mut self, request: WriteRequest, outcome: Option<Result<usize, BridgeError>>) {
        self.issued.push_back(Issuing { request, outcome });
    }

    fn settle(&mut self, request_id: u64, outcome: Result<usize, BridgeError>) -> bool {
        match self
            .issued
            .iter_mut()
            .find(|entry| entry.request.id == request_id)
        {
            Some(entry) => {
                entry.outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    /// 弹出队首已有结果的请求。
    fn pop_settled(&mut self) -> Option<(WriteRequest, Result<usize, BridgeError>)> {
        if self.issued.front()?.outcome.is_none() {
            return None;
        }
        let entry = self.issued.pop_front()?;
        entry.outcome.map(|outcome| (entry.request, outcome))
    }
}

enum Issued {
    Done(Result<usize, BridgeError>),
    Pending(WriteCompletion),
}

/// 刷新写队列。重入调用（例如过滤器在 `on_message_sent` 中继续写）直接返回，
/// 新请求由外层循环继续发出。
pub(crate) fn flush(session: &Session) -> Result<(), BridgeError> {
    let id = session.id();
    let entered = session
        .interior
        .with(id, |interior| !std::mem::replace(&mut interior.flushing, true))?;
    if !entered {
        return Ok(());
    }
    let result = issue_queued(session);
    session
        .interior
        .with(id, |interior| interior.flushing = false)?;
    result
}

fn issue_queued(session: &Session) -> Result<(), BridgeError> {
    let id = session.id();
    loop {
        if session.is_closing() {
            return Ok(());
        }
        let Some(mut request) = session.interior.with(id, |interior| interior.queue.pop())? else {
            return Ok(());
        };
        match issue(session, &mut request) {
            Issued::Done(outcome) => {
                let failed = outcome.is_err();
                let ready = session.interior.with(id, |interior| {
                    if interior.queue.has_unresolved() {
                        interior.queue.park(request, Some(outcome));
                        None
                    } else {
                        Some((request, outcome))
                    }
                })?;
                if let Some((request, outcome)) = ready {
                    resolve(session, request, outcome);
                }
                if failed {
                    return Ok(());
                }
            }
            Issued::Pending(completion) => {
                let request_id = request.id;
                session
                    .interior
                    .with(id, |interior| interior.queue.park(request, None))?;
                let Some(handle) = session.handle() else {
                    return Ok(());
                };
                completion.add_listener(move |outcome| {
                    let outcome = outcome.clone();
                    handle.run_on_affinity(move |session| settle(session, request_id, outcome));
                });
            }
        }
    }
}

fn issue(session: &Session, request: &mut WriteRequest) -> Issued {
    if request.message.is_empty() {
        return Issued::Done(Ok(0));
    }
    let channel = session.channel();
    let completion = match &mut request.message {
        Message::Buffer(buffer) => channel.write(OutboundPayload::Bytes(buffer.to_bytes())),
        Message::Shared(shared) => {
            let mut view = shared.duplicate();
            let completion = channel.write(OutboundPayload::Bytes(view.to_bytes()));
            if !completion.is_done() {
                *shared = shared.fork();
            }
            completion
        }
        Message::File(region) => channel.write(OutboundPayload::File(region.clone())),
    };
    match completion.result() {
        Some(outcome) => Issued::Done(outcome),
        None => Issued::Pending(completion),
    }
}

/// 记录一个异步完成的结果，然后按发出顺序解决所有已就绪的请求。
fn settle(session: &Session, request_id: u64, outcome: Result<usize, BridgeError>) {
    let id = session.id();
    match session
        .interior
        .with(id, |interior| interior.queue.settle(request_id, outcome))
    {
        Ok(true) => {}
        Ok(false) => {
            trace!(session = %id, request = request_id, "write already resolved");
            return;
        }
        Err(err) => {
            warn!(session = %id, request = request_id, "cannot settle write: {err}");
            return;
        }
    }
    loop {
        match session
            .interior
            .with(id, |interior| interior.queue.pop_settled())
        {
            Ok(Some((request, outcome))) => resolve(session, request, outcome),
            Ok(None) => return,
            Err(err) => {
                warn!(session = %id, "cannot resolve settled writes: {err}");
                return;
            }
        }
    }
}

fn resolve(session: &Session, request: WriteRequest, outcome: Result<usize, BridgeError>) {
    session.stats.unschedule_write(request.scheduled_bytes);
    match outcome {
        Ok(written) => {
            trace!(session = %session.id(), request = request.id, written, "write completed");
            session.stats.record_message_sent(session.now());
            request.future.succeed(());
            session.filter_chain().fire_message_sent(session, &request);
        }
        Err(cause) => {
            request.future.fail(cause.clone());
            session.raise_exception(cause);
        }
    }
}

/// 关闭时丢弃剩余请求：全部以同一个聚合错误失败，并只向过滤器链抛出一次。
pub(crate) fn drain_on_close(session: &Session) {
    let id = session.id();
    let mut requests = match session.interior.with(id, |interior| interior.queue.take_all()) {
        Ok(requests) => requests,
        Err(err) => {
            warn!(session = %id, "cannot drain write queue: {err}");
            return;
        }
    };
    if requests.is_empty() {
        return;
    }
    if let Some(first) = requests.first_mut()
        && let Message::Buffer(buffer) = &mut first.message
        && buffer.has_remaining()
    {
        let _ = buffer.set_position(first.original_position);
    }
    let discarded: Vec<DiscardedWrite> = requests
        .iter()
        .map(|request| DiscardedWrite {
            request_id: request.id,
            remaining: request.message.remaining(),
        })
        .collect();
    let cause = BridgeError::WriteToClosedSession {
        session_id: id,
        requests: Arc::new(discarded),
    };
    trace!(session = %id, discarded = requests.len(), "failing queued writes on close");
    for request in requests {
        session.stats.unschedule_write(request.scheduled_bytes);
        request.future.fail(cause.clone());
    }
    session.raise_exception(cause);
}
