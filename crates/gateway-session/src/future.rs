use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::error::BridgeError;

type Listener<T> = Box<dyn FnOnce(&Result<T, BridgeError>) + Send + 'static>;

/// 恰好完成一次的完成信号。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 写请求、连接尝试、会话关闭都需要一个“成功或失败，且只发生一次”的结果载体；
/// - 调用方既可能在 I/O 线程上注册回调，也可能在管理线程上阻塞等待，还可能在异步任务中 `.await`。
///
/// ## 逻辑 (How)
/// - 结果、回调列表与 waker 由同一把 `parking_lot::Mutex` 保护，完成时一次性取出；
/// - 回调与唤醒在释放锁之后执行，回调内部可以再次访问本 future；
/// - 阻塞等待使用配套的 `Condvar`。
///
/// ## 契约 (What)
/// - [`CompletionFuture::complete`] 只有第一次调用生效，返回值指示是否生效；
/// - [`CompletionFuture::add_listener`] 在已完成时立即在调用线程执行回调；
/// - 克隆只增加引用计数，所有克隆观察到同一个结果。
///
/// ## 注意事项 (Trade-offs)
/// - 结果以克隆方式交付给每个观察者，因此要求 `T: Clone`。
pub struct CompletionFuture<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

struct State<T> {
    outcome: Option<Result<T, BridgeError>>,
    listeners: Vec<Listener<T>>,
    wakers: Vec<Waker>,
}

impl<T> Clone for CompletionFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for CompletionFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> CompletionFuture<T> {
    /// 构造尚未完成的 future。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    listeners: Vec::new(),
                    wakers: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn ready(outcome: Result<T, BridgeError>) -> Self {
        let future = Self::new();
        future.complete(outcome);
        future
    }

    pub fn succeeded(value: T) -> Self {
        Self::ready(Ok(value))
    }

    pub fn failed(error: BridgeError) -> Self {
        Self::ready(Err(error))
    }

    /// 写入结果；已完成时忽略并返回 `false`。
    pub fn complete(&self, outcome: Result<T, BridgeError>) -> bool {
        let (listeners, wakers, delivered) = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
                outcome,
            )
        };
        self.inner.done.notify_all();
        for listener in listeners {
            listener(&delivered);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: BridgeError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// 非阻塞地读取结果。
    pub fn result(&self) -> Option<Result<T, BridgeError>> {
        self.inner.state.lock().outcome.clone()
    }

    /// 注册完成回调；已完成时立即在当前线程执行。
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, BridgeError>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&outcome);
    }

    /// 阻塞当前线程直到完成。
    ///
    /// 只应在管理或关停路径上调用；在 I/O 线程上等待本线程负责完成的 future 会死锁。
    pub fn wait(&self) -> Result<T, BridgeError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// 带超时的阻塞等待，超时返回 `None`。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, BridgeError>> {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            let _ = self
                .inner
                .done
                .wait_while_for(&mut state, |state| state.outcome.is_none(), timeout);
        }
        state.outcome.clone()
    }
}

impl<T: Clone + Send + 'static> Future for CompletionFuture<T> {
    type Output = Result<T, BridgeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for CompletionFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionFuture")
            .field("done", &state.outcome.is_some())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// 写请求的完成信号。
pub type WriteFuture = CompletionFuture<()>;
/// 会话关闭完成信号。
pub type CloseFuture = CompletionFuture<()>;
/// 读取操作的完成信号，交付收到的字节。
pub type ReadFuture = CompletionFuture<bytes::Bytes>;

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    #[test]
    fn completes_exactly_once() {
        let future = CompletionFuture::<u32>::new();
        assert!(future.succeed(1));
        assert!(!future.succeed(2));
        assert!(!future.fail(BridgeError::Disposed));
        assert_eq!(future.result().map(|r| r.ok()), Some(Some(1)));
    }

    #[test]
    fn listener_runs_once_whether_registered_before_or_after() {
        let calls = Arc::new(AtomicUsize::new(0));
        let future = CompletionFuture::<()>::new();

        let before = Arc::clone(&calls);
        future.add_listener(move |_| {
            before.fetch_add(1, Ordering::SeqCst);
        });
        future.succeed(());
        let after = Arc::clone(&calls);
        future.add_listener(move |_| {
            after.fetch_add(1, Ordering::SeqCst);
        });
        future.succeed(());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_unblocks_when_another_thread_completes() {
        let future = CompletionFuture::<&'static str>::new();
        let completer = future.clone();
        let handle = thread::spawn(move || completer.succeed("done"));
        assert_eq!(future.wait().expect("应成功完成"), "done");
        assert!(handle.join().expect("完成线程不应 panic"));
    }

    #[test]
    fn wait_timeout_returns_none_while_pending() {
        let future = CompletionFuture::<()>::new();
        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());
    }
}
