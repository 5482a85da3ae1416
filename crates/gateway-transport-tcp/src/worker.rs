//! 工作线程：每个线程驱动一个单线程 Tokio 运行时，连接固定在某个工作线程上。
//!
//! # 教案式说明
//! - **意图 (Why)**：会话要求一个连接的全部回调以及投递给它的任务都在同一个线程上执行，
//!   多线程调度器会在线程间窃取任务，因此每个工作线程各自持有一个 `current_thread` 运行时；
//! - **逻辑 (How)**：
//!   - 连接任务与监听任务通过运行时句柄派发到目标工作线程；
//!   - [`IoExecutor`] 任务经由无界通道交给一个常驻的排空任务逐个执行，保证投递顺序；
//!   - 关停时先发出停止信号，再在宽限期内等待存活连接数归零，然后丢弃运行时；
//!     被一并丢弃的连接任务在析构时自行收尾；
//! - **风险 (Trade-offs)**：执行器任务与连接任务共享线程，任务内的阻塞调用会拖住该线程上的
//!   全部连接。

use std::{
    fmt,
    future::Future,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use gateway_session::executor::{IoExecutor, Task};
use parking_lot::Mutex;
use tokio::{
    runtime::{Builder, Handle},
    sync::{mpsc, oneshot},
};
use tracing::{debug, info};

const DRAIN_POLL: Duration = Duration::from_millis(5);

pub(crate) struct Worker {
    index: usize,
    handle: Handle,
    tasks: mpsc::UnboundedSender<Task>,
    live: Arc<AtomicUsize>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Worker {
    pub(crate) fn spawn(index: usize, grace: Duration) -> io::Result<Arc<Self>> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (tasks, mut queued) = mpsc::unbounded_channel::<Task>();
        let (stop, stopped) = oneshot::channel::<()>();
        let live = Arc::new(AtomicUsize::new(0));
        let remaining = Arc::clone(&live);

        let thread = thread::Builder::new()
            .name(format!("gateway-tcp-{index}"))
            .spawn(move || {
                runtime.block_on(async move {
                    tokio::spawn(async move {
                        while let Some(task) = queued.recv().await {
                            task();
                        }
                    });
                    let _ = stopped.await;
                    let drained = tokio::time::timeout(grace, async {
                        while remaining.load(Ordering::Acquire) > 0 {
                            tokio::time::sleep(DRAIN_POLL).await;
                        }
                    })
                    .await;
                    if drained.is_err() {
                        debug!(
                            worker = index,
                            connections = remaining.load(Ordering::Acquire),
                            "worker stopped with live connections"
                        );
                    }
                });
            })?;
        let thread_id = thread.thread().id();
        info!(worker = index, "tcp worker started");

        Ok(Arc::new(Self {
            index,
            handle,
            tasks,
            live,
            stop: Mutex::new(Some(stop)),
            thread: Mutex::new(Some(thread)),
            thread_id,
        }))
    }

    pub(crate) fn spawn_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// 在该工作线程的运行时上下文中执行同步代码，例如把标准库套接字注册到其反应器。
    pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.handle.enter();
        f()
    }

    /// 登记一个存活连接，守卫释放时计数减一。
    pub(crate) fn track_connection(&self) -> ConnectionGuard {
        self.live.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            live: Arc::clone(&self.live),
        }
    }

    pub(crate) fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// 停止工作线程；在其他线程调用时等待线程退出。
    pub(crate) fn stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        let thread = self.thread.lock().take();
        if let Some(thread) = thread
            && thread::current().id() != self.thread_id
        {
            let _ = thread.join();
            info!(worker = self.index, "tcp worker stopped");
        }
    }
}

impl IoExecutor for Worker {
    fn execute(&self, task: Task) {
        let _ = self.tasks.send(task);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("thread_id", &self.thread_id)
            .field("live", &self.live_connections())
            .finish()
    }
}

pub(crate) struct ConnectionGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use super::*;

    #[test]
    fn executor_tasks_run_in_order_on_the_worker_thread() {
        let worker = Worker::spawn(0, Duration::from_millis(50)).expect("启动工作线程");
        let (tx, rx) = std_mpsc::channel();
        for step in 0..8 {
            let tx = tx.clone();
            worker.execute(Box::new(move || {
                let _ = tx.send((step, thread::current().id()));
            }));
        }
        let seen: Vec<_> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("任务执行"))
            .collect();
        assert_eq!(seen.iter().map(|(step, _)| *step).collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
        assert!(seen.iter().all(|(_, id)| *id == worker.thread_id()));
        worker.stop();
    }

    #[test]
    fn stop_waits_for_live_connections_within_grace() {
        let worker = Worker::spawn(1, Duration::from_secs(5)).expect("启动工作线程");
        let guard = worker.track_connection();
        assert_eq!(worker.live_connections(), 1);
        worker.spawn_task(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        worker.stop();
        assert_eq!(worker.live_connections(), 0);
    }
}
