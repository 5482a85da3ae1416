/// 投递到会话亲和线程执行的任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 会话亲和线程的任务入口。
///
/// # 教案式说明
/// - **意图 (Why)**：空闲监督线程与写完成回调可能在亲和线程之外触发，它们不直接改动会话内部
///   状态，而是把事件投递回亲和线程；
/// - **契约 (What)**：同一执行器上投递的任务按投递顺序在同一线程上执行；
///   传输关停后投递的任务可以被静默丢弃。
pub trait IoExecutor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}
