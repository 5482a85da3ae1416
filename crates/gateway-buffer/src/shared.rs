use std::{
    sync::Arc,
    thread::{self, ThreadId},
};

use bytes::Bytes;
use dashmap::DashMap;

use crate::io_buffer::{BufferMode, IoBuffer};

/// 共享缓冲游标的持有者标识。
///
/// - `Thread`：默认消费者，按调用线程区分；
/// - `Custom`：由调用方分配的逻辑消费者编号（例如同一线程上的多个写出阶段）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerId {
    Thread(ThreadId),
    Custom(u64),
}

impl ConsumerId {
    /// 当前线程对应的消费者标识。
    pub fn current_thread() -> Self {
        ConsumerId::Thread(thread::current().id())
    }
}

struct SharedInner {
    bytes: Bytes,
    origin_position: usize,
    origin_limit: usize,
    cursors: DashMap<ConsumerId, IoBuffer>,
}

/// 共享模式缓冲：底层字节不可变，每个消费者持有独立游标。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 出站缓冲在交给传输层写出的同时还需被会话保留用于部分写重试等记账；若共享同一游标，
///   每次 flush 都得加锁。共享缓冲让每个消费者各自推进游标，热路径无需互斥；
/// - 底层 `Bytes` 只读，因此“被引用期间字节身份不变”由类型系统直接保证。
///
/// ## 逻辑 (How)
/// - `cursors` 以 [`ConsumerId`] 为键缓存游标，首次访问时以初始游标惰性创建；
/// - [`SharedBuffer::duplicate`] 返回一个与当前消费者游标位置一致、但此后完全独立的
///   只读 [`IoBuffer`]；
/// - [`SharedBuffer::fork`] 产生新的共享缓冲，初始游标等于当前消费者游标、游标缓存为空。
///
/// ## 契约 (What)
/// - 一个消费者对自身游标的推进，对其他消费者不可见；
/// - 克隆 `SharedBuffer` 只增加引用计数，克隆体与原值共享同一游标缓存；
/// - 游标视图一律只读，写入返回 [`BufferError::ReadOnly`](crate::BufferError::ReadOnly)。
///
/// ## 注意事项 (Trade-offs)
/// - 游标缓存不会自动清理；消费完毕后应调用 [`SharedBuffer::release_cursor`]，
///   否则长寿命缓冲会随线程数累积少量条目。
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<SharedInner>,
}

impl SharedBuffer {
    /// 以整段字节作为可读内容构造共享缓冲。
    pub fn new(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self::from_parts(bytes, 0, len)
    }

    pub(crate) fn from_parts(bytes: Bytes, position: usize, limit: usize) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                bytes,
                origin_position: position,
                origin_limit: limit,
                cursors: DashMap::new(),
            }),
        }
    }

    pub fn mode(&self) -> BufferMode {
        BufferMode::Shared
    }

    /// 底层字节总长度，与任何游标无关。
    pub fn capacity(&self) -> usize {
        self.inner.bytes.len()
    }

    /// 在当前线程的游标上执行 `f`；游标不存在时惰性创建并缓存。
    pub fn with_cursor<R>(&self, f: impl FnOnce(&mut IoBuffer) -> R) -> R {
        self.with_cursor_for(ConsumerId::current_thread(), f)
    }

    /// 在指定消费者的游标上执行 `f`。
    ///
    /// 闭包执行期间持有该消费者所在分片的写锁，闭包内不得再访问同一共享缓冲。
    pub fn with_cursor_for<R>(&self, consumer: ConsumerId, f: impl FnOnce(&mut IoBuffer) -> R) -> R {
        let mut cursor = self
            .inner
            .cursors
            .entry(consumer)
            .or_insert_with(|| self.origin_view());
        f(cursor.value_mut())
    }

    /// 当前线程游标的位置。
    pub fn position(&self) -> usize {
        self.with_cursor(|cursor| cursor.position())
    }

    /// 当前线程游标的剩余可读字节数。
    pub fn remaining(&self) -> usize {
        self.with_cursor(|cursor| cursor.remaining())
    }

    /// 复制当前线程的游标，返回之后完全独立的只读视图。
    pub fn duplicate(&self) -> IoBuffer {
        self.duplicate_for(ConsumerId::current_thread())
    }

    pub fn duplicate_for(&self, consumer: ConsumerId) -> IoBuffer {
        let (position, limit) =
            self.with_cursor_for(consumer, |cursor| (cursor.position(), cursor.limit()));
        IoBuffer::frozen_view(self.inner.bytes.clone(), position, limit)
    }

    /// 以当前线程游标为起点产生新的共享缓冲，游标缓存从零开始。
    pub fn fork(&self) -> SharedBuffer {
        let (position, limit) = self.with_cursor(|cursor| (cursor.position(), cursor.limit()));
        SharedBuffer::from_parts(self.inner.bytes.clone(), position, limit)
    }

    /// 丢弃当前线程的游标缓存。
    pub fn release_cursor(&self) {
        self.inner.cursors.remove(&ConsumerId::current_thread());
    }

    /// 丢弃指定消费者的游标缓存。
    pub fn release_cursor_for(&self, consumer: ConsumerId) {
        self.inner.cursors.remove(&consumer);
    }

    /// 初始游标覆盖的字节区间，与任何消费者的推进无关。
    pub fn origin_bytes(&self) -> Bytes {
        self.inner
            .bytes
            .slice(self.inner.origin_position..self.inner.origin_limit)
    }

    /// 初始游标的可读字节数。
    pub fn origin_remaining(&self) -> usize {
        self.inner.origin_limit - self.inner.origin_position
    }

    /// 判断两个共享缓冲是否引用同一块底层字节。
    pub fn same_backing(&self, other: &SharedBuffer) -> bool {
        self.inner.bytes.as_ptr() == other.inner.bytes.as_ptr()
    }

    fn origin_view(&self) -> IoBuffer {
        IoBuffer::frozen_view(
            self.inner.bytes.clone(),
            self.inner.origin_position,
            self.inner.origin_limit,
        )
    }
}

impl core::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("capacity", &self.capacity())
            .field("origin_position", &self.inner.origin_position)
            .field("origin_limit", &self.inner.origin_limit)
            .field("cursors", &self.inner.cursors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferError;

    #[test]
    fn cursor_is_created_lazily_and_cached() {
        let shared = SharedBuffer::new(Bytes::from_static(b"abcdef"));
        shared.with_cursor(|cursor| cursor.skip(2)).expect("推进游标");
        assert_eq!(shared.position(), 2);
        assert_eq!(shared.remaining(), 4);
    }

    #[test]
    fn custom_consumers_do_not_observe_each_other() {
        let shared = SharedBuffer::new(Bytes::from_static(b"abcdef"));
        let a = ConsumerId::Custom(1);
        let b = ConsumerId::Custom(2);
        shared
            .with_cursor_for(a, |cursor| cursor.skip(5))
            .expect("推进 a");
        let b_position = shared.with_cursor_for(b, |cursor| cursor.position());
        assert_eq!(b_position, 0);
    }

    #[test]
    fn duplicate_is_detached_from_cached_cursor() {
        let shared = SharedBuffer::new(Bytes::from_static(b"abcdef"));
        let mut dup = shared.duplicate();
        dup.skip(6).expect("消费副本");
        assert_eq!(shared.position(), 0);
    }

    #[test]
    fn fork_keeps_position_and_backing() {
        let shared = SharedBuffer::new(Bytes::from_static(b"abcdef"));
        shared.with_cursor(|cursor| cursor.skip(3)).expect("推进");
        let forked = shared.fork();
        assert!(forked.same_backing(&shared));
        assert_eq!(forked.origin_bytes().as_ref(), b"def");
        assert_eq!(forked.position(), 3);
    }

    #[test]
    fn cursor_views_are_read_only() {
        let shared = SharedBuffer::new(Bytes::from_static(b"x"));
        let result = shared.with_cursor(|cursor| cursor.put_u8(1));
        assert_eq!(result, Err(BufferError::ReadOnly));
    }

    #[test]
    fn release_cursor_restarts_from_origin() {
        let shared = SharedBuffer::new(Bytes::from_static(b"abc"));
        shared.with_cursor(|cursor| cursor.skip(3)).expect("消费");
        shared.release_cursor();
        assert_eq!(shared.remaining(), 3);
    }
}
