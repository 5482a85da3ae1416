use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::{Bytes, BytesMut};
use spin::Mutex;

use crate::{
    io_buffer::{BufferMode, IoBuffer},
    shared::SharedBuffer,
};

/// `wrap` 的返回值：按请求的模式给出独占或共享包装。
#[derive(Debug)]
pub enum WrappedBuffer {
    Exclusive(IoBuffer),
    Shared(SharedBuffer),
}

impl WrappedBuffer {
    pub fn mode(&self) -> BufferMode {
        match self {
            WrappedBuffer::Exclusive(_) => BufferMode::Exclusive,
            WrappedBuffer::Shared(_) => BufferMode::Shared,
        }
    }
}

/// 分配器契约：读路径与编码路径获取缓冲的唯一入口。
///
/// # 设计初衷（Why）
/// - 会话、编解码过滤器不应直接 `BytesMut::with_capacity`，否则无法统一替换为池化实现；
/// - `wrap` 允许把上层已有的字节零拷贝地纳入缓冲体系。
///
/// # 契约定义（What）
/// - `allocate`：返回容量不小于 `capacity` 的全新独占缓冲，`position = 0`、`limit = capacity`；
/// - `wrap`：不复制 `raw`，按 `mode` 返回对应包装；
/// - `release`：调用方归还不再使用的缓冲，默认实现直接丢弃；
/// - 实现必须线程安全，分配器通常被所有 I/O 线程共享。
pub trait BufferAllocator: Send + Sync + 'static {
    fn allocate(&self, capacity: usize) -> IoBuffer;

    fn wrap(&self, raw: Bytes, mode: BufferMode) -> WrappedBuffer {
        match mode {
            BufferMode::Exclusive => WrappedBuffer::Exclusive(IoBuffer::wrap(raw)),
            BufferMode::Shared => WrappedBuffer::Shared(SharedBuffer::new(raw)),
        }
    }

    fn release(&self, buffer: IoBuffer) {
        drop(buffer);
    }
}

/// 直接向堆申请内存的分配器。
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize) -> IoBuffer {
        IoBuffer::allocate(capacity)
    }
}

/// 分配器统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// 自创建以来向堆申请的总字节数。
    pub allocated_bytes: usize,
    /// 自由链表中可复用的字节数。
    pub available_bytes: usize,
    /// 已借出尚未归还的缓冲数量。
    pub active_leases: usize,
    /// 自由链表中的块数。
    pub free_slots: usize,
}

/// 以自由链表复用 `BytesMut` 的池化分配器。
///
/// # 模块角色（Why）
/// - I/O 线程每次读取都需要一块读缓冲，高连接数时频繁的堆分配会带来抖动；
/// - 通过 [`BufferAllocator::release`] 归还的缓冲若仍独占底层内存，便回到自由链表供下次复用。
///
/// # 核心机制（How）
/// - 自由链表使用 `spin::Mutex<Vec<BytesMut>>`，临界区只做一次线性查找；
/// - 统计字段均为原子计数，`stats` 读取不阻塞分配路径；
/// - 归还时若缓冲已被冻结且存在其它引用（例如仍在传输层写出），则无法夺回内存，只更新统计。
///
/// # 设计权衡（Trade-offs）
/// - 自由链表上限为 `max_free_slots`，超出的块直接释放，避免压测峰值后长期占用内存。
#[derive(Clone)]
pub struct PooledAllocator {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    max_free_slots: usize,
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
}

impl PooledAllocator {
    pub fn new(max_free_slots: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free_list: Mutex::new(Vec::new()),
                max_free_slots,
                allocated_bytes: AtomicUsize::new(0),
                available_bytes: AtomicUsize::new(0),
                active_leases: AtomicUsize::new(0),
            }),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocated_bytes: self.inner.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: self.inner.available_bytes.load(Ordering::Relaxed),
            active_leases: self.inner.active_leases.load(Ordering::Relaxed),
            free_slots: self.inner.free_list.lock().len(),
        }
    }

    /// 清空自由链表并返回释放的字节数。
    pub fn shrink(&self) -> usize {
        let mut list = self.inner.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::capacity).sum();
        list.clear();
        saturating_sub(&self.inner.available_bytes, reclaimed);
        reclaimed
    }

    fn acquire(&self, capacity: usize) -> BytesMut {
        let reused = {
            let mut list = self.inner.free_list.lock();
            list.iter()
                .position(|buf| buf.capacity() >= capacity)
                .map(|index| list.swap_remove(index))
        };
        let mut buf = match reused {
            Some(buf) => {
                saturating_sub(&self.inner.available_bytes, buf.capacity());
                buf
            }
            None => {
                let buf = BytesMut::with_capacity(capacity);
                self.inner
                    .allocated_bytes
                    .fetch_add(buf.capacity(), Ordering::Relaxed);
                buf
            }
        };
        buf.clear();
        buf.resize(capacity, 0);
        self.inner.active_leases.fetch_add(1, Ordering::Relaxed);
        buf
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BufferAllocator for PooledAllocator {
    fn allocate(&self, capacity: usize) -> IoBuffer {
        IoBuffer::from_bytes_mut(self.acquire(capacity))
    }

    fn release(&self, buffer: IoBuffer) {
        saturating_sub(&self.inner.active_leases, 1);
        let Some(mut reclaimed) = buffer.into_unique_storage() else {
            return;
        };
        reclaimed.clear();
        let capacity = reclaimed.capacity();
        let mut list = self.inner.free_list.lock();
        if list.len() < self.inner.max_free_slots {
            list.push(reclaimed);
            self.inner
                .available_bytes
                .fetch_add(capacity, Ordering::Relaxed);
        }
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused() {
        let pool = PooledAllocator::new(4);
        let buf = pool.allocate(64);
        assert_eq!(buf.capacity(), 64);
        pool.release(buf);
        let stats = pool.stats();
        assert_eq!(stats.free_slots, 1);
        assert_eq!(stats.active_leases, 0);

        let _again = pool.allocate(32);
        let after = pool.stats();
        assert_eq!(after.free_slots, 0);
        assert_eq!(after.allocated_bytes, stats.allocated_bytes);
    }

    #[test]
    fn frozen_buffer_with_live_view_is_not_reclaimed() {
        let pool = PooledAllocator::new(4);
        let mut buf = pool.allocate(16);
        let _view = buf.duplicate();
        pool.release(buf);
        assert_eq!(pool.stats().free_slots, 0);
    }

    #[test]
    fn wrap_respects_requested_mode() {
        let heap = HeapAllocator;
        let exclusive = heap.wrap(Bytes::from_static(b"a"), BufferMode::Exclusive);
        let shared = heap.wrap(Bytes::from_static(b"a"), BufferMode::Shared);
        assert_eq!(exclusive.mode(), BufferMode::Exclusive);
        assert_eq!(shared.mode(), BufferMode::Shared);
    }
}
