use core::mem;

use bytes::{Bytes, BytesMut};

use crate::{error::BufferError, shared::SharedBuffer};

/// 缓冲的所有权模式。
///
/// - `Exclusive`：单一持有者，游标就地推进；
/// - `Shared`：底层字节不可变，每个消费者拥有独立游标。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferMode {
    Exclusive,
    Shared,
}

/// 底层存储的两种形态。
///
/// - `Unique`：尚未被任何视图引用的可写块；
/// - `Frozen`：已被冻结并可能被多个视图引用，写入前必须写时复制。
#[derive(Debug)]
enum Storage {
    Unique(BytesMut),
    Frozen(Bytes),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Unique(buf) => buf.as_ref(),
            Storage::Frozen(bytes) => bytes.as_ref(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Unique(buf) => buf.len(),
            Storage::Frozen(bytes) => bytes.len(),
        }
    }
}

/// 独占模式的字节缓冲，持有 `position ≤ limit ≤ capacity` 三元游标。
///
/// # 设计动机（Why）
/// - 读路径上传输层交来的字节直接转移所有权包装为 `IoBuffer`，编解码过滤器就地推进游标，
///   不需要任何锁；
/// - `duplicate`/`slice`/`as_read_only` 需要“共享底层字节、游标各自独立”的视图，用于协议层
///   预读、回溯与零拷贝拆帧。
///
/// # 架构关系（How）
/// - 存储初始为 `BytesMut`；第一次产生视图时冻结为 `Bytes`，视图与原缓冲共享同一块内存；
/// - 冻结后的写入走写时复制：若引用计数恰好为 1 则通过 `Bytes::try_into_mut` 原地夺回，
///   否则复制一份，从而保证已被引用的字节永不改变；
/// - 开启 `auto_expand` 后，写入超出 limit 时按“需求与两倍容量取大”扩容。
///
/// # 契约说明（What）
/// - **前置条件**：调用方遵守单一写者约束；跨线程共享请改用 [`SharedBuffer`]；
/// - **后置条件**：任何返回 `Err` 的调用都不会修改游标；
/// - `duplicate` 等方法需要 `&mut self`，因为它们可能把存储从 `Unique` 冻结为 `Frozen`，
///   但原缓冲的游标与内容不受影响。
///
/// # 风险与取舍（Trade-offs）
/// - 冻结后首次写入可能触发一次整块复制；高频“复制后继续写”的场景应先写完再复制。
#[derive(Debug)]
pub struct IoBuffer {
    storage: Storage,
    position: usize,
    limit: usize,
    mark: Option<usize>,
    read_only: bool,
    auto_expand: bool,
}

impl IoBuffer {
    /// 分配容量为 `capacity` 的可写缓冲，`limit` 等于容量。
    pub fn allocate(capacity: usize) -> Self {
        Self::from_storage(Storage::Unique(BytesMut::zeroed(capacity)), 0, capacity)
    }

    /// 在既有字节上构造缓冲，不复制数据；`limit` 等于字节长度。
    pub fn wrap(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self::from_storage(Storage::Frozen(bytes), 0, len)
    }

    /// 接管传输层读出的 `BytesMut`，所有权随之转移。
    pub fn from_bytes_mut(buf: BytesMut) -> Self {
        let len = buf.len();
        Self::from_storage(Storage::Unique(buf), 0, len)
    }

    /// 从切片复制构造缓冲，主要用于测试与小负载。
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from_bytes_mut(BytesMut::from(data))
    }

    pub(crate) fn frozen_view(bytes: Bytes, position: usize, limit: usize) -> Self {
        let mut view = Self::from_storage(Storage::Frozen(bytes), position, limit);
        view.read_only = true;
        view
    }

    fn from_storage(storage: Storage, position: usize, limit: usize) -> Self {
        Self {
            storage,
            position,
            limit,
            mark: None,
            read_only: false,
            auto_expand: false,
        }
    }

    /// 打开或关闭自动扩容，返回自身以便链式调用。
    pub fn with_auto_expand(mut self, auto_expand: bool) -> Self {
        self.auto_expand = auto_expand;
        self
    }

    pub fn set_auto_expand(&mut self, auto_expand: bool) {
        self.auto_expand = auto_expand;
    }

    pub fn is_auto_expand(&self) -> bool {
        self.auto_expand
    }

    /// 独占缓冲的模式恒为 [`BufferMode::Exclusive`]。
    pub fn mode(&self) -> BufferMode {
        BufferMode::Exclusive
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// 设置读写位置；若 mark 大于新位置则被丢弃。
    pub fn set_position(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.limit {
            return Err(BufferError::InvalidPosition {
                position,
                limit: self.limit,
            });
        }
        self.position = position;
        if self.mark.is_some_and(|mark| mark > position) {
            self.mark = None;
        }
        Ok(())
    }

    /// 设置 limit；position 超出时被截断到新 limit。
    pub fn set_limit(&mut self, limit: usize) -> Result<(), BufferError> {
        let capacity = self.capacity();
        if limit > capacity {
            return Err(BufferError::InvalidLimit { limit, capacity });
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        if self.mark.is_some_and(|mark| mark > limit) {
            self.mark = None;
        }
        Ok(())
    }

    /// 记录当前位置，配合 [`IoBuffer::reset`] 回到该位置。
    pub fn mark(&mut self) {
        self.mark = Some(self.position);
    }

    pub fn reset(&mut self) -> Result<(), BufferError> {
        let mark = self.mark.ok_or(BufferError::InvalidMark)?;
        self.position = mark;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
        self.mark = None;
    }

    /// 写模式切换为读模式：`limit = position`，`position = 0`。
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
        self.mark = None;
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.mark = None;
    }

    /// 跳过 `len` 个可读字节。
    pub fn skip(&mut self, len: usize) -> Result<(), BufferError> {
        self.require_readable(len)?;
        self.position += len;
        Ok(())
    }

    /// 当前可读区间 `[position, limit)` 的只读切片。
    pub fn as_slice(&self) -> &[u8] {
        &self.storage.as_slice()[self.position..self.limit]
    }

    pub fn get_u8(&mut self) -> Result<u8, BufferError> {
        self.require_readable(1)?;
        let value = self.storage.as_slice()[self.position];
        self.position += 1;
        Ok(value)
    }

    /// 读取 `dst.len()` 个字节并推进游标。
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        self.require_readable(dst.len())?;
        let start = self.position;
        dst.copy_from_slice(&self.storage.as_slice()[start..start + dst.len()]);
        self.position += dst.len();
        Ok(())
    }

    /// 将接下来的 `len` 个字节拆分为独立缓冲（零拷贝），并推进自身游标。
    pub fn split_to(&mut self, len: usize) -> Result<IoBuffer, BufferError> {
        self.require_readable(len)?;
        let start = self.position;
        let bytes = self.freeze_storage().slice(start..start + len);
        self.position += len;
        let mut split = IoBuffer::wrap(bytes);
        split.read_only = self.read_only;
        Ok(split)
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.ensure_writable(1)?;
        let position = self.position;
        self.make_mut()[position] = value;
        self.position += 1;
        Ok(())
    }

    /// 写入整段字节；空间不足且未开启自动扩容时返回 [`BufferError::Overflow`]。
    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), BufferError> {
        if src.is_empty() {
            return if self.read_only {
                Err(BufferError::ReadOnly)
            } else {
                Ok(())
            };
        }
        self.ensure_writable(src.len())?;
        let start = self.position;
        self.make_mut()[start..start + src.len()].copy_from_slice(src);
        self.position += src.len();
        Ok(())
    }

    /// 产生共享底层字节、游标独立的副本；原缓冲不受影响。
    pub fn duplicate(&mut self) -> IoBuffer {
        let bytes = self.freeze_storage();
        IoBuffer {
            storage: Storage::Frozen(bytes),
            position: self.position,
            limit: self.limit,
            mark: self.mark,
            read_only: self.read_only,
            auto_expand: self.auto_expand,
        }
    }

    /// 以 `[position, limit)` 为全部内容产生新缓冲，新缓冲的 position 为 0。
    pub fn slice(&mut self) -> IoBuffer {
        let (start, end) = (self.position, self.limit);
        let bytes = self.freeze_storage().slice(start..end);
        let mut sliced = IoBuffer::wrap(bytes);
        sliced.read_only = self.read_only;
        sliced
    }

    /// 与 [`IoBuffer::duplicate`] 相同，但结果拒绝一切写入。
    pub fn as_read_only(&mut self) -> IoBuffer {
        let mut view = self.duplicate();
        view.read_only = true;
        view
    }

    /// 以零拷贝方式取出可读区间，游标不变；用于把字节交给传输层。
    pub fn to_bytes(&mut self) -> Bytes {
        let (start, end) = (self.position, self.limit);
        self.freeze_storage().slice(start..end)
    }

    /// 消耗缓冲并返回可读区间。
    pub fn into_bytes(self) -> Bytes {
        let (start, end) = (self.position, self.limit);
        match self.storage {
            Storage::Unique(buf) => buf.freeze().slice(start..end),
            Storage::Frozen(bytes) => bytes.slice(start..end),
        }
    }

    /// 若底层内存无其它引用，则取回整块 `BytesMut`，供分配器复用。
    pub(crate) fn into_unique_storage(self) -> Option<BytesMut> {
        match self.storage {
            Storage::Unique(buf) => Some(buf),
            Storage::Frozen(bytes) => bytes.try_into_mut().ok(),
        }
    }

    /// 转换为共享缓冲，当前游标成为共享缓冲的初始游标。
    pub fn into_shared(self) -> SharedBuffer {
        let (position, limit) = (self.position, self.limit);
        let bytes = match self.storage {
            Storage::Unique(buf) => buf.freeze(),
            Storage::Frozen(bytes) => bytes,
        };
        SharedBuffer::from_parts(bytes, position, limit)
    }

    fn require_readable(&self, len: usize) -> Result<(), BufferError> {
        let remaining = self.remaining();
        if len > remaining {
            Err(BufferError::Underflow {
                requested: len,
                remaining,
            })
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&mut self, len: usize) -> Result<(), BufferError> {
        if self.read_only {
            return Err(BufferError::ReadOnly);
        }
        let remaining = self.remaining();
        if len <= remaining {
            return Ok(());
        }
        if !self.auto_expand {
            return Err(BufferError::Overflow {
                requested: len,
                remaining,
            });
        }
        let required = self.position + len;
        let capacity = self.capacity();
        if required > capacity {
            let expanded = required.max(capacity.saturating_mul(2));
            self.make_mut().resize(expanded, 0);
        }
        self.limit = required;
        Ok(())
    }

    /// 冻结存储并返回整块 `Bytes` 的引用计数副本。
    fn freeze_storage(&mut self) -> Bytes {
        if let Storage::Unique(buf) = &mut self.storage {
            let frozen = mem::take(buf).freeze();
            self.storage = Storage::Frozen(frozen);
        }
        match &self.storage {
            Storage::Frozen(bytes) => bytes.clone(),
            Storage::Unique(_) => unreachable!("freeze_storage 已完成冻结"),
        }
    }

    /// 取得可写存储；冻结态执行写时复制，不会改动其它视图看到的字节。
    fn make_mut(&mut self) -> &mut BytesMut {
        if let Storage::Frozen(bytes) = &mut self.storage {
            let unique = match mem::take(bytes).try_into_mut() {
                Ok(buf) => buf,
                Err(shared) => BytesMut::from(shared.as_ref()),
            };
            self.storage = Storage::Unique(unique);
        }
        match &mut self.storage {
            Storage::Unique(buf) => buf,
            Storage::Frozen(_) => unreachable!("make_mut 已完成写时复制"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_turns_written_region_into_readable_region() {
        let mut buf = IoBuffer::allocate(8);
        buf.put_slice(b"abc").expect("写入");
        buf.flip();
        assert_eq!(buf.as_slice(), b"abc");
        assert_eq!(buf.remaining(), 3);
    }

    #[test]
    fn overflow_without_auto_expand_keeps_cursor() {
        let mut buf = IoBuffer::allocate(2);
        let err = buf.put_slice(b"abc").expect_err("容量不足");
        assert_eq!(
            err,
            BufferError::Overflow {
                requested: 3,
                remaining: 2
            }
        );
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn auto_expand_grows_capacity_and_limit() {
        let mut buf = IoBuffer::allocate(2).with_auto_expand(true);
        buf.put_slice(b"hello").expect("自动扩容写入");
        assert!(buf.capacity() >= 5);
        assert_eq!(buf.position(), 5);
        buf.flip();
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn duplicate_shares_bytes_but_not_cursor() {
        let mut original = IoBuffer::copy_from_slice(b"payload");
        let mut dup = original.duplicate();
        assert_eq!(original.as_slice().as_ptr(), dup.as_slice().as_ptr());

        dup.skip(3).expect("推进副本");
        assert_eq!(original.position(), 0);
        assert_eq!(dup.as_slice(), b"load");
    }

    #[test]
    fn write_after_duplicate_does_not_leak_into_view() {
        let mut original = IoBuffer::copy_from_slice(b"abcd");
        let view = original.as_read_only();
        original.put_u8(b'z').expect("写时复制");
        assert_eq!(view.as_slice(), b"abcd");
        original.rewind();
        assert_eq!(original.as_slice(), b"zbcd");
    }

    #[test]
    fn read_only_view_rejects_writes() {
        let mut original = IoBuffer::copy_from_slice(b"ro");
        let mut view = original.as_read_only();
        assert_eq!(view.put_u8(1), Err(BufferError::ReadOnly));
    }

    #[test]
    fn slice_starts_at_zero_over_remaining_bytes() {
        let mut buf = IoBuffer::copy_from_slice(b"0123456789");
        buf.set_position(4).expect("设置位置");
        buf.set_limit(7).expect("设置 limit");
        let slice = buf.slice();
        assert_eq!(slice.position(), 0);
        assert_eq!(slice.as_slice(), b"456");
        assert_eq!(buf.position(), 4);
    }

    #[test]
    fn reset_without_mark_fails() {
        let mut buf = IoBuffer::allocate(4);
        assert_eq!(buf.reset(), Err(BufferError::InvalidMark));
        buf.set_position(2).expect("设置位置");
        buf.mark();
        buf.set_position(3).expect("设置位置");
        buf.reset().expect("回到 mark");
        assert_eq!(buf.position(), 2);
    }

    #[test]
    fn split_to_advances_and_returns_prefix() {
        let mut buf = IoBuffer::copy_from_slice(b"headbody");
        let head = buf.split_to(4).expect("拆分");
        assert_eq!(head.as_slice(), b"head");
        assert_eq!(buf.as_slice(), b"body");
    }
}
