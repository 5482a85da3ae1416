//! `gateway-buffer` 提供会话桥接层使用的字节缓冲与分配器。
//!
//! # 模块定位（Why）
//! - 会话的读路径、编码路径都需要一块“带游标”的字节区域；绝大多数流量只有单一写者，
//!   因此默认形态是**独占缓冲**（[`IoBuffer`]），游标就地推进，无需任何同步；
//! - 少数场景下同一块字节既要交给传输层写出，又要被会话保留用于记账（例如部分写重试），
//!   此时使用**共享缓冲**（[`SharedBuffer`]）：底层字节不可变，每个消费者持有独立游标。
//!
//! # 设计概要（How）
//! - 底层存储基于 `bytes::BytesMut`/`Bytes`：独占缓冲在首次被复制（`duplicate`/`slice`）时冻结为
//!   `Bytes`，之后若再写入则执行写时复制，保证“被引用的字节永不改变身份”；
//! - 共享缓冲以 `DashMap<ConsumerId, IoBuffer>` 缓存每个消费者（默认按线程区分）的游标，
//!   首次访问时惰性创建；
//! - [`BufferAllocator`] 抽象分配入口，[`HeapAllocator`] 直接向堆申请，[`PooledAllocator`]
//!   以自由链表复用 `BytesMut`。
//!
//! # 命名约定（Consistency）
//! - 游标语义沿用 `position`/`limit`/`mark` 术语：`position ≤ limit ≤ capacity`；
//! - 所有越界或只读违规均返回 [`BufferError`]，不会 panic。

mod allocator;
mod error;
mod io_buffer;
mod shared;

pub use allocator::{AllocatorStats, BufferAllocator, HeapAllocator, PooledAllocator, WrappedBuffer};
pub use error::BufferError;
pub use io_buffer::{BufferMode, IoBuffer};
pub use shared::{ConsumerId, SharedBuffer};
