//! `gateway-session`：把回调式通道传输桥接为会话抽象。
//!
//! # 模块定位（Why）
//! - 传输层只会报告“已连接、收到字节、写完成、已关闭、异常”等原始事件，而协议层需要的是
//!   一个有身份、有写队列、有过滤器链、会在空闲时提醒、关闭时恰好通知一次的会话；
//! - 事件来自一小组 I/O 工作线程，每个连接固定在其中一条线程上（亲和线程）。本 crate 在此前提下
//!   保证单写者纪律，而不是在热路径上加锁。
//!
//! # 结构概览（How）
//! - [`transport`]：桥接层与底层传输之间的契约；
//! - [`Session`]：会话状态机、写入口、关闭与读取；
//! - `write`：写队列与写处理器，按入队顺序发出，完成通知可异步重叠；
//! - [`idle`]：共享粗粒度定时器的空闲监督器，到期时自我修正；
//! - [`Filter`]/[`FilterChain`]：协议阶段观察会话事件的回调链；
//! - [`Acceptor`]/[`Connector`]：会话工厂，由 [`ServiceBuilder`] 构建；
//! - [`config`]/[`logging`]：配置加载与日志安装；
//! - `testing`（特性 `test-util`）：内存传输与事件循环，供集成测试使用。
//!
//! # 线程约束（What）
//! - 写、刷新、读取、挂起/恢复读、解除/恢复接入只能在亲和线程上调用，违规返回
//!   [`BridgeError::ConfinementViolation`]；
//! - [`Session::close`] 与 [`Session::notify_idle`] 可在任意线程调用。

mod acceptor;
mod affinity;
pub mod clock;
pub mod config;
mod connector;
pub mod error;
pub mod executor;
pub mod filter;
pub mod future;
mod handler;
pub mod idle;
pub mod logging;
pub mod message;
mod service;
mod session;
mod stats;
pub mod transport;
mod write;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use acceptor::Acceptor;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ServiceConfig, SessionConfig};
pub use connector::{ConnectFuture, Connector};
pub use error::{BindFailure, BridgeError, DiscardedWrite, OperationKind};
pub use executor::{IoExecutor, Task};
pub use filter::{Filter, FilterChain, FilterChainBuilder, WriteTimeoutFilter};
pub use future::{CloseFuture, CompletionFuture, ReadFuture, WriteFuture};
pub use idle::{IdleClass, IdleGate, IdleSupervisor, IdleSupervisorPool, IdleTarget};
pub use message::{FileRegion, Message};
pub use service::{IdleDriver, ServiceBuilder, SessionInitializer};
pub use session::{Session, SessionId, SessionState};
pub use stats::{ServiceStatistics, SessionStatistics};
pub use write::WriteRequest;

pub use gateway_buffer as buffer;
