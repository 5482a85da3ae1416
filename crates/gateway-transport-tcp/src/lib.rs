#![doc = r#"
# gateway-transport-tcp

## 设计动机（Why）
- **定位**：为 `gateway-session` 的会话桥接层提供真实 TCP 套接字上的回调式通道传输。
- **架构角色**：实现 [`Transport`](gateway_session::transport::Transport)、
  [`TransportChannel`](gateway_session::transport::TransportChannel) 与
  [`BoundChannel`](gateway_session::transport::BoundChannel) 三个契约，会话层不感知 Tokio。

## 核心契约（What）
- 每个连接固定在一个工作线程上，连接的全部回调与执行器任务都在该线程执行；
- 同一连接上的写按提交顺序写出并按同样顺序完成；
- `on_closed` 恰好投递一次，投递前所有在途写的完成信号都已解决；
- 原生 I/O 错误按 `gateway_session::error` 中的操作类别映射为
  [`BridgeError::Transport`](gateway_session::BridgeError::Transport)。

## 实现策略（How）
- **执行框架**：每个工作线程一个 `current_thread` 运行时，连接按轮转分配；
- **监听**：`socket2` 同步完成绑定与监听，地址冲突在 `bind` 返回前报告；
- **读取**：读缓冲大小在会话配置的上下限之间自适应伸缩。

## 风险与考量（Trade-offs）
- 执行器任务与连接 I/O 共享工作线程，任务中的阻塞调用会拖慢同线程上的全部连接；
- 关停只在宽限期内等待连接收尾。
"#]

mod channel;
mod config;
mod error;
mod listener;
mod transport;
mod worker;

pub use config::{TcpConfigError, TcpTransportConfig};
pub use error::TcpTransportError;
pub use transport::TcpTransport;
