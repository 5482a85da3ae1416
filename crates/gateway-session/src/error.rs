use std::{fmt, io, net::SocketAddr, sync::Arc, thread::ThreadId, time::Duration};

use thiserror::Error;

use crate::{config::ConfigError, session::SessionId};

/// 描述一次底层操作对应的稳定错误码与默认文案。
///
/// 传输实现以这些常量把原生 `io::Error` 映射为 [`BridgeError::Transport`]，
/// 会话层据此做 I/O 类异常的抑制与日志聚合。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const BIND: OperationKind = OperationKind {
    code: "gateway.transport.bind_failed",
    message: "bind",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "gateway.transport.accept_failed",
    message: "accept",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "gateway.transport.connect_failed",
    message: "connect",
};
pub const READ: OperationKind = OperationKind {
    code: "gateway.transport.read_failed",
    message: "read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "gateway.transport.write_failed",
    message: "write",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "gateway.transport.shutdown_failed",
    message: "shutdown",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "gateway.transport.configure_failed",
    message: "configure",
};

/// 单个地址的绑定失败记录，保留传输层的原始原因。
#[derive(Clone, Debug)]
pub struct BindFailure {
    pub address: SocketAddr,
    pub cause: Arc<io::Error>,
}

/// 关闭时被丢弃的写请求摘要。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscardedWrite {
    /// 写请求在会话内的序号。
    pub request_id: u64,
    /// 丢弃时尚未写出的字节数。
    pub remaining: usize,
}

/// 会话桥接层的统一错误类型。
///
/// # 教案式说明
/// - **意图 (Why)**：绑定、建连、写出与线程约束的失败需要同时送达完成信号与过滤器链，
///   因此错误必须可克隆；原生 `io::Error` 以 `Arc` 持有，克隆只增加引用计数；
/// - **契约 (What)**：[`BridgeError::code`] 返回稳定错误码；[`BridgeError::is_io_class`]
///   标记“连接已坏”一类的错误，会话只向过滤器链投递其中的前若干个；
/// - **风险 (Trade-offs)**：`Transport` 变体把原因压扁为操作类别加原生错误，
///   更细粒度的分类需要调用方检查 `cause.kind()`。
#[derive(Clone, Debug, Error)]
pub enum BridgeError {
    #[error("bind failed for {}", FailedAddresses(failures))]
    Bind { failures: Arc<Vec<BindFailure>> },

    #[error("connect to {remote} failed: {cause}")]
    Connect {
        remote: SocketAddr,
        cause: Arc<io::Error>,
    },

    #[error("connect to {remote} timed out after {timeout:?}")]
    ConnectTimeout { remote: SocketAddr, timeout: Duration },

    #[error("{} write request(s) discarded: session {session_id} is closed", requests.len())]
    WriteToClosedSession {
        session_id: SessionId,
        requests: Arc<Vec<DiscardedWrite>>,
    },

    #[error("{}: {cause}", operation.message)]
    Transport {
        operation: OperationKind,
        cause: Arc<io::Error>,
    },

    #[error("session {session_id} is confined to {owner:?}, called from {caller:?}")]
    ConfinementViolation {
        session_id: SessionId,
        owner: ThreadId,
        caller: ThreadId,
    },

    #[error("session {session_id} state is already borrowed on its affinity thread")]
    ReentrantAccess { session_id: SessionId },

    #[error("session {session_id} is closed")]
    SessionClosed { session_id: SessionId },

    #[error("session {session_id} has not written anything for {elapsed:?}")]
    WriteTimeout {
        session_id: SessionId,
        elapsed: Duration,
    },

    #[error("session {session_id} does not enable the read operation")]
    ReadOperationDisabled { session_id: SessionId },

    #[error("service has been disposed")]
    Disposed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// 将原生 I/O 错误归入指定操作类别。
    pub fn from_io(operation: OperationKind, cause: io::Error) -> Self {
        BridgeError::Transport {
            operation,
            cause: Arc::new(cause),
        }
    }

    pub fn connect(remote: SocketAddr, cause: io::Error) -> Self {
        BridgeError::Connect {
            remote,
            cause: Arc::new(cause),
        }
    }

    /// 返回稳定错误码，供日志与告警聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Bind { .. } => "gateway.session.bind_failed",
            BridgeError::Connect { .. } => "gateway.session.connect_failed",
            BridgeError::ConnectTimeout { .. } => "gateway.session.connect_timeout",
            BridgeError::WriteToClosedSession { .. } => "gateway.session.write_to_closed",
            BridgeError::Transport { operation, .. } => operation.code,
            BridgeError::ConfinementViolation { .. } => "gateway.session.confinement_violation",
            BridgeError::ReentrantAccess { .. } => "gateway.session.reentrant_access",
            BridgeError::SessionClosed { .. } => "gateway.session.closed",
            BridgeError::WriteTimeout { .. } => "gateway.session.write_timeout",
            BridgeError::ReadOperationDisabled { .. } => "gateway.session.read_disabled",
            BridgeError::Disposed => "gateway.session.disposed",
            BridgeError::Config(err) => err.code(),
        }
    }

    /// 是否属于“连接已坏”一类、同一会话会成串出现的错误。
    pub fn is_io_class(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport { .. }
                | BridgeError::WriteToClosedSession { .. }
                | BridgeError::SessionClosed { .. }
        )
    }

    /// 绑定失败时列出失败的地址，其余变体返回空切片。
    pub fn bind_failures(&self) -> &[BindFailure] {
        match self {
            BridgeError::Bind { failures } => failures.as_slice(),
            _ => &[],
        }
    }

    /// 关闭时被丢弃的写请求，其余变体返回空切片。
    pub fn discarded_writes(&self) -> &[DiscardedWrite] {
        match self {
            BridgeError::WriteToClosedSession { requests, .. } => requests.as_slice(),
            _ => &[],
        }
    }

    /// 原生 I/O 原因（若有）。
    pub fn io_cause(&self) -> Option<&io::Error> {
        match self {
            BridgeError::Connect { cause, .. } | BridgeError::Transport { cause, .. } => {
                Some(cause.as_ref())
            }
            BridgeError::Bind { failures } => failures.first().map(|f| f.cause.as_ref()),
            _ => None,
        }
    }
}

struct FailedAddresses<'a>(&'a [BindFailure]);

impl fmt::Display for FailedAddresses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, failure) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} ({})", failure.address, failure.cause)?;
        }
        Ok(())
    }
}
