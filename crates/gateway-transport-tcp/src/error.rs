use std::io;

use thiserror::Error;

use crate::config::TcpConfigError;

/// 构建 TCP 传输时的失败。
#[derive(Debug, Error)]
pub enum TcpTransportError {
    #[error(transparent)]
    Config(#[from] TcpConfigError),

    #[error("failed to start tcp worker {index}: {cause}")]
    Worker { index: usize, cause: io::Error },
}

impl TcpTransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TcpTransportError::Config(_) => "gateway.transport.tcp.config_invalid",
            TcpTransportError::Worker { .. } => "gateway.transport.tcp.worker_failed",
        }
    }
}
