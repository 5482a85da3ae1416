//! TCP 传输配置。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TcpConfigError {
    #[error("option `{key}` must be greater than zero")]
    Zero { key: &'static str },

    #[error("failed to parse tcp transport configuration: {message}")]
    Parse { message: String },
}

/// 监听与套接字选项；工作线程数取自服务配置的 `io_workers`。
///
/// 时长在 TOML 中以毫秒整数表示。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TcpTransportConfig {
    pub backlog: u32,
    pub nodelay: bool,
    pub keepalive: bool,
    /// 关停时等待连接任务自行收尾的上限。
    pub shutdown_grace_ms: u64,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            nodelay: true,
            keepalive: false,
            shutdown_grace_ms: 1_000,
        }
    }
}

impl TcpTransportConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, TcpConfigError> {
        let config: TcpTransportConfig =
            toml::from_str(text).map_err(|err| TcpConfigError::Parse {
                message: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TcpConfigError> {
        if self.backlog == 0 {
            return Err(TcpConfigError::Zero { key: "backlog" });
        }
        Ok(())
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
