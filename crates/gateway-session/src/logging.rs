//! 一次性日志安装入口。
//!
//! # 教案式说明
//! - **意图 (Why)**：桥接层只通过 `tracing` 宏记录事件，宿主进程需要一个订阅者才能看到输出；
//!   本模块提供“一行安装”的默认组合，宿主也可以完全忽略它自行配置；
//! - **逻辑 (How)**：组装 `fmt` 层与 `EnvFilter`，过滤规则优先取 `GATEWAY_LOG`，
//!   其次 `RUST_LOG`，都没有时为 `info`；
//! - **契约 (What)**：若全局订阅者已存在，返回 [`LoggingError::SubscriberAlreadySet`]，不覆盖宿主配置。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 过滤规则所用的环境变量名。
pub const LOG_ENV: &str = "GATEWAY_LOG";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    #[error("failed to install tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn install() -> Result<(), LoggingError> {
    if dispatcher::has_been_set() {
        return Err(LoggingError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer().with_thread_names(true));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
