//! 会话与服务配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：会话在创建时拷贝一份配置快照，之后服务层对配置的修改只影响新会话，
//!   避免运行中的会话看到读缓冲上下限在两次读取之间跳变；
//! - **逻辑 (How)**：[`SessionConfig`] 与 [`ServiceConfig`] 均可由 TOML 反序列化，未知字段直接拒绝；
//!   运行期通过 [`SessionConfig::apply_option`] 以“键 = 字符串值”的形式逐项调整，
//!   每次调整后立即校验区间约束，失败时配置保持原样；
//! - **契约 (What)**：时长字段在 TOML 中以毫秒整数表示，键名带 `_ms` 后缀；
//!   空闲时长为 0 表示关闭对应类别的空闲检测。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::idle::IdleClass;

/// 配置解析或校验失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized session option `{key}`")]
    UnrecognizedOption { key: String },

    #[error("invalid value `{value}` for option `{key}`")]
    InvalidValue { key: String, value: String },

    #[error("read buffer bounds violate min <= default <= max: {min} / {default} / {max}")]
    ReadBufferBounds {
        min: usize,
        default: usize,
        max: usize,
    },

    #[error("option `{key}` must be greater than zero")]
    Zero { key: &'static str },

    #[error("failed to parse configuration: {message}")]
    Parse { message: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::UnrecognizedOption { .. } => "gateway.config.unrecognized_option",
            ConfigError::InvalidValue { .. } => "gateway.config.invalid_value",
            ConfigError::ReadBufferBounds { .. } => "gateway.config.read_buffer_bounds",
            ConfigError::Zero { .. } => "gateway.config.zero",
            ConfigError::Parse { .. } => "gateway.config.parse",
        }
    }
}

/// 单个会话的配置快照。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub min_read_buffer_size: usize,
    pub read_buffer_size: usize,
    pub max_read_buffer_size: usize,
    #[serde(rename = "reader_idle_time_ms", with = "millis")]
    pub reader_idle_time: Duration,
    #[serde(rename = "writer_idle_time_ms", with = "millis")]
    pub writer_idle_time: Duration,
    #[serde(rename = "both_idle_time_ms", with = "millis")]
    pub both_idle_time: Duration,
    #[serde(rename = "throughput_interval_ms", with = "millis")]
    pub throughput_interval: Duration,
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout: Duration,
    /// 开启后收到的消息同时进入 [`Session::read`](crate::Session::read) 的读取队列。
    pub use_read_operation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_read_buffer_size: 64,
            read_buffer_size: 2048,
            max_read_buffer_size: 65_536,
            reader_idle_time: Duration::ZERO,
            writer_idle_time: Duration::ZERO,
            both_idle_time: Duration::ZERO,
            throughput_interval: Duration::from_secs(3),
            write_timeout: Duration::from_secs(60),
            use_read_operation: false,
        }
    }
}

impl SessionConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(text).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 按键名调整单个选项；未识别的键或非法的值返回错误，配置保持原样。
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut candidate = self.clone();
        match key {
            "min_read_buffer_size" => candidate.min_read_buffer_size = parse(key, value)?,
            "read_buffer_size" => candidate.read_buffer_size = parse(key, value)?,
            "max_read_buffer_size" => candidate.max_read_buffer_size = parse(key, value)?,
            "reader_idle_time_ms" => candidate.reader_idle_time = parse_millis(key, value)?,
            "writer_idle_time_ms" => candidate.writer_idle_time = parse_millis(key, value)?,
            "both_idle_time_ms" => candidate.both_idle_time = parse_millis(key, value)?,
            "throughput_interval_ms" => candidate.throughput_interval = parse_millis(key, value)?,
            "write_timeout_ms" => candidate.write_timeout = parse_millis(key, value)?,
            "use_read_operation" => candidate.use_read_operation = parse(key, value)?,
            _ => {
                return Err(ConfigError::UnrecognizedOption {
                    key: key.to_owned(),
                });
            }
        }
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_read_buffer_size == 0 {
            return Err(ConfigError::Zero {
                key: "min_read_buffer_size",
            });
        }
        if self.min_read_buffer_size > self.read_buffer_size
            || self.read_buffer_size > self.max_read_buffer_size
        {
            return Err(ConfigError::ReadBufferBounds {
                min: self.min_read_buffer_size,
                default: self.read_buffer_size,
                max: self.max_read_buffer_size,
            });
        }
        if self.throughput_interval.is_zero() {
            return Err(ConfigError::Zero {
                key: "throughput_interval_ms",
            });
        }
        Ok(())
    }

    /// 指定空闲类别的检测周期，0 表示关闭。
    pub fn idle_time(&self, class: IdleClass) -> Duration {
        match class {
            IdleClass::Reader => self.reader_idle_time,
            IdleClass::Writer => self.writer_idle_time,
            IdleClass::Both => self.both_idle_time,
        }
    }

    pub fn set_idle_time(&mut self, class: IdleClass, interval: Duration) {
        match class {
            IdleClass::Reader => self.reader_idle_time = interval,
            IdleClass::Writer => self.writer_idle_time = interval,
            IdleClass::Both => self.both_idle_time = interval,
        }
    }
}

/// 服务（Acceptor/Connector）级配置。
///
/// `session` 字段是新会话拷贝的模板；服务运行中替换整份配置只影响之后创建的会话。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// 传输层 I/O 工作线程数。
    pub io_workers: usize,
    /// 空闲监督器数量，会话按轮询方式分配。
    pub idle_supervisors: usize,
    /// 空闲监督器的时间粒度。
    #[serde(rename = "idle_tick_ms", with = "millis")]
    pub idle_tick: Duration,
    /// 每个会话投递给过滤器链的 I/O 类异常上限，0 表示不抑制。
    pub exception_threshold: usize,
    pub session: SessionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            io_workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            idle_supervisors: 1,
            idle_tick: Duration::from_millis(100),
            exception_threshold: 1,
            session: SessionConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(text).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero {
                key: "connect_timeout_ms",
            });
        }
        if self.io_workers == 0 {
            return Err(ConfigError::Zero { key: "io_workers" });
        }
        if self.idle_supervisors == 0 {
            return Err(ConfigError::Zero {
                key: "idle_supervisors",
            });
        }
        if self.idle_tick.is_zero() {
            return Err(ConfigError::Zero {
                key: "idle_tick_ms",
            });
        }
        self.session.validate()
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_option_is_rejected_and_config_unchanged() {
        let mut config = SessionConfig::default();
        let err = config
            .apply_option("tcp_nodelay", "true")
            .expect_err("未知选项必须被拒绝");
        assert_eq!(
            err,
            ConfigError::UnrecognizedOption {
                key: "tcp_nodelay".into()
            }
        );
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn bounds_violation_keeps_previous_values() {
        let mut config = SessionConfig::default();
        let err = config
            .apply_option("read_buffer_size", "1")
            .expect_err("默认值低于下限");
        assert!(matches!(err, ConfigError::ReadBufferBounds { .. }));
        assert_eq!(config.read_buffer_size, 2048);
    }

    #[test]
    fn idle_options_are_milliseconds() {
        let mut config = SessionConfig::default();
        config
            .apply_option("both_idle_time_ms", "1500")
            .expect("合法选项");
        assert_eq!(config.idle_time(IdleClass::Both), Duration::from_millis(1500));
        assert!(matches!(
            config.apply_option("writer_idle_time_ms", "soon"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn service_config_parses_nested_session_table() {
        let config = ServiceConfig::from_toml_str(
            r#"
            connect_timeout_ms = 500
            io_workers = 2
            exception_threshold = 3

            [session]
            reader_idle_time_ms = 250
            use_read_operation = true
            "#,
        )
        .expect("合法 TOML");
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.io_workers, 2);
        assert_eq!(config.exception_threshold, 3);
        assert_eq!(config.session.reader_idle_time, Duration::from_millis(250));
        assert!(config.session.use_read_operation);
        assert_eq!(config.idle_tick, Duration::from_millis(100));
    }

    #[test]
    fn unknown_toml_field_is_rejected() {
        let err = SessionConfig::from_toml_str("keep_alive = true").expect_err("未知字段");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
