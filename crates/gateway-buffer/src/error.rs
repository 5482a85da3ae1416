use thiserror::Error;

/// 缓冲操作失败的原因。
///
/// # 教案式说明
/// - **意图 (Why)**：游标越界、只读写入等违规必须以可恢复的错误返回，编解码过滤器据此决定是
///   等待更多数据还是终止会话；
/// - **契约 (What)**：每个变体都携带触发时的游标快照，[`BufferError::code`] 提供稳定错误码；
/// - **风险 (Trade-offs)**：错误只描述单次调用，不记录缓冲身份，排障时需结合调用方日志。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// 写入长度超过剩余空间，且缓冲未开启自动扩容。
    #[error("buffer overflow: requested {requested} bytes, {remaining} remaining")]
    Overflow { requested: usize, remaining: usize },

    /// 读取长度超过剩余可读字节。
    #[error("buffer underflow: requested {requested} bytes, {remaining} remaining")]
    Underflow { requested: usize, remaining: usize },

    /// 对只读视图执行写操作。
    #[error("buffer is read-only")]
    ReadOnly,

    /// 设置的 position 超出 limit。
    #[error("invalid position {position}: limit is {limit}")]
    InvalidPosition { position: usize, limit: usize },

    /// 设置的 limit 超出 capacity。
    #[error("invalid limit {limit}: capacity is {capacity}")]
    InvalidLimit { limit: usize, capacity: usize },

    /// 调用 `reset` 时尚未设置 mark，或 mark 已因 position 回退失效。
    #[error("buffer mark is not set")]
    InvalidMark,
}

impl BufferError {
    /// 返回稳定错误码，供日志与告警聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            BufferError::Overflow { .. } => "gateway.buffer.overflow",
            BufferError::Underflow { .. } => "gateway.buffer.underflow",
            BufferError::ReadOnly => "gateway.buffer.read_only",
            BufferError::InvalidPosition { .. } => "gateway.buffer.invalid_position",
            BufferError::InvalidLimit { .. } => "gateway.buffer.invalid_limit",
            BufferError::InvalidMark => "gateway.buffer.invalid_mark",
        }
    }
}
