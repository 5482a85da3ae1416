//! 日志安装：独立测试二进制，确保全局订阅者只由本测试设置。

use gateway_session::logging::{self, LoggingError};

#[test]
fn install_refuses_to_replace_existing_subscriber() {
    logging::install().expect("首次安装成功");
    tracing::info!(target: "gateway_session", "logging installed");
    assert!(matches!(
        logging::install(),
        Err(LoggingError::SubscriberAlreadySet)
    ));
}
