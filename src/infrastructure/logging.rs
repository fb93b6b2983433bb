//! 日志系统配置模块
//! 结构化日志 + 日志级别配置（RUST_LOG 优先）

use crate::config::LoggingConfig;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// 初始化日志系统
///
/// 全局 subscriber 只能安装一次，重复调用返回错误。
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    // 设置日志级别过滤器
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // 根据配置选择日志格式
    if config.format == "json" {
        init_json_logging(filter)?;
    } else {
        init_text_logging(filter, config.ansi)?;
    }

    Ok(())
}

/// 初始化JSON格式日志（结构化日志）
fn init_json_logging(filter: EnvFilter) -> Result<(), Box<dyn std::error::Error>> {
    Registry::default()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_timer(ChronoUtc::rfc_3339()),
        )
        .try_init()?;

    Ok(())
}

/// 初始化文本格式日志
fn init_text_logging(filter: EnvFilter, ansi: bool) -> Result<(), Box<dyn std::error::Error>> {
    Registry::default()
        .with(filter)
        .with(
            fmt::layer()
                .with_timer(ChronoUtc::rfc_3339())
                .with_target(true)
                .with_ansi(ansi),
        )
        .try_init()?;

    Ok(())
}

/// 简化初始化（使用默认配置）
pub fn init_default_logging() {
    let config = LoggingConfig::default();
    init_logging(&config).unwrap_or_else(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        // 回退到最基本的日志初始化
        let _ = tracing_subscriber::fmt().try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "text".to_string(),
            ansi: false,
        };

        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
