//! # 日志初始化模块
//!
//! 基于 `tracing-subscriber` 的 fmt 层，`RUST_LOG` 优先于配置文件中的级别。

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// 重复初始化不会 panic（测试与多次调用场景），返回是否由本次调用完成初始化
///
/// # 示例
/// ```rust,ignore
/// use dalvis_platform_core::config::LoggingConfig;
///
/// init_tracing_from_config(&LoggingConfig {
///     level: "info".to_string(),
///     with_thread_ids: true,
///     ..Default::default()
/// });
/// ```
pub fn init_tracing_from_config(config: &LoggingConfig) -> bool {
    // 优先使用环境变量 RUST_LOG，如果没有则使用配置文件的日志级别
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter);

    if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

/// 配置尚未加载时的最小日志初始化
pub fn init_default_tracing() -> bool {
    init_tracing_from_config(&LoggingConfig::default())
}

/// 加载配置期间在当前线程生效的临时日志输出
///
/// guard 释放后恢复原订阅者，随后仍可按配置调用 [`init_tracing_from_config`]
pub fn startup_tracing_guard() -> DefaultGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_does_not_panic() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        let first = init_tracing_from_config(&config);
        let second = init_tracing_from_config(&config);
        // 同一进程只会有一次成功
        assert!(!(first && second));
    }

    #[test]
    fn test_startup_guard_records_events_before_init() {
        let _guard = startup_tracing_guard();
        assert!(tracing::enabled!(tracing::Level::ERROR));
        tracing::warn!("emitted while configuration loads");
    }
}
