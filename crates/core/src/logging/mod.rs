//! 日志初始化
//!
//! 所有组件都通过 `tracing` 宏记录日志，这里只负责安装全局订阅者。
//! `RUST_LOG` 环境变量优先于配置中的级别。

pub mod log_config;
pub mod log_level;

pub use log_config::{LogConfig, OutputFormat};
pub use log_level::LogLevel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{GridError, GridResult};

/// 安装全局 tracing 订阅者
///
/// 重复调用会返回配置错误（全局订阅者只能设置一次）。
pub fn init_logging(config: &LogConfig) -> GridResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.include_target)
        .with_thread_names(config.include_thread_names);

    let result = match config.format {
        OutputFormat::Json => registry.with(fmt_layer.json()).try_init(),
        OutputFormat::Pretty => registry.with(fmt_layer.pretty()).try_init(),
        OutputFormat::Compact => registry.with(fmt_layer.compact()).try_init(),
    };

    result.map_err(|e| GridError::Configuration(format!("初始化日志系统失败: {e}")))
}
