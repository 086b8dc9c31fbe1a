use std::str::FromStr;

use crate::logging::log_level::LogLevel;

/// 日志配置，对应配置文件中的 `[logging]` 段
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 最低输出级别，`RUST_LOG` 优先
    pub level: LogLevel,
    pub format: OutputFormat,
    /// 每行输出模块路径
    pub include_target: bool,
    /// 输出线程名，便于区分事件循环与执行池
    pub include_thread_names: bool,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    /// 多行可读格式
    #[default]
    Pretty,
    /// 单行紧凑格式，也接受 `text`
    Compact,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" | "text" => Ok(OutputFormat::Compact),
            _ => Err(format!(
                "无效的日志格式: {s}，可选值: json, pretty, compact"
            )),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: OutputFormat::Pretty,
            include_target: true,
            include_thread_names: false,
        }
    }
}
