//! TaskGrid 核心库：错误类型、配置、日志、数据模型、线上协议与统计。

pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod statistics;

pub use self::config::{Algorithm, AppConfig, DriverConfig, LoadBalancingConfig, NodeConfig, Weighting};
pub use errors::*;
pub use logging::{init_logging, LogConfig, LogLevel, OutputFormat};
pub use statistics::{labels, GridStatistics, SnapshotKind, StatisticsSnapshot, StatsSnapshot};
