//! 配置管理
//!
//! 配置由三层合并而成：结构体默认值、TOML 配置文件、`TASKGRID_` 前缀的环境变量
//! （嵌套字段用双下划线分隔，例如 `TASKGRID_DRIVER__BIND_ADDRESS`）。
//! 每个配置段都提供 `validate()`，加载后统一校验。

pub mod models;

pub use models::*;
