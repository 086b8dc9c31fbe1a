//! # 数据模型
//!
//! 任务网格中在 Driver、Node 与客户端之间流转的核心数据结构。
//!
//! ## 核心模型
//!
//! ### TaskBundle - 任务包头
//! 一次分发的元数据：所属作业、包序号、任务数量、SLA 以及重排队标记。
//!
//! ### ServerTask / TaskResult - 单个任务
//! 以 `position` 标识任务在原作业中的位置，结果按位置重新组装。
//!
//! ### JobSla / ExecutionPolicy - 服务级别属性
//! 优先级、最大通道数、挂起、广播、过期时间以及节点匹配规则。
//!
//! ### NodeInfo / NodeManagementInfo - 节点信息
//! 节点握手时上报的身份与能力。
//!
//! ## 引用方式
//!
//! 对象之间不持有互相的引用，统一用作业 UUID 或
//! [`bundle_key`] 生成的字符串键关联。
//!
//! ```text
//! 作业状态流转（Driver 端）：
//! Queued → Dispatched(部分) → Dispatched(全部) → Completed
//!    ↑           │                   │
//!    └── requeue ┴───────────────────┘
//! ```

pub mod bundle;
pub mod node;
pub mod policy;
pub mod sla;
pub mod task;

pub use bundle::*;
pub use node::*;
pub use policy::*;
pub use sla::*;
pub use task::*;
