//! TaskGrid 计算节点
//!
//! - [`executor`]：按任务类型注册的执行器
//! - [`execution`]：执行池、任务包登记、取消与超时
//! - [`node`]：与 Driver 的连接、握手与重连

pub mod execution;
pub mod executor;
pub mod node;

pub use execution::{
    ExecutionManager, ExecutionManagerListener, ExecutionPool, JobPendingEntry,
    JobProcessingEntry, NodeTask,
};
pub use executor::{EchoExecutor, ExecutorRegistry, SleepExecutor, TaskContext, TaskExecutor};
pub use node::{reconnect_delay, Node, SessionEnd};
