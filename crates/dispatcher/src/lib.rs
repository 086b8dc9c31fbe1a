//! TaskGrid Driver
//!
//! 接收客户端作业，按分包策略切片后分发给节点，汇总结果返回客户端。
//!
//! - [`queue`]：优先级作业队列
//! - [`bundler`]：分包大小策略（固定、自适应、按比例、按节点线程数、自定义）
//! - [`node_context`] / [`node_server`]：节点连接状态机与服务循环
//! - [`client_context`] / [`client_server`]：客户端连接状态与服务循环
//! - [`driver`]：监听、连接分流、过期扫描、停止与重启

pub mod admin;
pub mod bundler;
pub mod client_context;
pub mod client_server;
pub mod driver;
pub mod job;
pub mod node_context;
pub mod node_server;
pub mod queue;
pub mod registry;

pub use bundler::{Bundler, BundlerFactory, BundlerProvider, JobAwareness, NodeAwareness};
pub use driver::{Driver, DriverContext, DriverExit};
pub use job::{NodeBundle, RequeueReason, ServerJob};
pub use queue::JobQueue;
