//! 负载均衡（分包大小）策略
//!
//! 每个节点连接持有一个 [`Bundler`]，由 [`BundlerFactory`] 从原型复制得到。
//! 自适应策略的副本共享同一份样本表，一个节点的反馈会重新分配所有节点的大小。

pub mod adaptive;
pub mod allocation;
pub mod data_holder;
pub mod factory;
pub mod fixed;
pub mod node_threads;

pub use adaptive::AdaptiveBundler;
pub use data_holder::BundleDataHolder;
pub use factory::{BundlerFactory, BundlerProvider};
pub use fixed::FixedSizeBundler;
pub use node_threads::NodeThreadsBundler;

use taskgrid_core::models::{NodeInfo, TaskBundle};
use tracing::warn;

/// 分包策略
pub trait Bundler: Send {
    fn name(&self) -> &str;

    /// 当前建议的任务数，至少为 1
    fn bundle_size(&self) -> usize;

    /// 一轮分发完成后的反馈
    fn feedback(&mut self, completed: usize, total_time_nanos: f64);

    /// 为新的节点连接复制一个独立实例
    fn copy(&self) -> Box<dyn Bundler>;

    /// 节点断开时释放共享状态
    fn dispose(&mut self) {}

    /// 创建该实例的工厂版本号
    fn timestamp(&self) -> u64;

    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAwareness> {
        None
    }

    fn as_job_aware(&mut self) -> Option<&mut dyn JobAwareness> {
        None
    }
}

/// 需要节点信息的策略
pub trait NodeAwareness {
    fn set_node_info(&mut self, info: &NodeInfo);
}

/// 需要作业元数据的策略
pub trait JobAwareness {
    fn set_job_metadata(&mut self, bundle: &TaskBundle);
}

/// 数量为 0 或耗时不为正的反馈无效
pub(crate) fn is_valid_feedback(bundler: &str, completed: usize, total_time_nanos: f64) -> bool {
    if completed == 0 || !(total_time_nanos > 0.0) {
        warn!(
            "{} 收到无效反馈 (任务数: {}, 耗时: {}ns)，已丢弃",
            bundler, completed, total_time_nanos
        );
        return false;
    }
    true
}
