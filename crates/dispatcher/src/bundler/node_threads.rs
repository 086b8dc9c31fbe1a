use taskgrid_core::{models::NodeInfo, LoadBalancingConfig};
use tracing::debug;

use super::{Bundler, NodeAwareness};

/// 按节点执行线程数分包：`threads × multiplier`
///
/// 收到节点信息之前使用配置的初始大小。
#[derive(Debug, Clone)]
pub struct NodeThreadsBundler {
    size: usize,
    multiplier: usize,
    timestamp: u64,
}

impl NodeThreadsBundler {
    pub fn new(config: &LoadBalancingConfig, timestamp: u64) -> Self {
        Self {
            size: config.size.max(1),
            multiplier: config.threads_multiplier.max(1),
            timestamp,
        }
    }
}

impl Bundler for NodeThreadsBundler {
    fn name(&self) -> &str {
        "nodethreads"
    }

    fn bundle_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, _completed: usize, _total_time_nanos: f64) {}

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(self.clone())
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAwareness> {
        Some(self)
    }
}

impl NodeAwareness for NodeThreadsBundler {
    fn set_node_info(&mut self, info: &NodeInfo) {
        self.size = (info.threads * self.multiplier).max(1);
        debug!("节点 {} 线程数 {}，分包大小 {}", info.uuid, info.threads, self.size);
    }
}
