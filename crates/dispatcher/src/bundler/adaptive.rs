use taskgrid_core::{LoadBalancingConfig, Weighting};

use super::{
    allocation::{AllocationParams, SharedAllocation},
    data_holder::BundleDataHolder,
    is_valid_feedback, Bundler,
};

/// 基于共享样本表的自适应策略
///
/// 所有副本共享一张样本表，按 `weighting(maxMean / nodeMean)` 分配 `max_bundle_size`。
/// - `autotuned`: 线性权重
/// - `proportional`: 权重取配置值，默认平方
pub struct AdaptiveBundler {
    name: &'static str,
    shared: SharedAllocation,
    /// 原型没有登记，副本在 `copy()` 时登记
    id: Option<u64>,
    timestamp: u64,
}

impl AdaptiveBundler {
    pub fn new(name: &'static str, config: &LoadBalancingConfig, weighting: Weighting, timestamp: u64) -> Self {
        Self {
            name,
            shared: SharedAllocation::new(AllocationParams::from_config(config, weighting)),
            id: None,
            timestamp,
        }
    }

    pub fn autotuned(config: &LoadBalancingConfig, timestamp: u64) -> Self {
        Self::new("autotuned", config, Weighting::Linear, timestamp)
    }

    pub fn proportional(config: &LoadBalancingConfig, timestamp: u64) -> Self {
        Self::new("proportional", config, config.weighting, timestamp)
    }

    /// 调整本节点的样本窗口长度
    pub fn set_window_length(&mut self, window_length: usize) {
        if let Some(id) = self.id {
            self.shared.set_window_length(id, window_length);
        }
    }

    pub fn data_holder(&self) -> Option<BundleDataHolder> {
        self.id.and_then(|id| self.shared.holder(id))
    }

    fn register_copy(&self) -> Self {
        Self {
            name: self.name,
            shared: self.shared.clone(),
            id: Some(self.shared.register()),
            timestamp: self.timestamp,
        }
    }
}

impl Bundler for AdaptiveBundler {
    fn name(&self) -> &str {
        self.name
    }

    fn bundle_size(&self) -> usize {
        match self.id {
            Some(id) => self.shared.size(id),
            None => self.shared.params().initial_size.max(1),
        }
    }

    fn feedback(&mut self, completed: usize, total_time_nanos: f64) {
        if !is_valid_feedback(self.name, completed, total_time_nanos) {
            return;
        }
        if let Some(id) = self.id {
            self.shared.feedback(id, completed, total_time_nanos);
        }
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(self.register_copy())
    }

    fn dispose(&mut self) {
        if let Some(id) = self.id.take() {
            self.shared.unregister(id);
        }
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}
