//! 按比例分配的共享状态
//!
//! 所有参与节点分享 `max_bundle_size`：样本不足 `min_samples_to_analyse` 的节点保持
//! 原大小，其余节点按 `weighting(maxMean / nodeMean)` 的权重分配剩余额度，
//! 取整后的余数交给平均耗时最小的节点，保证参与节点与非参与节点之和恰好等于
//! `max_bundle_size`。
//!
//! 每个参与节点至少分到 1 个任务。非参与节点已占满额度时，参与节点各取 1，
//! 总和会超过 `max_bundle_size`，直到这些节点的样本足够参与分配。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use taskgrid_core::{LoadBalancingConfig, Weighting};
use tracing::debug;

use super::data_holder::BundleDataHolder;

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationParams {
    pub initial_size: usize,
    pub max_bundle_size: usize,
    pub window_length: usize,
    pub min_samples_to_analyse: usize,
    pub weighting: Weighting,
}

impl AllocationParams {
    pub fn from_config(config: &LoadBalancingConfig, weighting: Weighting) -> Self {
        Self {
            initial_size: config.size,
            max_bundle_size: config.max_bundle_size,
            window_length: config.performance_cache_size,
            min_samples_to_analyse: config.min_samples_to_analyse,
            weighting,
        }
    }
}

#[derive(Debug)]
struct AllocationState {
    params: AllocationParams,
    holders: HashMap<u64, BundleDataHolder>,
    next_id: u64,
}

/// 多个策略副本共享的样本表
#[derive(Debug, Clone)]
pub struct SharedAllocation {
    inner: Arc<Mutex<AllocationState>>,
}

impl SharedAllocation {
    pub fn new(params: AllocationParams) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AllocationState {
                params,
                holders: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocationState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn params(&self) -> AllocationParams {
        self.lock().params.clone()
    }

    /// 登记一个新节点，初始大小取配置值
    pub fn register(&self) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let holder = BundleDataHolder::new(state.params.window_length, state.params.initial_size);
        state.holders.insert(id, holder);
        id
    }

    pub fn unregister(&self, id: u64) {
        let mut state = self.lock();
        if state.holders.remove(&id).is_some() {
            rebalance(&mut state);
        }
    }

    pub fn size(&self, id: u64) -> usize {
        let state = self.lock();
        state
            .holders
            .get(&id)
            .map(|h| h.size())
            .unwrap_or(state.params.initial_size.max(1))
    }

    pub fn feedback(&self, id: u64, completed: usize, total_time_nanos: f64) {
        let mut state = self.lock();
        if let Some(holder) = state.holders.get_mut(&id) {
            holder.add_sample(completed, total_time_nanos);
            rebalance(&mut state);
        }
    }

    pub fn set_window_length(&self, id: u64, window_length: usize) {
        if let Some(holder) = self.lock().holders.get_mut(&id) {
            holder.set_window_length(window_length);
        }
    }

    pub fn holder(&self, id: u64) -> Option<BundleDataHolder> {
        self.lock().holders.get(&id).cloned()
    }

    /// 当前所有登记节点的大小
    pub fn sizes(&self) -> HashMap<u64, usize> {
        self.lock()
            .holders
            .iter()
            .map(|(id, h)| (*id, h.size()))
            .collect()
    }
}

fn rebalance(state: &mut AllocationState) {
    let min_samples = state.params.min_samples_to_analyse;
    let participants: Vec<(u64, f64)> = state
        .holders
        .iter()
        .filter(|(_, h)| h.sample_count() >= min_samples && h.mean() > 0.0)
        .map(|(id, h)| (*id, h.mean()))
        .collect();
    if participants.is_empty() {
        return;
    }

    let fixed: usize = state
        .holders
        .iter()
        .filter(|(id, _)| !participants.iter().any(|(p, _)| p == *id))
        .map(|(_, h)| h.size())
        .sum();
    // 每个参与节点至少 1 个任务
    let budget = state
        .params
        .max_bundle_size
        .saturating_sub(fixed)
        .max(participants.len());

    let max_mean = participants
        .iter()
        .map(|(_, mean)| *mean)
        .fold(f64::MIN, f64::max);
    let weights: Vec<(u64, f64)> = participants
        .iter()
        .map(|(id, mean)| (*id, state.params.weighting.apply(max_mean / mean)))
        .collect();
    let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();

    let mut sizes: Vec<(u64, usize)> = weights
        .iter()
        .map(|(id, w)| (*id, ((budget as f64 * w / total_weight).floor() as usize).max(1)))
        .collect();

    let allocated: usize = sizes.iter().map(|(_, s)| s).sum();
    if allocated < budget {
        // 余数给平均耗时最小的节点
        let fastest = participants
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| *id);
        if let Some(entry) = sizes.iter_mut().find(|(id, _)| Some(*id) == fastest) {
            entry.1 += budget - allocated;
        }
    } else {
        let mut excess = allocated - budget;
        while excess > 0 {
            let Some(largest) = sizes.iter_mut().filter(|(_, s)| *s > 1).max_by_key(|(_, s)| *s) else {
                break;
            };
            largest.1 -= 1;
            excess -= 1;
        }
    }

    for (id, size) in &sizes {
        if let Some(holder) = state.holders.get_mut(id) {
            holder.set_size(*size);
        }
    }
    debug!("重新分配分包大小: {:?} (预算 {})", sizes, budget);
}
