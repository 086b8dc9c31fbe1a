//! 网格统计
//!
//! [`GridStatistics`] 在 Driver 启动时创建，以 `Arc` 形式注入到队列、节点上下文和
//! 客户端上下文中，管理请求可以将其重置。每次更新同时写入 `metrics` 门面，
//! 安装了导出器的进程可以直接采集。

pub mod snapshot;

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use snapshot::{SnapshotKind, StatsSnapshot};

/// 统计标签
pub mod labels {
    /// 队列中的任务数
    pub const TASK_QUEUE_COUNT: &str = "task.queue.count";
    /// 累计入队的任务数
    pub const TASK_QUEUE_TOTAL: &str = "task.queue.total";
    /// 任务在队列中的停留时间（毫秒）
    pub const TASK_QUEUE_TIME: &str = "task.queue.time";
    /// 每次分发的任务数
    pub const TASK_DISPATCH: &str = "task.dispatch";
    /// 当前作业数
    pub const JOB_COUNT: &str = "job.count";
    /// 累计作业数
    pub const JOB_TOTAL: &str = "job.total";
    /// 作业从提交到完成的时间（毫秒）
    pub const JOB_TIME: &str = "job.time";
    /// Driver 测得的单任务往返时间（毫秒）
    pub const EXECUTION: &str = "execution";
    /// 节点上报的单任务执行时间（毫秒）
    pub const NODE_EXECUTION: &str = "node.execution";
    /// 单任务的传输开销（毫秒）
    pub const TRANSPORT_TIME: &str = "transport.time";
    pub const NODES: &str = "nodes";
    pub const IDLE_NODES: &str = "idle.nodes";
    pub const CLIENTS: &str = "clients";
    pub const BUNDLE_SIZE: &str = "bundle.size";
    /// 接收的字节数
    pub const TRAFFIC_IN: &str = "traffic.in";
    /// 发送的字节数
    pub const TRAFFIC_OUT: &str = "traffic.out";
}

/// 统计请求的响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub queue_size: StatsSnapshot,
    pub queue_time: StatsSnapshot,
    pub execution: StatsSnapshot,
    pub node_execution: StatsSnapshot,
    pub transport: StatsSnapshot,
    pub nodes: StatsSnapshot,
    pub idle_nodes: StatsSnapshot,
    pub clients: StatsSnapshot,
    pub jobs: StatsSnapshot,
    pub total_tasks_queued: StatsSnapshot,
    pub traffic_in: StatsSnapshot,
    pub traffic_out: StatsSnapshot,
    /// 当前配置的分包大小
    pub bundle_size: usize,
}

/// 线程安全的统计聚合器
#[derive(Debug)]
pub struct GridStatistics {
    snapshots: RwLock<HashMap<String, StatsSnapshot>>,
}

impl Default for GridStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl GridStatistics {
    /// 创建包含全部标准标签的聚合器
    pub fn new() -> Self {
        let stats = Self {
            snapshots: RwLock::new(HashMap::new()),
        };
        for label in [
            labels::TASK_QUEUE_COUNT,
            labels::TASK_QUEUE_TOTAL,
            labels::JOB_COUNT,
            labels::JOB_TOTAL,
            labels::NODES,
            labels::IDLE_NODES,
            labels::CLIENTS,
            labels::TRAFFIC_IN,
            labels::TRAFFIC_OUT,
        ] {
            stats.create_snapshot(label, SnapshotKind::Cumulative);
        }
        for label in [
            labels::TASK_QUEUE_TIME,
            labels::TASK_DISPATCH,
            labels::JOB_TIME,
            labels::EXECUTION,
            labels::NODE_EXECUTION,
            labels::TRANSPORT_TIME,
        ] {
            stats.create_snapshot(label, SnapshotKind::NonCumulative);
        }
        stats.create_snapshot(labels::BUNDLE_SIZE, SnapshotKind::SingleValue);
        stats
    }

    /// 创建快照，已存在时保持原样
    pub fn create_snapshot(&self, label: &str, kind: SnapshotKind) {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        snapshots
            .entry(label.to_string())
            .or_insert_with(|| StatsSnapshot::new(label, kind));
    }

    pub fn add_value(&self, label: &str, value: f64) {
        self.add_values(label, value, 1);
    }

    /// 向快照加入 `count` 个值；标签不存在时记录警告并丢弃
    pub fn add_values(&self, label: &str, accumulated: f64, count: u64) {
        let updated = {
            let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
            match snapshots.get_mut(label) {
                Some(snapshot) => {
                    snapshot.add_values(accumulated, count);
                    Some((snapshot.kind, snapshot.latest))
                }
                None => None,
            }
        };

        match updated {
            Some((kind, latest)) => mirror_to_metrics(label, kind, latest),
            None => warn!("统计标签 '{}' 不存在，丢弃数据", label),
        }
    }

    pub fn snapshot(&self, label: &str) -> Option<StatsSnapshot> {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        snapshots.get(label).cloned()
    }

    /// 所有快照的副本
    pub fn snapshot_copy(&self) -> HashMap<String, StatsSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reset(&self) {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        for snapshot in snapshots.values_mut() {
            snapshot.reset();
        }
    }

    pub fn to_response(&self, bundle_size: usize) -> StatisticsSnapshot {
        let copy = self.snapshot_copy();
        let get = |label: &str| {
            copy.get(label)
                .cloned()
                .unwrap_or_else(|| StatsSnapshot::new(label, SnapshotKind::NonCumulative))
        };
        StatisticsSnapshot {
            taken_at: Utc::now(),
            queue_size: get(labels::TASK_QUEUE_COUNT),
            queue_time: get(labels::TASK_QUEUE_TIME),
            execution: get(labels::EXECUTION),
            node_execution: get(labels::NODE_EXECUTION),
            transport: get(labels::TRANSPORT_TIME),
            nodes: get(labels::NODES),
            idle_nodes: get(labels::IDLE_NODES),
            clients: get(labels::CLIENTS),
            jobs: get(labels::JOB_COUNT),
            total_tasks_queued: get(labels::TASK_QUEUE_TOTAL),
            traffic_in: get(labels::TRAFFIC_IN),
            traffic_out: get(labels::TRAFFIC_OUT),
            bundle_size,
        }
    }
}

fn mirror_to_metrics(label: &str, kind: SnapshotKind, latest: f64) {
    let name = format!("taskgrid_{}", label.replace('.', "_"));
    match kind {
        SnapshotKind::NonCumulative => metrics::histogram!(name).record(latest),
        SnapshotKind::Cumulative | SnapshotKind::SingleValue => metrics::gauge!(name).set(latest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_standard_labels_exist() {
        let stats = GridStatistics::new();
        assert_eq!(
            stats.snapshot(labels::TASK_QUEUE_COUNT).unwrap().kind,
            SnapshotKind::Cumulative
        );
        assert_eq!(
            stats.snapshot(labels::EXECUTION).unwrap().kind,
            SnapshotKind::NonCumulative
        );
        assert!(stats.snapshot("unknown").is_none());
    }

    #[test]
    fn test_unknown_label_is_discarded() {
        let stats = GridStatistics::new();
        stats.add_value("unknown", 1.0);
        assert!(stats.snapshot("unknown").is_none());
    }

    #[test]
    fn test_reset_and_copy() {
        let stats = GridStatistics::new();
        stats.add_values(labels::EXECUTION, 40.0, 4);
        stats.add_value(labels::NODES, 2.0);

        let copy = stats.snapshot_copy();
        stats.reset();

        assert_eq!(copy[labels::EXECUTION].avg, 10.0);
        assert_eq!(stats.snapshot(labels::EXECUTION).unwrap().value_count, 0);
        assert_eq!(stats.snapshot(labels::NODES).unwrap().latest, 2.0);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(GridStatistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.add_value(labels::TASK_QUEUE_TOTAL, 1.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot(labels::TASK_QUEUE_TOTAL).unwrap().total, 800.0);
    }

    #[test]
    fn test_response() {
        let stats = GridStatistics::new();
        stats.add_value(labels::TASK_QUEUE_COUNT, 5.0);
        let response = stats.to_response(30);
        assert_eq!(response.queue_size.latest, 5.0);
        assert_eq!(response.bundle_size, 30);

        let json = serde_json::to_string(&response).unwrap();
        let decoded: StatisticsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, response);
    }
}
