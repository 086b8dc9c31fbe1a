use serde::{Deserialize, Serialize};

/// 快照类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// 累计型：`latest` 等于累计值，用于队列长度、节点数等水位
    Cumulative,
    /// 非累计型：每次加入的是独立样本，用于耗时统计
    NonCumulative,
    /// 单值型：只保留最近一次的值
    SingleValue,
}

/// 带标签的统计快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub label: String,
    pub kind: SnapshotKind,
    pub total: f64,
    pub latest: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub value_count: u64,
}

impl StatsSnapshot {
    pub fn new(label: impl Into<String>, kind: SnapshotKind) -> Self {
        Self {
            label: label.into(),
            kind,
            total: 0.0,
            latest: 0.0,
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            value_count: 0,
        }
    }

    /// 加入 `count` 个值，它们的和为 `accumulated`
    pub fn add_values(&mut self, accumulated: f64, count: u64) {
        match self.kind {
            SnapshotKind::Cumulative => {
                self.total += accumulated;
                self.latest = self.total;
                self.value_count += count;
                self.min = self.min.min(self.total);
                self.max = self.max.max(self.total);
                if self.value_count > 0 {
                    self.avg = self.total / self.value_count as f64;
                }
            }
            SnapshotKind::NonCumulative => {
                if count == 0 {
                    return;
                }
                let first = self.value_count == 0;
                self.total += accumulated;
                self.latest = accumulated / count as f64;
                self.value_count += count;
                if first {
                    self.min = self.latest;
                    self.max = self.latest;
                } else {
                    self.min = self.min.min(self.latest);
                    self.max = self.max.max(self.latest);
                }
                self.avg = self.total / self.value_count as f64;
            }
            SnapshotKind::SingleValue => {
                self.total = accumulated;
                self.latest = accumulated;
                self.value_count = 1;
                self.min = accumulated;
                self.max = accumulated;
                self.avg = accumulated;
            }
        }
    }

    /// 清空样本
    ///
    /// 累计型快照代表当前水位，重置后保留 `total`/`latest`，只清空历史的最小最大值。
    pub fn reset(&mut self) {
        match self.kind {
            SnapshotKind::Cumulative => {
                self.min = self.total;
                self.max = self.total;
                self.value_count = 0;
                self.avg = 0.0;
            }
            _ => {
                let label = std::mem::take(&mut self.label);
                *self = Self::new(label, self.kind);
            }
        }
    }
}
