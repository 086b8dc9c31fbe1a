use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use taskgrid_core::models::{ServerTask, TaskBundle, TaskResult};

/// 队列中的作业
///
/// 一次客户端提交（或广播作业的一份节点副本）。`pending` 只包含尚未分发的任务，
/// 已分发的任务由持有对应 [`NodeBundle`] 的节点上下文负责。
#[derive(Debug)]
pub struct ServerJob {
    /// 作业级包头，`job_uuid` 即队列中的键
    pub header: TaskBundle,
    /// 提交该作业的客户端连接
    pub client_uuid: Option<String>,
    /// 客户端视角的作业 UUID，广播副本与 `header.job_uuid` 不同
    pub client_job_uuid: String,
    pub data_provider: Arc<Vec<u8>>,
    pub pending: Vec<ServerTask>,
    /// 入队时间，切片和重排队时保持不变
    pub queued_at: DateTime<Utc>,
    pub(crate) queued_instant: Instant,
    pub expires_at: Option<DateTime<Utc>>,
    /// 广播副本只能分发给指定节点
    pub pinned_node: Option<String>,
    /// 正在节点上执行的包数量
    pub(crate) dispatched_channels: usize,
    pub(crate) next_bundle_id: u64,
    pub(crate) cancelled: bool,
}

impl ServerJob {
    pub fn new(header: TaskBundle, client_uuid: Option<String>, data_provider: Vec<u8>, tasks: Vec<ServerTask>) -> Self {
        let client_job_uuid = header.job_uuid.clone();
        Self {
            header,
            client_uuid,
            client_job_uuid,
            data_provider: Arc::new(data_provider),
            pending: tasks,
            queued_at: Utc::now(),
            queued_instant: Instant::now(),
            expires_at: None,
            pinned_node: None,
            dispatched_channels: 0,
            next_bundle_id: 0,
            cancelled: false,
        }
    }

    /// 为广播作业生成固定到某个节点的副本
    pub fn broadcast_copy(&self, node_uuid: &str) -> Self {
        let mut header = self.header.for_dispatch(0, self.header.task_count());
        header.job_uuid = format!("{}@{}", self.header.job_uuid, node_uuid);
        Self {
            header,
            client_uuid: self.client_uuid.clone(),
            client_job_uuid: self.client_job_uuid.clone(),
            data_provider: self.data_provider.clone(),
            pending: self.pending.clone(),
            queued_at: self.queued_at,
            queued_instant: self.queued_instant,
            expires_at: self.expires_at,
            pinned_node: Some(node_uuid.to_string()),
            dispatched_channels: 0,
            next_bundle_id: 0,
            cancelled: false,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.header.job_uuid
    }

    pub fn priority(&self) -> i32 {
        self.header.sla.priority
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn dispatched_channels(&self) -> usize {
        self.dispatched_channels
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.dispatched_channels == 0
    }
}

/// 分发给一个节点的任务包
#[derive(Debug, Clone)]
pub struct NodeBundle {
    /// 本次分发的包头（新的 `bundle_id` 与切片后的任务数）
    pub header: TaskBundle,
    pub tasks: Vec<ServerTask>,
    pub data_provider: Arc<Vec<u8>>,
    pub client_uuid: Option<String>,
    pub client_job_uuid: String,
}

impl NodeBundle {
    pub fn job_uuid(&self) -> &str {
        &self.header.job_uuid
    }

    pub fn positions(&self) -> Vec<usize> {
        self.tasks.iter().map(|t| t.position).collect()
    }

    /// 节点故障时调用：标记重排队并解除包头副本上的挂起标记
    pub fn mark_for_requeue(&mut self) {
        self.header.mark_requeue();
        self.header.sla.suspended = false;
    }
}

/// 重排队原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// 连接错误或节点崩溃
    NodeError,
    /// 包级别错误（节点返回了致命错误）
    BundleFailure,
    /// 节点按 Driver 要求取消并退回任务
    NodeRequest,
}

/// 重排队结果
#[derive(Debug, Default)]
pub struct RequeueOutcome {
    /// 回到队列的任务数
    pub requeued: usize,
    /// 作业已取消或已不存在，这些任务以取消状态返回客户端
    pub discarded: Vec<TaskResult>,
    /// 超过最大重提交次数，这些任务以错误状态返回客户端
    pub exhausted: Vec<TaskResult>,
    pub client_uuid: Option<String>,
    pub client_job_uuid: String,
}

/// 从队列中取消的作业
#[derive(Debug, Clone)]
pub struct CancelledJob {
    pub job_uuid: String,
    pub client_uuid: Option<String>,
    pub client_job_uuid: String,
    /// 尚未分发、已被移除的任务
    pub removed: Vec<TaskResult>,
    /// 仍有包在节点上执行
    pub in_flight: bool,
}

/// 作业的只读视图
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub uuid: String,
    pub name: String,
    pub priority: i32,
    pub suspended: bool,
    pub pending_tasks: usize,
    pub dispatched_channels: usize,
    pub queued_at: DateTime<Utc>,
    pub pinned_node: Option<String>,
}

impl From<&ServerJob> for JobSummary {
    fn from(job: &ServerJob) -> Self {
        Self {
            uuid: job.uuid().to_string(),
            name: job.header.name.clone(),
            priority: job.priority(),
            suspended: job.header.sla.suspended,
            pending_tasks: job.pending_count(),
            dispatched_channels: job.dispatched_channels,
            queued_at: job.queued_at,
            pinned_node: job.pinned_node.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_core::models::JobSla;

    fn job() -> ServerJob {
        let sla = JobSla {
            suspended: true,
            broadcast: true,
            ..Default::default()
        };
        let header = TaskBundle::new("j1", "render", 2, sla);
        let tasks = (0..2).map(|i| ServerTask::new(i, vec![i as u8])).collect();
        ServerJob::new(header, Some("c1".to_string()), vec![1, 2, 3], tasks)
    }

    #[test]
    fn test_broadcast_copy_is_pinned() {
        let job = job();
        let copy = job.broadcast_copy("node-a");
        assert_eq!(copy.uuid(), "j1@node-a");
        assert_eq!(copy.client_job_uuid, "j1");
        assert_eq!(copy.pinned_node.as_deref(), Some("node-a"));
        assert_eq!(copy.pending_count(), 2);
        assert!(Arc::ptr_eq(&copy.data_provider, &job.data_provider));
    }

    #[test]
    fn test_mark_for_requeue_clears_suspension_on_copy() {
        let job = job();
        let mut bundle = NodeBundle {
            header: job.header.for_dispatch(0, 2),
            tasks: job.pending.clone(),
            data_provider: job.data_provider.clone(),
            client_uuid: job.client_uuid.clone(),
            client_job_uuid: job.client_job_uuid.clone(),
        };
        bundle.mark_for_requeue();
        assert!(bundle.header.is_requeue());
        assert!(!bundle.header.sla.suspended);
        assert!(job.header.sla.suspended);
        assert_eq!(bundle.positions(), vec![0, 1]);
    }
}
