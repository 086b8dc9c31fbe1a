use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::sla::JobSla;

/// 作业内唯一的包键：`{job_uuid}#{bundle_id}`
///
/// Driver 与 Node 两端所有以 (作业, 包) 为单位的表都使用该键。
pub fn bundle_key(job_uuid: &str, bundle_id: u64) -> String {
    format!("{job_uuid}#{bundle_id}")
}

/// 任务包头
///
/// 描述一次分发给节点的任务集合。任务内容本身不在包头中，而是紧随其后逐帧传输。
///
/// # 不变量
///
/// - `task_count` 创建后不再改变（只提供读取方法）
/// - `requeue` 只能从 `false` 变为 `true`（只提供 [`TaskBundle::mark_requeue`]）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBundle {
    /// 本包的唯一标识
    pub uuid: String,
    /// 所属作业
    pub job_uuid: String,
    /// 作业名称
    pub name: String,
    /// 作业内单调递增的包序号
    pub bundle_id: u64,
    task_count: usize,
    /// 作业最初提交时的任务数
    pub initial_task_count: usize,
    pub sla: JobSla,
    requeue: bool,
    /// 节点端执行耗时（纳秒），由节点回填
    #[serde(default)]
    pub node_execution_nanos: u64,
    /// 包级别的致命错误
    #[serde(default)]
    pub throwable: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl TaskBundle {
    pub fn new(job_uuid: impl Into<String>, name: impl Into<String>, task_count: usize, sla: JobSla) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            job_uuid: job_uuid.into(),
            name: name.into(),
            bundle_id: 0,
            task_count,
            initial_task_count: task_count,
            sla,
            requeue: false,
            node_execution_nanos: 0,
            throwable: None,
            parameters: HashMap::new(),
        }
    }

    /// 为一次分发派生新的包头：新 UUID、新序号、切片后的任务数
    pub fn for_dispatch(&self, bundle_id: u64, task_count: usize) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            job_uuid: self.job_uuid.clone(),
            name: self.name.clone(),
            bundle_id,
            task_count,
            initial_task_count: self.initial_task_count,
            sla: self.sla.clone(),
            requeue: false,
            node_execution_nanos: 0,
            throwable: None,
            parameters: self.parameters.clone(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn is_requeue(&self) -> bool {
        self.requeue
    }

    /// 标记该包需要重新排队
    pub fn mark_requeue(&mut self) {
        self.requeue = true;
    }

    pub fn key(&self) -> String {
        bundle_key(&self.job_uuid, self.bundle_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_dispatch_keeps_job_identity() {
        let mut sla = JobSla::default();
        sla.priority = 7;
        let job = TaskBundle::new("job-1", "render", 10, sla);
        let slice = job.for_dispatch(3, 4);

        assert_eq!(slice.job_uuid, "job-1");
        assert_eq!(slice.task_count(), 4);
        assert_eq!(slice.initial_task_count, 10);
        assert_eq!(slice.sla.priority, 7);
        assert_ne!(slice.uuid, job.uuid);
        assert_eq!(slice.key(), "job-1#3");
    }

    #[test]
    fn test_requeue_flag_only_moves_forward() {
        let mut bundle = TaskBundle::new("job-1", "render", 1, JobSla::default());
        assert!(!bundle.is_requeue());
        bundle.mark_requeue();
        bundle.mark_requeue();
        assert!(bundle.is_requeue());

        let json = serde_json::to_string(&bundle).unwrap();
        let decoded: TaskBundle = serde_json::from_str(&json).unwrap();
        assert!(decoded.is_requeue());
        assert_eq!(decoded.task_count(), 1);
    }
}
