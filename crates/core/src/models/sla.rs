use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::policy::ExecutionPolicy;

/// 作业的服务级别属性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSla {
    /// 优先级，数值越大越先分发
    pub priority: i32,
    /// 同时处理该作业的最大节点数
    pub max_channels: usize,
    /// 挂起的作业不会被分发
    pub suspended: bool,
    /// 广播作业：每个节点执行一份完整副本
    pub broadcast: bool,
    pub expiration: Option<JobExpiration>,
    /// 客户端断开时取消作业
    pub cancel_upon_client_disconnect: bool,
    /// 单个任务最多重新提交次数
    pub max_task_resubmits: u32,
    /// 节点故障导致的重新提交是否也计入上限
    pub apply_max_resubmits_upon_node_error: bool,
    pub execution_policy: Option<ExecutionPolicy>,
}

impl Default for JobSla {
    fn default() -> Self {
        Self {
            priority: 0,
            max_channels: usize::MAX,
            suspended: false,
            broadcast: false,
            expiration: None,
            cancel_upon_client_disconnect: true,
            max_task_resubmits: 1,
            apply_max_resubmits_upon_node_error: false,
            execution_policy: None,
        }
    }
}

/// 作业过期时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExpiration {
    /// 绝对时间
    At(DateTime<Utc>),
    /// 进入队列后经过的毫秒数
    AfterMillis(u64),
}

impl JobExpiration {
    /// 以入队时间为基准计算实际过期时刻
    pub fn resolve(&self, queued_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            JobExpiration::At(at) => *at,
            JobExpiration::AfterMillis(ms) => {
                let ms = i64::try_from(*ms).unwrap_or(i64::MAX);
                Duration::try_milliseconds(ms)
                    .and_then(|d| queued_at.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sla() {
        let sla = JobSla::default();
        assert_eq!(sla.max_channels, usize::MAX);
        assert!(sla.cancel_upon_client_disconnect);
        assert!(!sla.suspended);
    }

    #[test]
    fn test_expiration_resolve() {
        let now = Utc::now();
        assert_eq!(
            JobExpiration::AfterMillis(1500).resolve(now),
            now + Duration::milliseconds(1500)
        );
        assert_eq!(JobExpiration::At(now).resolve(now - Duration::hours(1)), now);
    }

    #[test]
    fn test_partial_sla_deserialize() {
        let sla: JobSla = serde_json::from_str(r#"{"priority": 3, "broadcast": true}"#).unwrap();
        assert_eq!(sla.priority, 3);
        assert!(sla.broadcast);
        assert_eq!(sla.max_task_resubmits, 1);
    }
}
