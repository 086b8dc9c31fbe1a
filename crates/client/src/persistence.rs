//! 作业持久化
//!
//! 客户端可以把作业和已收到的结果保存下来，进程重启后据此恢复，
//! 已完成的作业不必重新提交。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use taskgrid_core::{models::TaskResult, GridError, GridResult};

use crate::job::Job;

/// 保存的作业及其已有结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub job: Job,
    /// 按 position 排序
    pub results: Vec<TaskResult>,
}

impl PersistedJob {
    /// 所有任务都已有结果
    pub fn is_complete(&self) -> bool {
        self.results.len() == self.job.task_count()
    }
}

/// 作业持久化接口，`K` 为存储键
#[async_trait]
pub trait JobPersistence<K>: Send + Sync
where
    K: Send + Sync,
{
    /// 由作业计算出确定的键
    fn compute_key(&self, job: &Job) -> K;

    /// 保存作业，`results` 与已保存的结果按 position 合并
    async fn store(&self, key: &K, job: &Job, results: &[TaskResult]) -> GridResult<()>;

    async fn load(&self, key: &K) -> GridResult<Option<PersistedJob>>;

    /// 返回是否确实删除了作业
    async fn delete(&self, key: &K) -> GridResult<bool>;

    async fn all_keys(&self) -> GridResult<Vec<K>>;
}

/// 内存中的作业持久化，以作业 UUID 为键，内容以 JSON 保存
#[derive(Default)]
pub struct MemoryJobPersistence {
    jobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryJobPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(bytes: &[u8]) -> GridResult<PersistedJob> {
        serde_json::from_slice(bytes)
            .map_err(|e| GridError::Persistence(format!("无法解析保存的作业: {e}")))
    }
}

#[async_trait]
impl JobPersistence<String> for MemoryJobPersistence {
    fn compute_key(&self, job: &Job) -> String {
        job.uuid.clone()
    }

    async fn store(&self, key: &String, job: &Job, results: &[TaskResult]) -> GridResult<()> {
        let mut jobs = self.jobs.write().await;
        let mut merged: BTreeMap<usize, TaskResult> = match jobs.get(key) {
            Some(bytes) => Self::decode(bytes)?
                .results
                .into_iter()
                .map(|r| (r.position, r))
                .collect(),
            None => BTreeMap::new(),
        };
        for result in results {
            merged.insert(result.position, result.clone());
        }

        let persisted = PersistedJob {
            job: job.clone(),
            results: merged.into_values().collect(),
        };
        let bytes = serde_json::to_vec(&persisted)
            .map_err(|e| GridError::Persistence(format!("无法序列化作业: {e}")))?;
        debug!("保存作业 {}，已有结果: {}", key, persisted.results.len());
        jobs.insert(key.clone(), bytes);
        Ok(())
    }

    async fn load(&self, key: &String) -> GridResult<Option<PersistedJob>> {
        let jobs = self.jobs.read().await;
        jobs.get(key).map(|bytes| Self::decode(bytes)).transpose()
    }

    async fn delete(&self, key: &String) -> GridResult<bool> {
        Ok(self.jobs.write().await.remove(key).is_some())
    }

    async fn all_keys(&self) -> GridResult<Vec<String>> {
        let mut keys: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_core::models::TaskEnvelope;

    fn job() -> Job {
        Job::new("persisted")
            .with_uuid("job-p")
            .with_task(TaskEnvelope::new("echo", b"0".to_vec()))
            .with_task(TaskEnvelope::new("echo", b"1".to_vec()))
            .with_task(TaskEnvelope::new("echo", b"2".to_vec()))
    }

    #[tokio::test]
    async fn test_store_merges_results() {
        let persistence = MemoryJobPersistence::new();
        let job = job();
        let key = persistence.compute_key(&job);
        assert_eq!(key, "job-p");

        persistence.store(&key, &job, &[]).await.unwrap();
        let loaded = persistence.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.job, job);
        assert!(loaded.results.is_empty());

        persistence
            .store(&key, &job, &[TaskResult::success(2, b"2".to_vec(), 1)])
            .await
            .unwrap();
        persistence
            .store(
                &key,
                &job,
                &[
                    TaskResult::success(0, b"0".to_vec(), 1),
                    TaskResult::failure(2, "retry", 1),
                ],
            )
            .await
            .unwrap();

        let loaded = persistence.load(&key).await.unwrap().unwrap();
        let positions: Vec<usize> = loaded.results.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 2]);
        assert!(!loaded.results[1].is_success());
        assert!(!loaded.is_complete());
    }

    #[tokio::test]
    async fn test_keys_and_delete() {
        let persistence = MemoryJobPersistence::new();
        let first = job();
        let second = job().with_uuid("job-a");
        persistence.store(&first.uuid, &first, &[]).await.unwrap();
        persistence.store(&second.uuid, &second, &[]).await.unwrap();

        assert_eq!(persistence.all_keys().await.unwrap(), vec!["job-a", "job-p"]);
        assert!(persistence.delete(&"job-a".to_string()).await.unwrap());
        assert!(!persistence.delete(&"job-a".to_string()).await.unwrap());
        assert!(persistence.load(&"job-a".to_string()).await.unwrap().is_none());
    }
}
