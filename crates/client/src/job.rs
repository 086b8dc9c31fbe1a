use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use taskgrid_core::{
    models::{JobSla, TaskEnvelope},
    protocol::JobHeader,
    GridResult,
};

/// 客户端提交的作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: String,
    pub name: String,
    pub sla: JobSla,
    /// 所有任务共享的数据
    pub data_provider: Vec<u8>,
    pub tasks: Vec<TaskEnvelope>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            sla: JobSla::default(),
            data_provider: Vec::new(),
            tasks: Vec::new(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_sla(mut self, sla: JobSla) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_data_provider(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data_provider = data.into();
        self
    }

    /// 添加任务，任务的 position 即添加顺序
    pub fn add_task(&mut self, task: TaskEnvelope) -> usize {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn with_task(mut self, task: TaskEnvelope) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn header(&self, app_uuid: &str) -> JobHeader {
        let mut header = JobHeader::execution(
            self.uuid.clone(),
            app_uuid,
            self.name.clone(),
            self.tasks.len(),
            self.sla.clone(),
        );
        header.parameters = self.parameters.clone();
        header
    }

    pub(crate) fn task_frames(&self) -> GridResult<Vec<Vec<u8>>> {
        self.tasks.iter().map(TaskEnvelope::to_bytes).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_core::protocol::RequestType;

    #[test]
    fn test_job_header() {
        let mut job = Job::new("render").with_uuid("job-1");
        assert_eq!(job.add_task(TaskEnvelope::new("echo", b"a".to_vec())), 0);
        assert_eq!(job.add_task(TaskEnvelope::new("echo", b"b".to_vec())), 1);
        job.sla.priority = 3;

        let header = job.header("app");
        assert_eq!(header.request_type, RequestType::Execution);
        assert_eq!(header.uuid, "job-1");
        assert_eq!(header.task_count, 2);
        assert_eq!(header.sla.priority, 3);
        assert_eq!(job.task_frames().unwrap().len(), 2);
    }
}
