use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{GridError, GridResult};

/// 单个任务的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Executing,
    Result,
    Exception,
    Cancelled,
}

impl TaskState {
    /// 任务已有最终结果
    pub fn is_final(&self) -> bool {
        matches!(self, TaskState::Result | TaskState::Exception | TaskState::Cancelled)
    }
}

/// Driver 端的单个任务
///
/// `position` 是任务在原作业中的下标，在切片、重排队和序列化过程中保持不变，
/// 结果按它重新排序。
#[derive(Debug, Clone)]
pub struct ServerTask {
    pub position: usize,
    pub state: TaskState,
    /// 序列化后的任务内容（[`TaskEnvelope`]），切片之间共享
    pub data: Arc<Vec<u8>>,
    pub result: Option<TaskResult>,
    /// 已重新提交的次数
    pub resubmit_count: u32,
}

impl ServerTask {
    pub fn new(position: usize, data: Vec<u8>) -> Self {
        Self {
            position,
            state: TaskState::Pending,
            data: Arc::new(data),
            result: None,
            resubmit_count: 0,
        }
    }

    /// 记录一次重新提交，任务回到待分发状态
    pub fn resubmit(&mut self) {
        self.resubmit_count += 1;
        self.state = TaskState::Pending;
        self.result = None;
    }

    pub fn complete(&mut self, result: TaskResult) {
        self.state = result.state;
        self.result = Some(result);
    }
}

/// 单个任务的执行结果（线上格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub position: usize,
    pub state: TaskState,
    pub output: Option<Vec<u8>>,
    pub error: Option<String>,
    /// 节点上的执行耗时（纳秒）
    pub elapsed_nanos: u64,
}

impl TaskResult {
    pub fn success(position: usize, output: Vec<u8>, elapsed_nanos: u64) -> Self {
        Self {
            position,
            state: TaskState::Result,
            output: Some(output),
            error: None,
            elapsed_nanos,
        }
    }

    pub fn failure(position: usize, error: impl Into<String>, elapsed_nanos: u64) -> Self {
        Self {
            position,
            state: TaskState::Exception,
            output: None,
            error: Some(error.into()),
            elapsed_nanos,
        }
    }

    pub fn cancelled(position: usize) -> Self {
        Self {
            position,
            state: TaskState::Cancelled,
            output: None,
            error: None,
            elapsed_nanos: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Result
    }
}

/// 任务内容
///
/// `kind` 决定节点上由哪个执行器运行该任务，节点之间不传输代码。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub kind: String,
    pub body: Vec<u8>,
    /// 单个任务的超时时间（毫秒）
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 取消时是否中断正在运行的任务
    #[serde(default = "default_interruptible")]
    pub interruptible: bool,
}

fn default_interruptible() -> bool {
    true
}

impl TaskEnvelope {
    pub fn new(kind: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            body: body.into(),
            timeout_ms: None,
            interruptible: true,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn non_interruptible(mut self) -> Self {
        self.interruptible = false;
        self
    }

    pub fn to_bytes(&self) -> GridResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> GridResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| GridError::Serialization(format!("无效的任务内容: {e}")))
    }
}
