use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{JobSla, TaskBundle};

/// 连接用途标识，连接建立后首先发送
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelId {
    /// 节点作业数据通道
    NodeJobData = 0x0101,
    /// 节点类加载通道（不支持，Driver 直接关闭连接）
    NodeClassloader = 0x0102,
    /// 客户端作业数据通道
    ClientJobData = 0x0201,
}

impl ChannelId {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for ChannelId {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x0101 => Ok(ChannelId::NodeJobData),
            0x0102 => Ok(ChannelId::NodeClassloader),
            0x0201 => Ok(ChannelId::ClientJobData),
            other => Err(other),
        }
    }
}

/// 客户端请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Execution,
    Statistics,
    Admin,
    Cancel,
}

/// 客户端请求头
///
/// - `EXECUTION` 后跟一帧数据提供者和 `task_count` 帧任务
/// - `ADMIN` 后跟一帧 [`AdminRequest`]
/// - `STATISTICS` 与 `CANCEL` 没有后续帧，`CANCEL` 的目标作业由 `uuid` 指定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHeader {
    pub request_type: RequestType,
    pub uuid: String,
    pub app_uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub task_count: usize,
    #[serde(default)]
    pub sla: JobSla,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl JobHeader {
    pub fn execution(
        uuid: impl Into<String>,
        app_uuid: impl Into<String>,
        name: impl Into<String>,
        task_count: usize,
        sla: JobSla,
    ) -> Self {
        Self {
            request_type: RequestType::Execution,
            uuid: uuid.into(),
            app_uuid: app_uuid.into(),
            name: name.into(),
            task_count,
            sla,
            parameters: HashMap::new(),
        }
    }

    /// 非执行类请求，`uuid` 为请求（或待取消作业）的标识
    pub fn request(request_type: RequestType, uuid: impl Into<String>, app_uuid: impl Into<String>) -> Self {
        Self {
            request_type,
            uuid: uuid.into(),
            app_uuid: app_uuid.into(),
            name: String::new(),
            task_count: 0,
            sla: JobSla::default(),
            parameters: HashMap::new(),
        }
    }
}

/// Driver 对客户端的响应头
///
/// `EXECUTION` 后跟 `task_count` 帧 [`crate::models::TaskResult`]；
/// `STATISTICS` 后跟一帧统计快照；`ADMIN` 后跟一帧 [`AdminResponse`]；
/// `CANCEL` 没有后续帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultHeader {
    pub request_type: RequestType,
    pub uuid: String,
    pub task_count: usize,
    /// 作业级错误
    #[serde(default)]
    pub error: Option<String>,
}

/// 管理命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminCommand {
    Shutdown,
    ShutdownRestart,
    /// 修改负载均衡参数，参数放在 `parameters` 中
    ChangeSettings,
    ResetStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub password: String,
    pub command: AdminCommand,
    #[serde(default)]
    pub shutdown_delay_ms: u64,
    #[serde(default)]
    pub restart_delay_ms: u64,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub success: bool,
    pub message: String,
}

/// Driver 发给节点的命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCommand {
    /// 后跟一帧数据提供者和 `positions.len()` 帧任务，任务顺序与 `positions` 一致
    Bundle {
        bundle: TaskBundle,
        positions: Vec<usize>,
    },
    CancelJob {
        job_uuid: String,
        requeue: bool,
    },
    Shutdown,
}

/// 节点返回的结果头，后跟 `result_count` 帧结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResultHeader {
    pub bundle: TaskBundle,
    pub result_count: usize,
}
