use thiserror::Error;

/// 任务网格错误类型定义
#[derive(Debug, Error)]
pub enum GridError {
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("无效的状态转换: {from} -> {event}")]
    InvalidTransition { from: String, event: String },

    #[error("作业未找到: {uuid}")]
    JobNotFound { uuid: String },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务执行超时")]
    ExecutionTimeout,

    #[error("未注册的任务类型: {0}")]
    UnknownTaskKind(String),

    #[error("负载均衡错误: {0}")]
    LoadBalancing(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("权限不足: {0}")]
    Permission(String),

    #[error("连接已关闭")]
    ConnectionClosed,

    #[error("网络错误: {0}")]
    Network(String),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type GridResult<T> = std::result::Result<T, GridError>;

impl GridError {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn job_not_found<S: Into<String>>(uuid: S) -> Self {
        Self::JobNotFound { uuid: uuid.into() }
    }

    /// 连接级别的错误：只需关闭对应连接并重新排队其在途工作
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            GridError::Io(_)
                | GridError::ConnectionClosed
                | GridError::Network(_)
                | GridError::Protocol(_)
                | GridError::InvalidTransition { .. }
        )
    }
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        GridError::Serialization(e.to_string())
    }
}
