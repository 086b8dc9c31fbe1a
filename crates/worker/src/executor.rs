//! 任务执行器接口
//!
//! 节点之间不传输代码：每个任务携带一个 `kind`，节点按它在
//! [`ExecutorRegistry`] 中查找执行器。
//!
//! ## 实现自定义执行器
//!
//! ```rust
//! use async_trait::async_trait;
//! use taskgrid_core::GridResult;
//! use taskgrid_worker::{TaskContext, TaskExecutor};
//!
//! pub struct UpperExecutor;
//!
//! #[async_trait]
//! impl TaskExecutor for UpperExecutor {
//!     fn kind(&self) -> &str {
//!         "upper"
//!     }
//!
//!     async fn execute(&self, context: &TaskContext) -> GridResult<Vec<u8>> {
//!         Ok(context.body.to_ascii_uppercase())
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use taskgrid_core::{GridError, GridResult};

/// 单个任务的执行上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_uuid: String,
    pub bundle_id: u64,
    /// 任务在原作业中的位置
    pub position: usize,
    pub kind: String,
    pub body: Vec<u8>,
    /// 整个作业共享的数据提供者
    pub data_provider: Arc<Vec<u8>>,
}

/// 任务执行器
///
/// `on_cancel` 与 `on_timeout` 是可选的回调，分别在任务被取消、超时时调用，
/// 调用发生在执行任务被中断之后。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 执行器处理的任务类型
    fn kind(&self) -> &str;

    /// 执行任务并返回输出
    async fn execute(&self, context: &TaskContext) -> GridResult<Vec<u8>>;

    /// 任务被取消
    fn on_cancel(&self, _context: &TaskContext) {}

    /// 任务超时
    fn on_timeout(&self, _context: &TaskContext) {}
}

/// 执行器注册表
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带有内置执行器（`echo`、`sleep`）的注册表
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(EchoExecutor));
        registry.register(Arc::new(SleepExecutor));
        registry
    }

    /// 注册执行器，同类型的旧执行器被替换
    pub fn register(&self, executor: Arc<dyn TaskExecutor>) {
        let kind = executor.kind().to_string();
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        if executors.insert(kind.clone(), executor).is_some() {
            warn!("执行器 {} 已存在，将被替换", kind);
        } else {
            debug!("注册执行器: {}", kind);
        }
    }

    pub fn unregister(&self, kind: &str) -> bool {
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        executors.remove(kind).is_some()
    }

    pub fn get(&self, kind: &str) -> GridResult<Arc<dyn TaskExecutor>> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        executors
            .get(kind)
            .cloned()
            .ok_or_else(|| GridError::UnknownTaskKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.get(kind).is_ok()
    }

    /// 已注册的任务类型，按名称排序
    pub fn kinds(&self) -> Vec<String> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        let mut kinds: Vec<String> = executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// 原样返回任务内容
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn execute(&self, context: &TaskContext) -> GridResult<Vec<u8>> {
        Ok(context.body.clone())
    }
}

/// 休眠 `body` 指定的毫秒数后返回任务内容
pub struct SleepExecutor;

#[async_trait]
impl TaskExecutor for SleepExecutor {
    fn kind(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, context: &TaskContext) -> GridResult<Vec<u8>> {
        let millis: u64 = std::str::from_utf8(&context.body)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| GridError::TaskExecution("sleep 任务内容必须是毫秒数".to_string()))?;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(context.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(kind: &str, body: &[u8]) -> TaskContext {
        TaskContext {
            job_uuid: "job".to_string(),
            bundle_id: 0,
            position: 0,
            kind: kind.to_string(),
            body: body.to_vec(),
            data_provider: Arc::new(Vec::new()),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ExecutorRegistry::with_builtin();
        assert_eq!(registry.kinds(), vec!["echo", "sleep"]);
        assert!(registry.contains("echo"));
        assert!(matches!(
            registry.get("python"),
            Err(GridError::UnknownTaskKind(kind)) if kind == "python"
        ));

        assert!(registry.unregister("sleep"));
        assert!(!registry.unregister("sleep"));
        assert_eq!(registry.kinds(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_builtin_executors() {
        let echo = EchoExecutor.execute(&context("echo", b"hello")).await.unwrap();
        assert_eq!(echo, b"hello");

        let slept = SleepExecutor.execute(&context("sleep", b"5")).await.unwrap();
        assert_eq!(slept, b"5");

        assert!(SleepExecutor.execute(&context("sleep", b"soon")).await.is_err());
    }
}
