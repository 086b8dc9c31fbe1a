use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use taskgrid_core::AppConfig;
use taskgrid_dispatcher::{Driver, DriverExit};
use taskgrid_worker::{ExecutorRegistry, Node};

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行 Driver
    Driver,
    /// 仅运行计算节点
    Node,
    /// 同一进程内运行 Driver 和一个计算节点
    All,
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "driver" => Ok(AppMode::Driver),
            "node" => Ok(AppMode::Node),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    registry: Arc<ExecutorRegistry>,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Self {
        Self::with_registry(config, mode, Arc::new(ExecutorRegistry::with_builtin()))
    }

    /// 使用自定义执行器注册表，节点按注册表中的任务类型执行任务
    pub fn with_registry(config: AppConfig, mode: AppMode, registry: Arc<ExecutorRegistry>) -> Self {
        info!("初始化应用程序，模式: {:?}", mode);
        Self {
            config,
            mode,
            registry,
        }
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行直到收到关闭信号；Driver 收到停止命令时也会触发整体关闭
    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        match self.mode {
            AppMode::Driver => self.run_driver(&shutdown).await,
            AppMode::Node => self.run_node(&shutdown).await,
            AppMode::All => {
                let (driver, node) = tokio::join!(self.run_driver(&shutdown), self.run_node(&shutdown));
                driver.and(node)
            }
        }
    }

    async fn run_driver(&self, shutdown: &ShutdownManager) -> Result<()> {
        let result = self.driver_loop(shutdown).await;
        shutdown.shutdown().await;
        result
    }

    async fn driver_loop(&self, shutdown: &ShutdownManager) -> Result<()> {
        loop {
            let driver = Driver::new(&self.config).context("创建Driver失败")?;
            let listener = driver.bind().await.context("绑定Driver监听地址失败")?;
            let exit = driver
                .run(listener, shutdown.wait())
                .await
                .context("Driver运行失败")?;

            match exit {
                DriverExit::Shutdown => {
                    info!("Driver 已停止");
                    return Ok(());
                }
                DriverExit::Restart { delay } => {
                    info!("Driver 将在 {:?} 后重启", delay);
                    tokio::select! {
                        _ = shutdown.wait() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_node(&self, shutdown: &ShutdownManager) -> Result<()> {
        let node = Node::new(self.config.node.clone(), self.registry.clone());
        let result = node.run(shutdown.wait()).await;
        if let Err(e) = &result {
            warn!("计算节点 {} 异常退出: {}", node.info().uuid, e);
        }
        result.context("计算节点运行失败")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!("driver".parse::<AppMode>().unwrap(), AppMode::Driver);
        assert_eq!("NODE".parse::<AppMode>().unwrap(), AppMode::Node);
        assert_eq!("all".parse::<AppMode>().unwrap(), AppMode::All);
        assert!("api".parse::<AppMode>().is_err());
    }
}
