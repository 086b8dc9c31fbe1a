//! 节点运行时
//!
//! 连接 Driver、发送握手信息，然后循环接收任务包并把结果送回。
//! 连接断开或 Driver 要求停止后按指数退避重连。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use taskgrid_core::{
    models::{NodeInfo, TaskBundle, TaskResult},
    protocol::{
        write_channel_id, ChannelId, DataTransform, FramedReader, FramedWriter, IdentityTransform,
        NodeCommand, NodeResultHeader,
    },
    GridError, GridResult, NodeConfig,
};

use crate::execution::{ExecutionManager, ExecutionManagerListener, NodeTask};
use crate::executor::ExecutorRegistry;

/// 重连等待的随机抖动比例
const RECONNECT_JITTER: f64 = 0.1;

/// 一次连接的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Driver 发来停止命令
    DriverShutdown,
    /// 本地停止
    Stopped,
}

#[derive(Debug)]
enum Inbound {
    Bundle {
        bundle: TaskBundle,
        data_provider: Arc<Vec<u8>>,
        tasks: Vec<NodeTask>,
    },
    Shutdown,
}

struct ExecutedBundle {
    bundle: TaskBundle,
    results: Vec<TaskResult>,
}

/// 把执行完的任务包转交给连接的写端
struct ForwardListener {
    tx: mpsc::UnboundedSender<ExecutedBundle>,
}

impl ExecutionManagerListener for ForwardListener {
    fn bundle_executed(&self, bundle: &TaskBundle, results: &[TaskResult], throwable: Option<&str>) {
        if let Some(throwable) = throwable {
            warn!("任务包 {} 执行失败: {}", bundle.key(), throwable);
        }
        let executed = ExecutedBundle {
            bundle: bundle.clone(),
            results: results.to_vec(),
        };
        if self.tx.send(executed).is_err() {
            debug!("连接已关闭，丢弃任务包 {} 的结果", bundle.key());
        }
    }
}

/// 计算节点
pub struct Node {
    config: NodeConfig,
    info: NodeInfo,
    manager: Arc<ExecutionManager>,
    transform: Arc<dyn DataTransform>,
}

impl Node {
    pub fn new(config: NodeConfig, registry: Arc<ExecutorRegistry>) -> Self {
        Self::with_transform(config, registry, Arc::new(IdentityTransform))
    }

    pub fn with_transform(
        config: NodeConfig,
        registry: Arc<ExecutorRegistry>,
        transform: Arc<dyn DataTransform>,
    ) -> Self {
        let info = node_info(&config);
        let manager = ExecutionManager::new(registry, config.processing_threads);
        Self {
            config,
            info,
            manager,
            transform,
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    /// 运行节点直到 `shutdown` 完成或重连次数用尽
    pub async fn run<F>(&self, shutdown: F) -> GridResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let address = self.config.driver_address.clone();
        info!(
            "节点 {} 启动，Driver: {}，执行线程: {}",
            self.info.uuid, address, self.config.processing_threads
        );

        let mut attempt: u32 = 0;
        loop {
            let connected = tokio::select! {
                _ = &mut shutdown => break,
                stream = TcpStream::connect(&address) => stream,
            };

            match connected {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("设置 TCP_NODELAY 失败: {}", e);
                    }
                    attempt = 0;
                    match self.run_session(stream, &mut shutdown).await {
                        Ok(SessionEnd::Stopped) => break,
                        Ok(SessionEnd::DriverShutdown) => info!("Driver 已停止，等待重连"),
                        Err(e) => warn!("与 Driver 的连接中断: {}", e),
                    }
                }
                Err(e) => warn!("连接 Driver {} 失败: {}", address, e),
            }

            attempt += 1;
            let max_attempts = self.config.max_reconnect_attempts;
            if max_attempts > 0 && attempt > max_attempts {
                self.manager.shutdown();
                return Err(GridError::Network(format!(
                    "重试 {max_attempts} 次后仍无法连接 Driver {address}"
                )));
            }

            let delay = reconnect_delay(&self.config, attempt);
            info!("{}ms 后进行第 {} 次重连", delay.as_millis(), attempt);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.manager.shutdown();
        info!("节点 {} 已停止", self.info.uuid);
        Ok(())
    }

    /// 在一条已建立的连接上工作，直到连接断开、Driver 要求停止或 `shutdown` 完成
    ///
    /// 结束时仍在执行的任务包全部取消，Driver 会把它们重新排队。
    pub async fn run_session<S, X>(&self, mut stream: S, shutdown: &mut X) -> GridResult<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        X: Future<Output = ()> + Unpin,
    {
        write_channel_id(&mut stream, ChannelId::NodeJobData).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedReader::new(read_half, self.transform.clone());
        let mut writer = FramedWriter::new(write_half, self.transform.clone());
        writer.write_message(&self.info).await?;
        writer.flush().await?;
        info!("节点 {} 已连接到 Driver", self.info.uuid);

        let (executed_tx, mut executed_rx) = mpsc::unbounded_channel();
        let listener_id = self
            .manager
            .add_listener(Arc::new(ForwardListener { tx: executed_tx }));
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let reader_task = tokio::spawn(read_commands(reader, self.manager.clone(), inbound_tx));

        let result = loop {
            tokio::select! {
                message = inbound_rx.recv() => match message {
                    Some(Ok(Inbound::Bundle { bundle, data_provider, tasks })) => {
                        debug!("收到任务包 {}，任务数: {}", bundle.key(), tasks.len());
                        if let Err(e) = self.manager.execute(bundle, data_provider, tasks) {
                            break Err(e);
                        }
                    }
                    Some(Ok(Inbound::Shutdown)) => {
                        info!("收到 Driver 的停止命令");
                        break Ok(SessionEnd::DriverShutdown);
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(GridError::ConnectionClosed),
                },
                Some(executed) = executed_rx.recv() => {
                    if let Err(e) = send_results(&mut writer, executed).await {
                        break Err(e);
                    }
                }
                _ = &mut *shutdown => break Ok(SessionEnd::Stopped),
            }
        };

        reader_task.abort();
        self.manager.remove_listener(listener_id);
        self.manager.cancel_all_tasks(true, true);
        if let Err(e) = writer.shutdown().await {
            debug!("关闭连接写端失败: {}", e);
        }
        result
    }
}

async fn read_commands<R>(
    mut reader: FramedReader<R>,
    manager: Arc<ExecutionManager>,
    tx: mpsc::Sender<GridResult<Inbound>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let outcome: GridResult<Option<Inbound>> = async {
            match reader.read_message::<NodeCommand>().await? {
                NodeCommand::Bundle { bundle, positions } => {
                    manager.add_pending_entry(&bundle);
                    let frames: GridResult<_> = async {
                        let data_provider = Arc::new(reader.read_frame().await?);
                        let mut tasks = Vec::with_capacity(positions.len());
                        for position in positions {
                            tasks.push(NodeTask::new(position, reader.read_frame().await?));
                        }
                        Ok((data_provider, tasks))
                    }
                    .await;
                    let (data_provider, tasks) = match frames {
                        Ok(frames) => frames,
                        Err(e) => {
                            manager.remove_pending_entry(&bundle.key());
                            return Err(e);
                        }
                    };
                    Ok(Some(Inbound::Bundle {
                        bundle,
                        data_provider,
                        tasks,
                    }))
                }
                NodeCommand::CancelJob { job_uuid, requeue } => {
                    manager.cancel_job(&job_uuid, true, requeue);
                    Ok(None)
                }
                NodeCommand::Shutdown => Ok(Some(Inbound::Shutdown)),
            }
        }
        .await;

        match outcome {
            Ok(None) => {}
            Ok(Some(inbound)) => {
                let last = matches!(inbound, Inbound::Shutdown);
                if tx.send(Ok(inbound)).await.is_err() || last {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

async fn send_results<W>(writer: &mut FramedWriter<W>, executed: ExecutedBundle) -> GridResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header = NodeResultHeader {
        result_count: executed.results.len(),
        bundle: executed.bundle,
    };
    writer.write_message(&header).await?;
    for result in &executed.results {
        writer.write_message(result).await?;
    }
    writer.flush().await
}

fn node_info(config: &NodeConfig) -> NodeInfo {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    NodeInfo {
        uuid: config
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        host,
        management_port: config.management_port,
        threads: config.processing_threads,
        properties: config.properties.clone(),
    }
}

/// 第 `attempt` 次重连前的等待时间：指数增长，带随机抖动，不超过上限
pub fn reconnect_delay(config: &NodeConfig, attempt: u32) -> Duration {
    let base = config.reconnect_initial_delay_ms as f64;
    let max = config.reconnect_max_delay_ms as f64;
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let capped = (base * 2f64.powi(exponent)).min(max);
    let jitter = capped * RECONNECT_JITTER * (rand::random::<f64>() - 0.5) * 2.0;
    Duration::from_millis((capped + jitter).max(base).min(max) as u64)
}
