//! Driver 服务
//!
//! 一个监听端口同时服务节点与客户端连接，连接用途由对端发送的第一个通道标识决定。
//! 每个连接由独立的 tokio 任务驱动，共享状态集中在 [`DriverContext`] 中。

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use taskgrid_core::{
    labels,
    models::TaskResult,
    protocol::{read_channel_id, ChannelId, DataTransform, IdentityTransform},
    AppConfig, DriverConfig, GridError, GridResult, GridStatistics, LoadBalancingConfig,
    StatisticsSnapshot,
};

use crate::bundler::{BundlerFactory, BundlerProvider};
use crate::client_server::serve_client;
use crate::job::{CancelledJob, NodeBundle, RequeueReason};
use crate::node_server::serve_node;
use crate::queue::JobQueue;
use crate::registry::{ClientRegistry, NodeControl, NodeRegistry};

/// 停止时等待连接任务退出的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Driver 退出方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverExit {
    Shutdown,
    /// 等待 `delay` 后以相同配置重新启动
    Restart { delay: Duration },
}

/// Driver 的共享状态
pub struct DriverContext {
    pub uuid: String,
    pub config: DriverConfig,
    pub queue: JobQueue,
    pub statistics: Arc<GridStatistics>,
    pub bundlers: BundlerFactory,
    pub nodes: NodeRegistry,
    pub clients: ClientRegistry,
    pub transform: Arc<dyn DataTransform>,
    exit_tx: Arc<watch::Sender<Option<DriverExit>>>,
}

impl DriverContext {
    pub fn new(
        config: DriverConfig,
        load_balancing: LoadBalancingConfig,
        transform: Arc<dyn DataTransform>,
        providers: HashMap<String, BundlerProvider>,
    ) -> GridResult<Self> {
        let statistics = Arc::new(GridStatistics::new());
        let bundlers = BundlerFactory::with_providers(load_balancing, providers)?;
        statistics.add_value(labels::BUNDLE_SIZE, bundlers.bundle_size() as f64);
        let (exit_tx, _) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        Ok(Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            config,
            queue: JobQueue::new(statistics.clone()),
            statistics,
            bundlers,
            nodes: NodeRegistry::new(),
            clients: ClientRegistry::new(),
            transform,
            exit_tx,
        })
    }

    /// 把结果投递给提交作业的客户端
    pub fn deliver_results(
        &self,
        client_uuid: Option<&str>,
        job_uuid: &str,
        client_job_uuid: &str,
        results: Vec<TaskResult>,
    ) {
        if results.is_empty() {
            return;
        }
        let Some(client_uuid) = client_uuid else {
            debug!("作业 {} 没有关联的客户端，丢弃 {} 个结果", job_uuid, results.len());
            return;
        };
        if !self
            .clients
            .deliver(client_uuid, job_uuid, client_job_uuid, results)
        {
            debug!("客户端 {} 已断开，丢弃作业 {} 的结果", client_uuid, job_uuid);
        }
    }

    /// 将节点退回的包重新排队，被丢弃或超过重提交上限的任务直接返回客户端
    pub fn requeue_bundle(&self, bundle: NodeBundle, reason: RequeueReason) -> usize {
        let job_uuid = bundle.job_uuid().to_string();
        let outcome = self.queue.requeue(bundle, reason);
        if !outcome.exhausted.is_empty() {
            warn!(
                "作业 {} 有 {} 个任务超过最大重提交次数",
                job_uuid,
                outcome.exhausted.len()
            );
        }
        let mut results = outcome.discarded;
        results.extend(outcome.exhausted);
        self.deliver_results(
            outcome.client_uuid.as_deref(),
            &job_uuid,
            &outcome.client_job_uuid,
            results,
        );
        outcome.requeued
    }

    /// 取消作业（客户端视角的 UUID 或队列中的 UUID 均可）
    ///
    /// 未分发的任务以取消状态返回客户端，持有在途包的节点收到不重排队的取消命令。
    /// 作业不存在或已取消时返回 `false`。
    pub fn cancel_job(&self, job_uuid: &str) -> bool {
        let mut targets = self.queue.jobs_for_client_job(job_uuid);
        if targets.is_empty() {
            targets.push(job_uuid.to_string());
        }

        let mut cancelled_any = false;
        for uuid in targets {
            if let Some(cancelled) = self.queue.cancel_job(&uuid) {
                self.finish_cancelled(cancelled);
                cancelled_any = true;
            }
        }
        cancelled_any
    }

    /// 只取消队列中 UUID 完全匹配的那一个作业（或广播副本）
    pub(crate) fn cancel_queued_job(&self, queue_job_uuid: &str) -> bool {
        match self.queue.cancel_job(queue_job_uuid) {
            Some(cancelled) => {
                self.finish_cancelled(cancelled);
                true
            }
            None => false,
        }
    }

    fn finish_cancelled(&self, cancelled: CancelledJob) {
        let CancelledJob {
            job_uuid,
            client_uuid,
            client_job_uuid,
            removed,
            in_flight,
        } = cancelled;
        self.deliver_results(client_uuid.as_deref(), &job_uuid, &client_job_uuid, removed);
        if in_flight {
            for node in self.nodes.holding_job(&job_uuid) {
                debug!("通知节点 {} 取消作业 {}", node.uuid(), job_uuid);
                node.send(NodeControl::CancelJob {
                    job_uuid: job_uuid.clone(),
                    requeue: false,
                });
            }
        }
    }

    /// 挂起或恢复作业
    ///
    /// `requeue` 为真时，挂起还会让持有在途包的节点中断执行并退回任务。
    pub fn suspend_job(&self, job_uuid: &str, suspended: bool, requeue: bool) -> GridResult<()> {
        self.queue.set_suspended(job_uuid, suspended)?;
        if suspended && requeue {
            for node in self.nodes.holding_job(job_uuid) {
                node.send(NodeControl::CancelJob {
                    job_uuid: job_uuid.to_string(),
                    requeue: true,
                });
            }
        }
        Ok(())
    }

    pub fn update_priority(&self, job_uuid: &str, priority: i32) -> GridResult<()> {
        self.queue.update_priority(job_uuid, priority)
    }

    /// 取消所有已过期的作业，返回数量
    pub fn expire_jobs(&self, now: DateTime<Utc>) -> usize {
        let expired = self.queue.remove_expired(now);
        let count = expired.len();
        for cancelled in expired {
            self.finish_cancelled(cancelled);
        }
        count
    }

    /// 节点断开后，固定在该节点上的广播副本无法再执行
    pub fn release_pinned_jobs(&self, node_uuid: &str) {
        for cancelled in self.queue.remove_pinned(node_uuid) {
            self.finish_cancelled(cancelled);
        }
    }

    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        self.statistics.to_response(self.bundlers.bundle_size())
    }

    /// 请求 Driver 停止或重启
    pub fn request_exit(&self, exit: DriverExit) {
        info!("收到 Driver 退出请求: {:?}", exit);
        self.exit_tx.send_replace(Some(exit));
    }

    pub(crate) fn exit_sender(&self) -> Arc<watch::Sender<Option<DriverExit>>> {
        self.exit_tx.clone()
    }

    fn exit_receiver(&self) -> watch::Receiver<Option<DriverExit>> {
        self.exit_tx.subscribe()
    }
}

/// Driver 服务
pub struct Driver {
    context: Arc<DriverContext>,
    shutdown_tx: broadcast::Sender<()>,
    exit_rx: watch::Receiver<Option<DriverExit>>,
}

impl Driver {
    pub fn new(config: &AppConfig) -> GridResult<Self> {
        Self::with_transform(config, Arc::new(IdentityTransform), HashMap::new())
    }

    pub fn with_transform(
        config: &AppConfig,
        transform: Arc<dyn DataTransform>,
        providers: HashMap<String, BundlerProvider>,
    ) -> GridResult<Self> {
        let context = DriverContext::new(
            config.driver.clone(),
            config.load_balancing.clone(),
            transform,
            providers,
        )?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let exit_rx = context.exit_receiver();
        Ok(Self {
            context: Arc::new(context),
            shutdown_tx,
            exit_rx,
        })
    }

    pub fn context(&self) -> Arc<DriverContext> {
        self.context.clone()
    }

    pub async fn bind(&self) -> GridResult<TcpListener> {
        let listener = TcpListener::bind(&self.context.config.bind_address)
            .await
            .map_err(|e| {
                GridError::Network(format!(
                    "无法监听 {}: {}",
                    self.context.config.bind_address, e
                ))
            })?;
        Ok(listener)
    }

    /// 运行直到 `shutdown` 完成或收到管理命令
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> GridResult<DriverExit>
    where
        F: Future<Output = ()>,
    {
        let Driver {
            context,
            shutdown_tx,
            mut exit_rx,
        } = self;
        let mut connections = JoinSet::new();
        let mut sweep = tokio::time::interval(Duration::from_millis(
            context.config.expiration_check_interval_ms,
        ));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Driver {} 开始监听 {}", context.uuid, listener.local_addr()?);

        let exit = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("设置 TCP_NODELAY 失败: {}", e);
                        }
                        let ctx = context.clone();
                        let rx = shutdown_tx.subscribe();
                        connections.spawn(handle_connection(ctx, stream, peer, rx));
                    }
                    Err(e) => warn!("接受连接失败: {}", e),
                },
                _ = sweep.tick() => {
                    let expired = context.expire_jobs(Utc::now());
                    if expired > 0 {
                        info!("已取消 {} 个过期作业", expired);
                    }
                }
                changed = exit_rx.changed() => {
                    if changed.is_err() {
                        break DriverExit::Shutdown;
                    }
                    if let Some(exit) = exit_rx.borrow_and_update().clone() {
                        break exit;
                    }
                }
                _ = &mut shutdown => break DriverExit::Shutdown,
                Some(joined) = connections.join_next() => {
                    if let Err(e) = joined {
                        error!("连接任务异常退出: {}", e);
                    }
                }
            }
        };

        info!("Driver 正在停止: {:?}", exit);
        drop(listener);
        context.queue.close();
        // 没有订阅者时发送失败，可以忽略
        let _ = shutdown_tx.send(());

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("部分连接未在 {:?} 内关闭，强制终止", SHUTDOWN_GRACE);
            connections.abort_all();
        }
        info!("Driver 已停止");
        Ok(exit)
    }
}

async fn handle_connection(
    context: Arc<DriverContext>,
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) {
    let handshake = Duration::from_millis(context.config.handshake_timeout_ms);
    let channel = match tokio::time::timeout(handshake, read_channel_id(&mut stream)).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            debug!("读取 {} 的通道标识失败: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("{} 未在 {:?} 内发送通道标识，关闭连接", peer, handshake);
            return;
        }
    };

    let result = match channel {
        ChannelId::NodeJobData => {
            debug!("节点连接: {}", peer);
            serve_node(context, stream, shutdown).await
        }
        ChannelId::ClientJobData => {
            debug!("客户端连接: {}", peer);
            serve_client(context, stream, shutdown).await
        }
        ChannelId::NodeClassloader => {
            info!("不支持类加载通道，关闭来自 {} 的连接", peer);
            Ok(())
        }
    };

    match result {
        Ok(()) => debug!("连接 {} 已关闭", peer),
        Err(e) if e.is_connection_error() => info!("连接 {} 已断开: {}", peer, e),
        Err(e) => warn!("连接 {} 异常关闭: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ServerJob;
    use crate::registry::{ClientEvent, NodeHandle};
    use taskgrid_core::models::{NodeInfo, ServerTask, TaskBundle, TaskState};
    use tokio::sync::mpsc;

    fn context() -> DriverContext {
        DriverContext::new(
            DriverConfig::default(),
            LoadBalancingConfig::default(),
            Arc::new(IdentityTransform),
            HashMap::new(),
        )
        .unwrap()
    }

    fn job(uuid: &str, client: &str, tasks: usize) -> ServerJob {
        let header = TaskBundle::new(uuid, "test", tasks, Default::default());
        let tasks = (0..tasks).map(|i| ServerTask::new(i, vec![i as u8])).collect();
        ServerJob::new(header, Some(client.to_string()), vec![], tasks)
    }

    fn node(ctx: &DriverContext, uuid: &str) -> (Arc<NodeHandle>, mpsc::UnboundedReceiver<NodeControl>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = NodeInfo {
            uuid: uuid.to_string(),
            host: "localhost".to_string(),
            management_port: 1,
            threads: 1,
            properties: HashMap::new(),
        };
        let handle = Arc::new(NodeHandle::new(info, tx));
        ctx.nodes.register(handle.clone());
        (handle, rx)
    }

    #[test]
    fn test_cancel_job_notifies_holding_nodes() {
        let ctx = context();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        ctx.clients.register("c1", events_tx);
        ctx.queue.add_bundle(job("j1", "c1", 6)).unwrap();

        let (handle, mut control) = node(&ctx, "n1");
        let bundle = ctx.queue.next_bundle("n1", &HashMap::new(), 4).unwrap();
        handle.set_in_flight(Some(bundle.job_uuid().to_string()));

        assert!(ctx.cancel_job("j1"));
        assert!(!ctx.cancel_job("j1"));

        match events.try_recv().unwrap() {
            ClientEvent::Results { results, .. } => {
                assert_eq!(results.len(), 2);
                assert!(results.iter().all(|r| r.state == TaskState::Cancelled));
            }
        }
        assert_eq!(
            control.try_recv().unwrap(),
            NodeControl::CancelJob {
                job_uuid: "j1".to_string(),
                requeue: false
            }
        );

        // 在途包回来时作业已取消，任务以取消状态返回
        assert_eq!(ctx.requeue_bundle(bundle, RequeueReason::NodeError), 0);
        match events.try_recv().unwrap() {
            ClientEvent::Results { results, .. } => assert_eq!(results.len(), 4),
        }
        assert_eq!(ctx.queue.job_count(), 0);
    }

    #[test]
    fn test_suspend_with_requeue() {
        let ctx = context();
        ctx.queue.add_bundle(job("j1", "c1", 2)).unwrap();
        let (handle, mut control) = node(&ctx, "n1");
        let bundle = ctx.queue.next_bundle("n1", &HashMap::new(), 1).unwrap();
        handle.set_in_flight(Some(bundle.job_uuid().to_string()));

        ctx.suspend_job("j1", true, true).unwrap();
        assert!(matches!(
            control.try_recv(),
            Ok(NodeControl::CancelJob { requeue: true, .. })
        ));
        assert!(ctx.queue.next_bundle("n1", &HashMap::new(), 1).is_none());
        assert!(ctx.suspend_job("missing", true, false).is_err());
    }

    #[test]
    fn test_exhausted_tasks_reported_to_client() {
        let ctx = context();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        ctx.clients.register("c1", events_tx);

        let mut job = job("j1", "c1", 1);
        job.header.sla.max_task_resubmits = 0;
        ctx.queue.add_bundle(job).unwrap();
        let bundle = ctx.queue.next_bundle("n1", &HashMap::new(), 1).unwrap();

        assert_eq!(ctx.requeue_bundle(bundle, RequeueReason::BundleFailure), 0);
        match events.try_recv().unwrap() {
            ClientEvent::Results { results, .. } => {
                assert_eq!(results[0].state, TaskState::Exception);
            }
        }
    }

    #[tokio::test]
    async fn test_exit_request_stops_run() {
        let mut config = AppConfig::default();
        config.driver.bind_address = "127.0.0.1:0".to_string();
        let driver = Driver::new(&config).unwrap();
        let listener = driver.bind().await.unwrap();
        let ctx = driver.context();

        let handle = tokio::spawn(driver.run(listener, std::future::pending()));
        ctx.request_exit(DriverExit::Restart {
            delay: Duration::from_millis(10),
        });
        let exit = handle.await.unwrap().unwrap();
        assert_eq!(
            exit,
            DriverExit::Restart {
                delay: Duration::from_millis(10)
            }
        );
        assert!(ctx.queue.is_closed());
    }
}
