//! Driver 端的节点连接状态机
//!
//! ```text
//! Idle --BundleAvailable--> SendingBundle --BundleSent--> WaitingResult
//!   ^                                                          |
//!   |                                                   ResultHeaderRead
//!   |                                                          v
//!   +-----------------------ResultsRead------------------ ReceivingResult
//! ```
//!
//! 任意状态收到 `Error` 或 `Close` 进入 `Closing`，`Closing` 不再接受任何事件。
//! [`NodeStateMachine`] 只负责转换表；[`NodeChannelContext`] 持有一个连接的全部
//! 可变状态（分包策略、在途包、计数），I/O 由 [`crate::node_server`] 完成。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use taskgrid_core::{
    labels,
    models::{NodeInfo, TaskResult, TaskState},
    protocol::{NodeCommand, NodeResultHeader},
    GridError, GridResult,
};

use crate::bundler::Bundler;
use crate::driver::DriverContext;
use crate::job::{NodeBundle, RequeueReason};
use crate::registry::NodeHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    SendingBundle,
    WaitingResult,
    ReceivingResult,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    BundleAvailable,
    BundleSent,
    ResultHeaderRead,
    ResultsRead,
    Error,
    Close,
}

/// 连接在某个状态下关心的 I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    None,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct NodeStateMachine {
    state: NodeState,
}

impl Default for NodeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStateMachine {
    pub fn new() -> Self {
        Self {
            state: NodeState::Idle,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// 状态进入时应关注的 I/O
    pub fn interest(state: NodeState) -> Interest {
        match state {
            NodeState::SendingBundle => Interest::Write,
            NodeState::WaitingResult | NodeState::ReceivingResult => Interest::Read,
            NodeState::Idle | NodeState::Closing => Interest::None,
        }
    }

    /// 执行一次转换，非法转换返回 [`GridError::InvalidTransition`]，状态保持不变
    pub fn transition(&mut self, event: NodeEvent) -> GridResult<(NodeState, Interest)> {
        use NodeEvent::*;
        use NodeState::*;

        let next = match (self.state, event) {
            (Closing, _) => None,
            (_, Error) | (_, Close) => Some(Closing),
            (Idle, BundleAvailable) => Some(SendingBundle),
            (SendingBundle, BundleSent) => Some(WaitingResult),
            (WaitingResult, ResultHeaderRead) => Some(ReceivingResult),
            (ReceivingResult, ResultsRead) => Some(Idle),
            _ => None,
        };

        match next {
            Some(state) => {
                self.state = state;
                Ok((state, Self::interest(state)))
            }
            None => Err(GridError::InvalidTransition {
                from: self.state.to_string(),
                event: event.to_string(),
            }),
        }
    }
}

/// 一次分发需要写给节点的全部内容
#[derive(Debug)]
pub struct DispatchFrames {
    pub command: NodeCommand,
    pub data_provider: Arc<Vec<u8>>,
    pub tasks: Vec<Arc<Vec<u8>>>,
}

struct InFlight {
    bundle: NodeBundle,
    sent_at: Instant,
}

/// 一个节点连接的全部可变状态
pub struct NodeChannelContext {
    driver: Arc<DriverContext>,
    handle: Arc<NodeHandle>,
    properties: HashMap<String, String>,
    machine: NodeStateMachine,
    bundler: Box<dyn Bundler>,
    in_flight: Option<InFlight>,
    result_header: Option<NodeResultHeader>,
    /// 是否已计入空闲节点统计
    counted_idle: bool,
    bundles_completed: u64,
    tasks_completed: u64,
}

impl NodeChannelContext {
    pub fn new(driver: Arc<DriverContext>, handle: Arc<NodeHandle>) -> Self {
        let mut bundler = driver.bundlers.new_bundler();
        if let Some(aware) = bundler.as_node_aware() {
            aware.set_node_info(&handle.info);
        }
        let properties = handle.info.policy_properties();
        let mut context = Self {
            driver,
            handle,
            properties,
            machine: NodeStateMachine::new(),
            bundler,
            in_flight: None,
            result_header: None,
            counted_idle: false,
            bundles_completed: 0,
            tasks_completed: 0,
        };
        context.set_idle_counted(true);
        context
    }

    pub fn node_uuid(&self) -> &str {
        self.handle.uuid()
    }

    pub fn info(&self) -> &NodeInfo {
        &self.handle.info
    }

    pub fn state(&self) -> NodeState {
        self.machine.state()
    }

    pub fn bundle_size(&self) -> usize {
        self.bundler.bundle_size()
    }

    pub fn bundles_completed(&self) -> u64 {
        self.bundles_completed
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed
    }

    /// 正在节点上执行的包所属作业
    pub fn in_flight_job(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|f| f.bundle.job_uuid())
    }

    fn set_idle_counted(&mut self, idle: bool) {
        if self.counted_idle != idle {
            self.counted_idle = idle;
            let delta = if idle { 1.0 } else { -1.0 };
            self.driver.statistics.add_value(labels::IDLE_NODES, delta);
        }
    }

    /// 负载均衡配置更新后换用新版本的策略
    fn refresh_bundler(&mut self) {
        let current = self.driver.bundlers.timestamp();
        if self.bundler.timestamp() >= current {
            return;
        }
        let mut bundler = self.driver.bundlers.new_bundler();
        if let Some(aware) = bundler.as_node_aware() {
            aware.set_node_info(&self.handle.info);
        }
        debug!(
            "节点 {} 的负载均衡策略更新: {} -> {}",
            self.node_uuid(),
            self.bundler.name(),
            bundler.name()
        );
        self.bundler.dispose();
        self.bundler = bundler;
    }

    /// 空闲时尝试从队列取一个包
    ///
    /// 没有合格的作业时返回 `None`，状态保持 `Idle`。
    pub fn try_dispatch(&mut self) -> GridResult<Option<DispatchFrames>> {
        if self.machine.state() != NodeState::Idle {
            return Ok(None);
        }
        self.refresh_bundler();
        let size = self.bundler.bundle_size();
        let Some(bundle) = self
            .driver
            .queue
            .next_bundle(self.handle.uuid(), &self.properties, size)
        else {
            return Ok(None);
        };

        self.machine.transition(NodeEvent::BundleAvailable)?;
        self.set_idle_counted(false);
        if let Some(aware) = self.bundler.as_job_aware() {
            aware.set_job_metadata(&bundle.header);
        }
        debug!(
            "节点 {} 领取任务包 {} (任务数: {}, 建议大小: {})",
            self.node_uuid(),
            bundle.header.key(),
            bundle.tasks.len(),
            size
        );

        let frames = DispatchFrames {
            command: NodeCommand::Bundle {
                bundle: bundle.header.clone(),
                positions: bundle.positions(),
            },
            data_provider: bundle.data_provider.clone(),
            tasks: bundle.tasks.iter().map(|t| t.data.clone()).collect(),
        };
        self.handle.set_in_flight(Some(bundle.job_uuid().to_string()));
        self.in_flight = Some(InFlight {
            bundle,
            sent_at: Instant::now(),
        });
        Ok(Some(frames))
    }

    /// 任务包已完整写出
    pub fn bundle_sent(&mut self) -> GridResult<()> {
        self.machine.transition(NodeEvent::BundleSent)?;
        Ok(())
    }

    /// 收到结果头，必须对应当前在途包
    pub fn result_header_read(&mut self, header: NodeResultHeader) -> GridResult<()> {
        self.machine.transition(NodeEvent::ResultHeaderRead)?;
        let expected = self
            .in_flight
            .as_ref()
            .map(|f| f.bundle.header.uuid.as_str())
            .unwrap_or_default();
        if header.bundle.uuid != expected {
            return Err(GridError::protocol(format!(
                "节点返回了未知任务包 {} 的结果",
                header.bundle.uuid
            )));
        }
        self.result_header = Some(header);
        Ok(())
    }

    /// 收到全部结果：按位置与在途包匹配、反馈耗时、投递给客户端，回到空闲
    pub fn results_read(&mut self, results: Vec<TaskResult>) -> GridResult<()> {
        self.machine.transition(NodeEvent::ResultsRead)?;
        let header = self
            .result_header
            .take()
            .ok_or_else(|| GridError::protocol("缺少结果头"))?;
        let InFlight { mut bundle, sent_at } = self
            .in_flight
            .take()
            .ok_or_else(|| GridError::protocol("没有在途的任务包"))?;
        self.handle.set_in_flight(None);
        self.set_idle_counted(true);

        let elapsed_nanos = sent_at.elapsed().as_nanos() as f64;
        let job_uuid = bundle.job_uuid().to_string();

        if let Some(throwable) = &header.bundle.throwable {
            warn!(
                "节点 {} 执行任务包 {} 失败: {}",
                self.node_uuid(),
                bundle.header.key(),
                throwable
            );
            self.requeue_in_flight(bundle, RequeueReason::BundleFailure);
            return Ok(());
        }

        let mut by_position: HashMap<usize, TaskResult> =
            results.into_iter().map(|r| (r.position, r)).collect();
        let node_requeue = header.bundle.is_requeue();
        let mut completed = Vec::with_capacity(bundle.tasks.len());
        let mut returned = Vec::new();

        for task in std::mem::take(&mut bundle.tasks) {
            match by_position.remove(&task.position) {
                Some(result) if result.state == TaskState::Cancelled && node_requeue => {
                    returned.push(task)
                }
                Some(result) => completed.push(result),
                None => completed.push(TaskResult::failure(
                    task.position,
                    "节点未返回该任务的结果",
                    0,
                )),
            }
        }
        if !by_position.is_empty() {
            warn!(
                "节点 {} 返回了 {} 个不属于任务包 {} 的结果，已忽略",
                self.node_uuid(),
                by_position.len(),
                bundle.header.key()
            );
        }

        let executed = completed
            .iter()
            .filter(|r| r.state != TaskState::Cancelled)
            .count();
        if executed > 0 {
            self.bundler.feedback(executed, elapsed_nanos);
            self.record_timings(executed, elapsed_nanos, header.bundle.node_execution_nanos);
        }
        self.bundles_completed += 1;
        self.tasks_completed += completed.len() as u64;

        debug!(
            "节点 {} 完成任务包 {} (结果: {}, 退回: {}, 耗时: {:.1}ms)",
            self.node_uuid(),
            bundle.header.key(),
            completed.len(),
            returned.len(),
            elapsed_nanos / 1_000_000.0
        );

        self.driver.deliver_results(
            bundle.client_uuid.as_deref(),
            &job_uuid,
            &bundle.client_job_uuid,
            completed,
        );

        if returned.is_empty() {
            self.driver.queue.complete_bundle(&job_uuid);
        } else {
            bundle.tasks = returned;
            bundle.header.mark_requeue();
            self.driver
                .requeue_bundle(bundle, RequeueReason::NodeRequest);
        }
        Ok(())
    }

    fn record_timings(&self, executed: usize, elapsed_nanos: f64, node_nanos: u64) {
        let count = executed as u64;
        let elapsed_ms = elapsed_nanos / 1_000_000.0;
        let node_ms = node_nanos as f64 / 1_000_000.0;
        let stats = &self.driver.statistics;
        stats.add_values(labels::EXECUTION, elapsed_ms, count);
        stats.add_values(labels::NODE_EXECUTION, node_ms, count);
        stats.add_values(labels::TRANSPORT_TIME, (elapsed_ms - node_ms).max(0.0), count);
    }

    /// 连接出错或关闭：在途包重新排队
    ///
    /// 提交作业的客户端已断开且作业要求随客户端取消时，直接丢弃该包。
    pub fn close(&mut self, error: Option<&GridError>) {
        let event = if error.is_some() {
            NodeEvent::Error
        } else {
            NodeEvent::Close
        };
        if self.machine.transition(event).is_err() {
            return;
        }
        self.set_idle_counted(false);
        self.handle.set_in_flight(None);
        self.result_header = None;

        if let Some(InFlight { bundle, .. }) = self.in_flight.take() {
            let client_gone = bundle
                .client_uuid
                .as_deref()
                .is_some_and(|c| !self.driver.clients.is_connected(c));
            if client_gone && bundle.header.sla.cancel_upon_client_disconnect {
                info!(
                    "客户端已断开，丢弃节点 {} 上的任务包 {}",
                    self.node_uuid(),
                    bundle.header.key()
                );
                self.driver.queue.complete_bundle(bundle.job_uuid());
            } else {
                let requeued = self.requeue_in_flight(bundle, RequeueReason::NodeError);
                info!(
                    "节点 {} 断开，{} 个任务重新排队",
                    self.node_uuid(),
                    requeued
                );
            }
        }
        self.bundler.dispose();
    }

    /// 在途包退回队列前先打上重排队标记
    fn requeue_in_flight(&self, mut bundle: NodeBundle, reason: RequeueReason) -> usize {
        bundle.mark_for_requeue();
        self.driver.requeue_bundle(bundle, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ServerJob;
    use taskgrid_core::{
        models::{ServerTask, TaskBundle},
        protocol::IdentityTransform,
        Algorithm, DriverConfig, LoadBalancingConfig,
    };
    use tokio::sync::mpsc;

    use crate::registry::ClientEvent;

    #[test]
    fn test_full_cycle_transitions() {
        let mut machine = NodeStateMachine::new();
        assert_eq!(
            machine.transition(NodeEvent::BundleAvailable).unwrap(),
            (NodeState::SendingBundle, Interest::Write)
        );
        assert_eq!(
            machine.transition(NodeEvent::BundleSent).unwrap(),
            (NodeState::WaitingResult, Interest::Read)
        );
        assert_eq!(
            machine.transition(NodeEvent::ResultHeaderRead).unwrap(),
            (NodeState::ReceivingResult, Interest::Read)
        );
        assert_eq!(
            machine.transition(NodeEvent::ResultsRead).unwrap(),
            (NodeState::Idle, Interest::None)
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = NodeStateMachine::new();
        let err = machine.transition(NodeEvent::ResultsRead).unwrap_err();
        assert!(matches!(err, GridError::InvalidTransition { .. }));
        assert_eq!(machine.state(), NodeState::Idle);

        machine.transition(NodeEvent::BundleAvailable).unwrap();
        assert!(machine.transition(NodeEvent::ResultHeaderRead).is_err());

        assert_eq!(
            machine.transition(NodeEvent::Error).unwrap(),
            (NodeState::Closing, Interest::None)
        );
        for event in [NodeEvent::Close, NodeEvent::Error, NodeEvent::BundleAvailable] {
            assert!(machine.transition(event).is_err());
        }
    }

    fn driver(size: usize) -> Arc<DriverContext> {
        let lb = LoadBalancingConfig {
            algorithm: Algorithm::Fixed,
            size,
            ..Default::default()
        };
        Arc::new(
            DriverContext::new(
                DriverConfig::default(),
                lb,
                Arc::new(IdentityTransform),
                HashMap::new(),
            )
            .unwrap(),
        )
    }

    fn node_handle(uuid: &str) -> Arc<NodeHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(NodeHandle::new(
            NodeInfo {
                uuid: uuid.to_string(),
                host: "localhost".to_string(),
                management_port: 1,
                threads: 2,
                properties: HashMap::new(),
            },
            tx,
        ))
    }

    fn submit(driver: &DriverContext, uuid: &str, tasks: usize) {
        let header = TaskBundle::new(uuid, "job", tasks, Default::default());
        let tasks = (0..tasks).map(|i| ServerTask::new(i, vec![i as u8])).collect();
        driver
            .queue
            .add_bundle(ServerJob::new(header, Some("c1".to_string()), vec![], tasks))
            .unwrap();
    }

    fn answer(frames: &DispatchFrames, cancelled_from: usize) -> (NodeResultHeader, Vec<TaskResult>) {
        let NodeCommand::Bundle { bundle, positions } = &frames.command else {
            panic!("expected bundle command");
        };
        let results = positions
            .iter()
            .map(|&p| {
                if p >= cancelled_from {
                    TaskResult::cancelled(p)
                } else {
                    TaskResult::success(p, vec![p as u8], 1_000)
                }
            })
            .collect::<Vec<_>>();
        let mut header = bundle.clone();
        header.node_execution_nanos = 1_000_000;
        (
            NodeResultHeader {
                bundle: header,
                result_count: results.len(),
            },
            results,
        )
    }

    #[test]
    fn test_fixed_bundler_rounds() {
        let driver = driver(4);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        driver.clients.register("c1", events_tx);
        submit(&driver, "j1", 10);

        let mut ctx = NodeChannelContext::new(driver.clone(), node_handle("n1"));
        let mut rounds = Vec::new();
        while let Some(frames) = ctx.try_dispatch().unwrap() {
            rounds.push(frames.tasks.len());
            ctx.bundle_sent().unwrap();
            let (header, results) = answer(&frames, usize::MAX);
            ctx.result_header_read(header).unwrap();
            ctx.results_read(results).unwrap();
        }

        assert_eq!(rounds, vec![4, 4, 2]);
        assert_eq!(ctx.tasks_completed(), 10);
        assert_eq!(ctx.state(), NodeState::Idle);
        assert_eq!(driver.queue.job_count(), 0);

        let mut delivered = 0;
        while let Ok(ClientEvent::Results { results, .. }) = events.try_recv() {
            delivered += results.len();
        }
        assert_eq!(delivered, 10);
    }

    #[test]
    fn test_cancelled_results_with_requeue_return_to_queue() {
        let driver = driver(4);
        submit(&driver, "j1", 4);
        let mut ctx = NodeChannelContext::new(driver.clone(), node_handle("n1"));

        let frames = ctx.try_dispatch().unwrap().unwrap();
        ctx.bundle_sent().unwrap();
        let (mut header, results) = answer(&frames, 2);
        header.bundle.mark_requeue();
        ctx.result_header_read(header).unwrap();
        ctx.results_read(results).unwrap();

        assert_eq!(driver.queue.size(), 2);
        let frames = ctx.try_dispatch().unwrap().unwrap();
        let NodeCommand::Bundle { positions, bundle } = frames.command else {
            panic!("expected bundle command");
        };
        assert_eq!(positions, vec![2, 3]);
        assert!(!bundle.is_requeue());
    }

    #[test]
    fn test_close_requeues_in_flight_bundle() {
        let driver = driver(5);
        let (events_tx, _events) = mpsc::unbounded_channel();
        driver.clients.register("c1", events_tx);
        submit(&driver, "j1", 5);

        let mut ctx = NodeChannelContext::new(driver.clone(), node_handle("n1"));
        ctx.try_dispatch().unwrap().unwrap();
        ctx.bundle_sent().unwrap();
        assert_eq!(driver.queue.size(), 0);

        ctx.close(Some(&GridError::ConnectionClosed));
        assert_eq!(ctx.state(), NodeState::Closing);
        assert_eq!(driver.queue.size(), 5);

        let mut other = NodeChannelContext::new(driver.clone(), node_handle("n2"));
        let frames = other.try_dispatch().unwrap().unwrap();
        assert_eq!(frames.tasks.len(), 5);
    }

    #[test]
    fn test_close_discards_bundle_of_departed_client() {
        let driver = driver(5);
        submit(&driver, "j1", 5);

        let mut ctx = NodeChannelContext::new(driver.clone(), node_handle("n1"));
        ctx.try_dispatch().unwrap().unwrap();
        ctx.close(None);

        assert_eq!(driver.queue.size(), 0);
        assert_eq!(driver.queue.job_count(), 0);
    }

    #[test]
    fn test_unknown_bundle_result_is_protocol_error() {
        let driver = driver(2);
        submit(&driver, "j1", 2);
        let mut ctx = NodeChannelContext::new(driver, node_handle("n1"));
        let frames = ctx.try_dispatch().unwrap().unwrap();
        ctx.bundle_sent().unwrap();

        let (mut header, _) = answer(&frames, usize::MAX);
        header.bundle.uuid = "other".to_string();
        assert!(matches!(
            ctx.result_header_read(header),
            Err(GridError::Protocol(_))
        ));
    }

    #[test]
    fn test_bundle_throwable_requeues() {
        let driver = driver(3);
        submit(&driver, "j1", 3);
        let mut ctx = NodeChannelContext::new(driver.clone(), node_handle("n1"));
        let frames = ctx.try_dispatch().unwrap().unwrap();
        ctx.bundle_sent().unwrap();

        let (mut header, _) = answer(&frames, usize::MAX);
        header.bundle.throwable = Some("执行池已关闭".to_string());
        header.result_count = 0;
        ctx.result_header_read(header).unwrap();
        ctx.results_read(Vec::new()).unwrap();

        assert_eq!(driver.queue.size(), 3);
        assert_eq!(ctx.state(), NodeState::Idle);
    }

    #[test]
    fn test_bundle_failure_counts_resubmits() {
        let driver = driver(2);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        driver.clients.register("c1", events_tx);
        let mut header = TaskBundle::new("j1", "job", 2, Default::default());
        header.sla.max_task_resubmits = 1;
        let tasks = (0..2).map(|i| ServerTask::new(i, vec![i as u8])).collect();
        driver
            .queue
            .add_bundle(ServerJob::new(header, Some("c1".to_string()), vec![], tasks))
            .unwrap();

        let mut ctx = NodeChannelContext::new(driver.clone(), node_handle("n1"));
        for _ in 0..2 {
            let frames = ctx.try_dispatch().unwrap().unwrap();
            ctx.bundle_sent().unwrap();
            let (mut header, _) = answer(&frames, usize::MAX);
            header.bundle.throwable = Some("节点内部错误".to_string());
            header.result_count = 0;
            ctx.result_header_read(header).unwrap();
            ctx.results_read(Vec::new()).unwrap();
        }

        // 第二次失败超过重提交上限，任务以失败结果返回
        assert_eq!(driver.queue.size(), 0);
        let mut failed = 0;
        while let Ok(ClientEvent::Results { results, .. }) = events.try_recv() {
            failed += results.iter().filter(|r| r.state == TaskState::Exception).count();
        }
        assert_eq!(failed, 2);
    }
}
