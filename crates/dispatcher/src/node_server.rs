//! 节点连接服务
//!
//! 每个节点连接一个 tokio 任务。读取由单独的任务完成并通过通道送回，
//! 主循环因此可以在等待结果的同时处理取消命令和新作业通知。

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use taskgrid_core::{
    labels,
    models::{NodeInfo, TaskResult},
    protocol::{FramedReader, FramedWriter, NodeCommand, NodeResultHeader},
    GridError, GridResult, GridStatistics,
};

use crate::driver::DriverContext;
use crate::node_context::{DispatchFrames, NodeChannelContext, NodeState};
use crate::registry::{NodeControl, NodeHandle};

/// 读取任务送回主循环的消息
#[derive(Debug)]
enum Inbound {
    Header(NodeResultHeader),
    Results(Vec<TaskResult>),
}

/// 服务一个已发送 `NODE_JOB_DATA` 通道标识的连接，直到连接关闭或 Driver 停止
pub async fn serve_node<S>(
    driver: Arc<DriverContext>,
    stream: S,
    mut shutdown: broadcast::Receiver<()>,
) -> GridResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedReader::new(read_half, driver.transform.clone())
        .with_max_frame_size(driver.config.max_frame_size);
    let mut writer = FramedWriter::new(write_half, driver.transform.clone());

    let handshake = Duration::from_millis(driver.config.handshake_timeout_ms);
    let info: NodeInfo = tokio::time::timeout(handshake, reader.read_message())
        .await
        .map_err(|_| GridError::protocol("节点握手超时"))??;
    driver
        .statistics
        .add_value(labels::TRAFFIC_IN, reader.take_bytes_read() as f64);

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handle = Arc::new(NodeHandle::new(info.clone(), control_tx));
    if !driver.nodes.register(handle.clone()) {
        return Err(GridError::protocol(format!("节点 {} 已经连接", info.uuid)));
    }
    info!(
        "节点已连接: {} ({}, 线程数: {})",
        info.uuid,
        info.management_info(),
        info.threads
    );
    driver.statistics.add_value(labels::NODES, 1.0);

    let (inbound_tx, inbound_rx) = mpsc::channel(4);
    let reader_task = tokio::spawn(read_results(
        reader,
        inbound_tx,
        driver.statistics.clone(),
    ));

    let mut context = NodeChannelContext::new(driver.clone(), handle);
    let result = run_channel(
        &driver,
        &mut context,
        &mut writer,
        inbound_rx,
        control_rx,
        &mut shutdown,
    )
    .await;

    reader_task.abort();
    context.close(result.as_ref().err());
    driver.nodes.unregister(&info.uuid);
    driver.release_pinned_jobs(&info.uuid);
    driver.statistics.add_value(labels::NODES, -1.0);
    info!(
        "节点已断开: {} (完成任务包: {}, 任务: {})",
        info.uuid,
        context.bundles_completed(),
        context.tasks_completed()
    );
    if let Err(e) = writer.shutdown().await {
        debug!("关闭节点连接写端失败: {}", e);
    }
    result
}

async fn run_channel<W>(
    driver: &DriverContext,
    context: &mut NodeChannelContext,
    writer: &mut FramedWriter<W>,
    mut inbound: mpsc::Receiver<GridResult<Inbound>>,
    mut control: mpsc::UnboundedReceiver<NodeControl>,
    shutdown: &mut broadcast::Receiver<()>,
) -> GridResult<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let idle = context.state() == NodeState::Idle;
        // 先登记通知再检查队列，两者之间加入的作业不会被错过
        let notified = driver.queue.notifier().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if idle {
            if let Some(frames) = context.try_dispatch()? {
                send_bundle(writer, frames, &driver.statistics).await?;
                context.bundle_sent()?;
                continue;
            }
        }

        tokio::select! {
            _ = &mut notified, if idle => {}
            message = inbound.recv() => match message {
                Some(Ok(Inbound::Header(header))) => context.result_header_read(header)?,
                Some(Ok(Inbound::Results(results))) => context.results_read(results)?,
                Some(Err(e)) => return Err(e),
                None => return Err(GridError::ConnectionClosed),
            },
            command = control.recv() => match command {
                Some(NodeControl::CancelJob { job_uuid, requeue }) => {
                    if context.in_flight_job() == Some(job_uuid.as_str()) {
                        debug!(
                            "向节点 {} 发送取消命令: {} (重新排队: {})",
                            context.node_uuid(), job_uuid, requeue
                        );
                        write_command(writer, &NodeCommand::CancelJob { job_uuid, requeue }, &driver.statistics).await?;
                    }
                }
                Some(NodeControl::Shutdown) | None => {
                    write_command(writer, &NodeCommand::Shutdown, &driver.statistics).await?;
                    return Ok(());
                }
            },
            _ = shutdown.recv() => {
                if let Err(e) = write_command(writer, &NodeCommand::Shutdown, &driver.statistics).await {
                    debug!("通知节点 {} 停止失败: {}", context.node_uuid(), e);
                }
                return Ok(());
            }
        }
    }
}

async fn write_command<W>(
    writer: &mut FramedWriter<W>,
    command: &NodeCommand,
    statistics: &GridStatistics,
) -> GridResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_message(command).await?;
    writer.flush().await?;
    statistics.add_value(labels::TRAFFIC_OUT, writer.take_bytes_written() as f64);
    Ok(())
}

async fn send_bundle<W>(
    writer: &mut FramedWriter<W>,
    frames: DispatchFrames,
    statistics: &GridStatistics,
) -> GridResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_message(&frames.command).await?;
    writer.write_frame(&frames.data_provider).await?;
    for task in &frames.tasks {
        writer.write_frame(task).await?;
    }
    writer.flush().await?;
    statistics.add_value(labels::TRAFFIC_OUT, writer.take_bytes_written() as f64);
    Ok(())
}

async fn read_results<R>(
    mut reader: FramedReader<R>,
    tx: mpsc::Sender<GridResult<Inbound>>,
    statistics: Arc<GridStatistics>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let outcome: GridResult<bool> = async {
            let header: NodeResultHeader = reader.read_message().await?;
            let count = header.result_count;
            if tx.send(Ok(Inbound::Header(header))).await.is_err() {
                return Ok(false);
            }
            let mut results = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                results.push(reader.read_message::<TaskResult>().await?);
            }
            statistics.add_value(labels::TRAFFIC_IN, reader.take_bytes_read() as f64);
            Ok(tx.send(Ok(Inbound::Results(results))).await.is_ok())
        }
        .await;

        match outcome {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                if !e.is_connection_error() {
                    warn!("读取节点结果失败: {}", e);
                }
                // 主循环可能已经退出
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use taskgrid_core::{
        models::{ServerTask, TaskBundle},
        protocol::{DataTransform, IdentityTransform},
        Algorithm, DriverConfig, LoadBalancingConfig,
    };
    use tokio::io::DuplexStream;

    use crate::job::ServerJob;
    use crate::registry::ClientEvent;

    type NodeSide = (
        FramedReader<tokio::io::ReadHalf<DuplexStream>>,
        FramedWriter<tokio::io::WriteHalf<DuplexStream>>,
    );

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

    async fn connect(
        driver: Arc<DriverContext>,
        uuid: &str,
    ) -> (NodeSide, tokio::task::JoinHandle<GridResult<()>>, broadcast::Sender<()>) {
        let (node_stream, driver_stream) = tokio::io::duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_node(driver, driver_stream, shutdown_rx));

        let transform: Arc<dyn DataTransform> = Arc::new(IdentityTransform);
        let (r, w) = tokio::io::split(node_stream);
        let reader = FramedReader::new(r, transform.clone());
        let mut writer = FramedWriter::new(w, transform);
        let info = NodeInfo {
            uuid: uuid.to_string(),
            host: "localhost".to_string(),
            management_port: 12001,
            threads: 1,
            properties: HashMap::new(),
        };
        writer.write_message(&info).await.unwrap();
        writer.flush().await.unwrap();
        ((reader, writer), server, shutdown_tx)
    }

    fn submit(driver: &DriverContext, uuid: &str, tasks: usize) {
        let header = TaskBundle::new(uuid, "job", tasks, Default::default());
        let tasks = (0..tasks).map(|i| ServerTask::new(i, vec![i as u8])).collect();
        driver
            .queue
            .add_bundle(ServerJob::new(header, Some("c1".to_string()), vec![7], tasks))
            .unwrap();
    }

    /// 读取一个任务包，返回包头与任务位置
    async fn receive_bundle(node: &mut NodeSide) -> (TaskBundle, Vec<usize>) {
        let command: NodeCommand = node.0.read_message().await.unwrap();
        let (bundle, positions) = match command {
            NodeCommand::Bundle { bundle, positions } => (bundle, positions),
            other => panic!("expected bundle, got {other:?}"),
        };
        assert_eq!(node.0.read_frame().await.unwrap(), vec![7]);
        for &p in &positions {
            assert_eq!(node.0.read_frame().await.unwrap(), vec![p as u8]);
        }
        (bundle, positions)
    }

    async fn send_results(node: &mut NodeSide, bundle: TaskBundle, positions: &[usize]) {
        let header = NodeResultHeader {
            bundle,
            result_count: positions.len(),
        };
        node.1.write_message(&header).await.unwrap();
        for &p in positions.iter().rev() {
            node.1
                .write_message(&TaskResult::success(p, vec![p as u8 * 2], 10))
                .await
                .unwrap();
        }
        node.1.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_rounds_over_connection() {
        let driver = driver(4);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        driver.clients.register("c1", events_tx);
        let (mut node, server, shutdown) = connect(driver.clone(), "n1").await;
        submit(&driver, "j1", 10);

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let (bundle, positions) = receive_bundle(&mut node).await;
            sizes.push(positions.len());
            send_results(&mut node, bundle, &positions).await;
        }
        assert_eq!(sizes, vec![4, 4, 2]);

        let mut received = Vec::new();
        while received.len() < 10 {
            let ClientEvent::Results { results, .. } = events.recv().await.unwrap();
            received.extend(results.into_iter().map(|r| r.position));
        }
        received.sort_unstable();
        assert_eq!(received, (0..10).collect::<Vec<_>>());

        shutdown.send(()).unwrap();
        let command: NodeCommand = node.0.read_message().await.unwrap();
        assert_eq!(command, NodeCommand::Shutdown);
        server.await.unwrap().unwrap();
        assert!(driver.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_requeues_to_other_node() {
        let driver = driver(5);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        driver.clients.register("c1", events_tx);
        let (mut first, first_server, _s1) = connect(driver.clone(), "n1").await;
        submit(&driver, "j1", 5);

        let (_, positions) = receive_bundle(&mut first).await;
        assert_eq!(positions.len(), 5);
        drop(first);
        assert!(first_server.await.unwrap().is_err());
        assert_eq!(driver.queue.size(), 5);

        let (mut second, _second_server, _s2) = connect(driver.clone(), "n2").await;
        let (bundle, positions) = receive_bundle(&mut second).await;
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
        send_results(&mut second, bundle, &positions).await;

        let ClientEvent::Results { results, .. } = events.recv().await.unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_reaches_node_holding_job() {
        let driver = driver(2);
        let (mut node, _server, _shutdown) = connect(driver.clone(), "n1").await;
        submit(&driver, "j1", 4);

        let _ = receive_bundle(&mut node).await;
        assert!(driver.cancel_job("j1"));

        let command: NodeCommand = node.0.read_message().await.unwrap();
        assert_eq!(
            command,
            NodeCommand::CancelJob {
                job_uuid: "j1".to_string(),
                requeue: false
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_node_uuid_rejected() {
        let driver = driver(2);
        let (_first, _server, _s1) = connect(driver.clone(), "n1").await;
        // 等待第一个连接完成登记
        while driver.nodes.is_empty() {
            tokio::task::yield_now().await;
        }
        let (_second, second_server, _s2) = connect(driver.clone(), "n1").await;
        assert!(matches!(
            second_server.await.unwrap(),
            Err(GridError::Protocol(_))
        ));
        assert_eq!(driver.nodes.len(), 1);
    }
}
