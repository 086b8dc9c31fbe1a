//! 客户端连接服务

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use taskgrid_core::{
    labels,
    protocol::{AdminRequest, FramedReader, FramedWriter, JobHeader, RequestType, ResultHeader},
    GridError, GridResult, GridStatistics,
};

use crate::admin::handle_admin;
use crate::client_context::{ClientChannelContext, ClientChannelEvent, ClientResponse, ClientStateMachine};
use crate::driver::DriverContext;
use crate::registry::ClientEvent;

/// 读取任务组装好的完整请求
#[derive(Debug)]
enum ClientRequest {
    Execution {
        header: JobHeader,
        data_provider: Vec<u8>,
        tasks: Vec<Vec<u8>>,
    },
    Statistics(JobHeader),
    Admin(JobHeader, AdminRequest),
    Cancel(JobHeader),
}

/// 服务一个已发送 `CLIENT_JOB_DATA` 通道标识的连接
pub async fn serve_client<S>(
    driver: Arc<DriverContext>,
    stream: S,
    mut shutdown: broadcast::Receiver<()>,
) -> GridResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedReader::new(read_half, driver.transform.clone())
        .with_max_frame_size(driver.config.max_frame_size);
    let mut writer = FramedWriter::new(write_half, driver.transform.clone());

    let uuid = uuid::Uuid::new_v4().to_string();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    driver.clients.register(&uuid, events_tx);
    driver.statistics.add_value(labels::CLIENTS, 1.0);
    info!("客户端已连接: {}", uuid);

    let (requests_tx, mut requests) = mpsc::channel(8);
    let reader_task = tokio::spawn(read_requests(reader, requests_tx, driver.statistics.clone()));
    let mut context = ClientChannelContext::new(driver.clone(), uuid.clone());

    let result: GridResult<()> = loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Ok(request)) => {
                    if let Err(e) = handle_request(&driver, &mut context, &mut writer, request).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(GridError::ConnectionClosed),
            },
            Some(event) = events.recv() => {
                let ClientEvent::Results { job_uuid, client_job_uuid, results } = event;
                if let Some(response) = context.on_results(&job_uuid, &client_job_uuid, results) {
                    if let Err(e) = write_response(&mut writer, &response, &driver.statistics).await {
                        break Err(e);
                    }
                }
            }
            _ = shutdown.recv() => break Ok(()),
        }
    };

    reader_task.abort();
    driver.clients.unregister(&uuid);
    let active = context.active_jobs();
    context.disconnect();
    driver.statistics.add_value(labels::CLIENTS, -1.0);
    info!("客户端已断开: {} (未完成作业: {})", uuid, active);
    if let Err(e) = writer.shutdown().await {
        debug!("关闭客户端连接写端失败: {}", e);
    }
    result
}

async fn handle_request<W>(
    driver: &DriverContext,
    context: &mut ClientChannelContext,
    writer: &mut FramedWriter<W>,
    request: ClientRequest,
) -> GridResult<()>
where
    W: AsyncWrite + Unpin,
{
    match request {
        ClientRequest::Execution {
            header,
            data_provider,
            tasks,
        } => {
            if let Some(response) = context.submit(header, data_provider, tasks)? {
                write_response(writer, &response, &driver.statistics).await?;
            }
        }
        ClientRequest::Statistics(header) => {
            let snapshot = driver.statistics_snapshot();
            writer
                .write_message(&ResultHeader {
                    request_type: RequestType::Statistics,
                    uuid: header.uuid,
                    task_count: 1,
                    error: None,
                })
                .await?;
            writer.write_message(&snapshot).await?;
            flush(writer, &driver.statistics).await?;
        }
        ClientRequest::Admin(header, request) => {
            let response = handle_admin(driver, &request);
            writer
                .write_message(&ResultHeader {
                    request_type: RequestType::Admin,
                    uuid: header.uuid,
                    task_count: 1,
                    error: None,
                })
                .await?;
            writer.write_message(&response).await?;
            flush(writer, &driver.statistics).await?;
        }
        ClientRequest::Cancel(header) => {
            let cancelled = context.cancel(&header.uuid);
            debug!("客户端 {} 取消作业 {}: {}", context.uuid(), header.uuid, cancelled);
            writer
                .write_message(&ResultHeader {
                    request_type: RequestType::Cancel,
                    error: (!cancelled).then(|| format!("作业 {} 不存在或已结束", header.uuid)),
                    uuid: header.uuid,
                    task_count: 0,
                })
                .await?;
            flush(writer, &driver.statistics).await?;
        }
    }
    Ok(())
}

async fn write_response<W>(
    writer: &mut FramedWriter<W>,
    response: &ClientResponse,
    statistics: &GridStatistics,
) -> GridResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_message(&response.header).await?;
    for result in &response.results {
        writer.write_message(result).await?;
    }
    flush(writer, statistics).await
}

async fn flush<W>(writer: &mut FramedWriter<W>, statistics: &GridStatistics) -> GridResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.flush().await?;
    statistics.add_value(labels::TRAFFIC_OUT, writer.take_bytes_written() as f64);
    Ok(())
}

async fn read_requests<R>(
    mut reader: FramedReader<R>,
    tx: mpsc::Sender<GridResult<ClientRequest>>,
    statistics: Arc<GridStatistics>,
) where
    R: AsyncRead + Unpin,
{
    let mut machine = ClientStateMachine::new();
    loop {
        let outcome = read_request(&mut reader, &mut machine).await;
        statistics.add_value(labels::TRAFFIC_IN, reader.take_bytes_read() as f64);
        match outcome {
            Ok(request) => {
                if tx.send(Ok(request)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let event = if matches!(e, GridError::ConnectionClosed) {
                    ClientChannelEvent::Close
                } else {
                    warn!("读取客户端请求失败: {}", e);
                    ClientChannelEvent::Error
                };
                // 已处于关闭状态时转换失败，可以忽略
                let _ = machine.transition(event);
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

async fn read_request<R>(
    reader: &mut FramedReader<R>,
    machine: &mut ClientStateMachine,
) -> GridResult<ClientRequest>
where
    R: AsyncRead + Unpin,
{
    let header: JobHeader = reader.read_message().await?;
    machine.transition(ClientChannelEvent::HeaderRead)?;

    let request = match header.request_type {
        RequestType::Execution => {
            let data_provider = reader.read_frame().await?;
            let mut tasks = Vec::with_capacity(header.task_count.min(1024));
            for _ in 0..header.task_count {
                tasks.push(reader.read_frame().await?);
            }
            ClientRequest::Execution {
                header,
                data_provider,
                tasks,
            }
        }
        RequestType::Admin => {
            let request: AdminRequest = reader.read_message().await?;
            ClientRequest::Admin(header, request)
        }
        RequestType::Statistics => ClientRequest::Statistics(header),
        RequestType::Cancel => ClientRequest::Cancel(header),
    };
    machine.transition(ClientChannelEvent::BodyRead)?;
    Ok(request)
}
