use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskgrid_core::{
    models::TaskResult,
    protocol::{
        write_channel_id, AdminRequest, AdminResponse, ChannelId, DataTransform, FramedReader,
        FramedWriter, IdentityTransform, JobHeader, RequestType, ResultHeader,
    },
    GridError, GridResult, StatisticsSnapshot,
};

use crate::job::Job;
use crate::persistence::JobPersistence;

type BoxedWriter = FramedWriter<Box<dyn AsyncWrite + Send + Unpin>>;
type ResponseKey = (RequestType, String);
type PendingResponses = Arc<Mutex<HashMap<ResponseKey, oneshot::Sender<GridResult<Response>>>>>;

/// Driver 的一次响应：响应头和其后的原始帧
#[derive(Debug)]
struct Response {
    header: ResultHeader,
    frames: Vec<Vec<u8>>,
}

/// 已提交作业的句柄
#[derive(Debug)]
pub struct JobHandle {
    uuid: String,
    task_count: usize,
    rx: oneshot::Receiver<GridResult<Response>>,
}

impl JobHandle {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// 等待作业完成，结果按 position 排序
    pub async fn await_results(self) -> GridResult<Vec<TaskResult>> {
        let response = self.rx.await.map_err(|_| GridError::ConnectionClosed)??;
        if let Some(error) = response.header.error {
            return Err(GridError::TaskExecution(format!("作业 {} 失败: {}", self.uuid, error)));
        }
        let mut results = response
            .frames
            .iter()
            .map(|frame| {
                serde_json::from_slice::<TaskResult>(frame)
                    .map_err(|e| GridError::Serialization(format!("无效的任务结果: {e}")))
            })
            .collect::<GridResult<Vec<_>>>()?;
        results.sort_by_key(|r| r.position);
        Ok(results)
    }

    /// 带超时的等待，超时返回 `None`，作业仍在 Driver 上执行
    pub async fn await_results_timeout(self, timeout: Duration) -> GridResult<Option<Vec<TaskResult>>> {
        match tokio::time::timeout(timeout, self.await_results()).await {
            Ok(results) => results.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// 任务网格客户端
///
/// 一条连接上可以同时有多个作业和请求在途，响应按 (请求类型, UUID) 分派。
pub struct GridClient {
    app_uuid: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: PendingResponses,
    reader_task: JoinHandle<()>,
}

impl GridClient {
    pub async fn connect(address: &str) -> GridResult<Self> {
        Self::connect_with_transform(address, Arc::new(IdentityTransform)).await
    }

    pub async fn connect_with_transform(
        address: &str,
        transform: Arc<dyn DataTransform>,
    ) -> GridResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| GridError::Network(format!("连接 Driver {address} 失败: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置 TCP_NODELAY 失败: {}", e);
        }
        let client = Self::from_stream(stream, transform).await?;
        info!("客户端 {} 已连接到 Driver {}", client.app_uuid, address);
        Ok(client)
    }

    /// 在已建立的连接上创建客户端
    pub async fn from_stream<S>(mut stream: S, transform: Arc<dyn DataTransform>) -> GridResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        write_channel_id(&mut stream, ChannelId::ClientJobData).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedReader::new(read_half, transform.clone());
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let writer = FramedWriter::new(write_half, transform);

        let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = tokio::spawn(read_responses(reader, pending.clone()));
        Ok(Self {
            app_uuid: uuid::Uuid::new_v4().to_string(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            reader_task,
        })
    }

    pub fn app_uuid(&self) -> &str {
        &self.app_uuid
    }

    fn register(&self, key: ResponseKey) -> GridResult<oneshot::Receiver<GridResult<Response>>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&key) {
            return Err(GridError::protocol(format!("请求 {} 已在等待响应", key.1)));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key, tx);
        Ok(rx)
    }

    fn unregister(&self, key: &ResponseKey) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// 提交作业，返回可等待结果的句柄
    pub async fn submit(&self, job: &Job) -> GridResult<JobHandle> {
        let frames = job.task_frames()?;
        let key = (RequestType::Execution, job.uuid.clone());
        let rx = self.register(key.clone())?;

        let sent: GridResult<()> = async {
            let mut writer = self.writer.lock().await;
            writer.write_message(&job.header(&self.app_uuid)).await?;
            writer.write_frame(&job.data_provider).await?;
            for frame in &frames {
                writer.write_frame(frame).await?;
            }
            writer.flush().await
        }
        .await;
        if let Err(e) = sent {
            self.unregister(&key);
            return Err(e);
        }

        debug!("已提交作业 {} ({})，任务数: {}", job.uuid, job.name, job.task_count());
        Ok(JobHandle {
            uuid: job.uuid.clone(),
            task_count: job.task_count(),
            rx,
        })
    }

    /// 提交作业并等待结果
    pub async fn execute(&self, job: &Job) -> GridResult<Vec<TaskResult>> {
        self.submit(job).await?.await_results().await
    }

    /// 借助持久化执行作业
    ///
    /// 已保存且完整的作业直接返回保存的结果；否则先保存作业，完成后保存结果。
    pub async fn execute_persistent<K, P>(&self, job: &Job, persistence: &P) -> GridResult<Vec<TaskResult>>
    where
        K: Send + Sync,
        P: JobPersistence<K> + ?Sized,
    {
        let key = persistence.compute_key(job);
        if let Some(persisted) = persistence.load(&key).await? {
            if persisted.is_complete() {
                info!("作业 {} 已有完整的保存结果，不再提交", job.uuid);
                return Ok(persisted.results);
            }
        }

        persistence.store(&key, job, &[]).await?;
        let results = self.execute(job).await?;
        persistence.store(&key, job, &results).await?;
        Ok(results)
    }

    async fn request(&self, header: JobHeader, body: Option<&AdminRequest>) -> GridResult<Response> {
        let key = (header.request_type, header.uuid.clone());
        let rx = self.register(key.clone())?;
        let sent: GridResult<()> = async {
            let mut writer = self.writer.lock().await;
            writer.write_message(&header).await?;
            if let Some(body) = body {
                writer.write_message(body).await?;
            }
            writer.flush().await
        }
        .await;
        if let Err(e) = sent {
            self.unregister(&key);
            return Err(e);
        }
        rx.await.map_err(|_| GridError::ConnectionClosed)?
    }

    /// 查询 Driver 的统计数据
    pub async fn statistics(&self) -> GridResult<StatisticsSnapshot> {
        let header = JobHeader::request(
            RequestType::Statistics,
            uuid::Uuid::new_v4().to_string(),
            self.app_uuid.clone(),
        );
        let response = self.request(header, None).await?;
        decode_single(response)
    }

    /// 发送管理命令
    pub async fn admin(&self, request: &AdminRequest) -> GridResult<AdminResponse> {
        let header = JobHeader::request(
            RequestType::Admin,
            uuid::Uuid::new_v4().to_string(),
            self.app_uuid.clone(),
        );
        let response = self.request(header, Some(request)).await?;
        decode_single(response)
    }

    /// 取消本客户端提交的作业，返回 Driver 是否确实取消了它
    ///
    /// 被取消的作业的 [`JobHandle`] 仍会收到响应，未执行的任务为取消状态。
    pub async fn cancel_job(&self, job_uuid: &str) -> GridResult<bool> {
        let header = JobHeader::request(RequestType::Cancel, job_uuid, self.app_uuid.clone());
        let response = self.request(header, None).await?;
        if let Some(error) = response.header.error {
            debug!("取消作业 {} 未生效: {}", job_uuid, error);
            return Ok(false);
        }
        Ok(true)
    }

    /// 关闭连接，未完成的请求以连接关闭错误结束
    pub async fn close(self) -> GridResult<()> {
        let result = self.writer.lock().await.shutdown().await;
        self.reader_task.abort();
        fail_all(&self.pending);
        info!("客户端 {} 已关闭", self.app_uuid);
        result
    }
}

impl Drop for GridClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn decode_single<T: serde::de::DeserializeOwned>(response: Response) -> GridResult<T> {
    if let Some(error) = response.header.error {
        return Err(GridError::Internal(error));
    }
    let frame = response
        .frames
        .first()
        .ok_or_else(|| GridError::protocol("响应缺少消息体"))?;
    serde_json::from_slice(frame).map_err(|e| GridError::Serialization(format!("无效的响应: {e}")))
}

fn fail_all(pending: &PendingResponses) {
    let senders: Vec<_> = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .map(|(_, tx)| tx)
        .collect();
    for tx in senders {
        let _ = tx.send(Err(GridError::ConnectionClosed));
    }
}

async fn read_responses<R>(mut reader: FramedReader<R>, pending: PendingResponses)
where
    R: AsyncRead + Unpin,
{
    loop {
        let outcome: GridResult<Response> = async {
            let header: ResultHeader = reader.read_message().await?;
            let mut frames = Vec::with_capacity(header.task_count.min(1024));
            for _ in 0..header.task_count {
                frames.push(reader.read_frame().await?);
            }
            Ok(Response { header, frames })
        }
        .await;

        match outcome {
            Ok(response) => {
                let key = (response.header.request_type, response.header.uuid.clone());
                let tx = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => warn!("收到未知请求的响应: {:?} {}", key.0, key.1),
                }
            }
            Err(e) => {
                debug!("客户端连接读取结束: {}", e);
                fail_all(&pending);
                return;
            }
        }
    }
}
