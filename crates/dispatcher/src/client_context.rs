//! Driver 端的客户端连接状态
//!
//! 一个客户端连接上可以同时有多个作业在执行。每个作业对应一个
//! [`ClientJobEntry`]，按任务位置收集结果，全部到齐后按位置顺序一次性返回。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use taskgrid_core::{
    models::{ServerTask, TaskBundle, TaskResult, TaskState},
    protocol::{JobHeader, RequestType, ResultHeader},
    GridError, GridResult,
};

use crate::driver::DriverContext;
use crate::job::ServerJob;
use crate::node_context::Interest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    WaitingRequest,
    ReadingBody,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientChannelEvent {
    HeaderRead,
    BodyRead,
    Error,
    Close,
}

/// 客户端连接读取侧的状态机
///
/// 每个请求都是“请求头 + 请求体”，没有请求体的请求（统计、取消）读完请求头后
/// 立即以空请求体完成。
#[derive(Debug)]
pub struct ClientStateMachine {
    state: ClientState,
}

impl Default for ClientStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStateMachine {
    pub fn new() -> Self {
        Self {
            state: ClientState::WaitingRequest,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn transition(&mut self, event: ClientChannelEvent) -> GridResult<(ClientState, Interest)> {
        use ClientChannelEvent::*;
        use ClientState::*;

        let next = match (self.state(), event) {
            (Closing, _) => None,
            (_, Error) | (_, Close) => Some(Closing),
            (WaitingRequest, HeaderRead) => Some(ReadingBody),
            (ReadingBody, BodyRead) => Some(WaitingRequest),
            _ => None,
        };
        match next {
            Some(state) => {
                self.state = state;
                let interest = if state == Closing {
                    Interest::None
                } else {
                    Interest::Read
                };
                Ok((state, interest))
            }
            None => Err(GridError::InvalidTransition {
                from: format!("{:?}", self.state()),
                event: format!("{event:?}"),
            }),
        }
    }
}

/// 发给客户端的一个完整响应
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    pub header: ResultHeader,
    pub results: Vec<TaskResult>,
}

impl ClientResponse {
    pub fn error(uuid: &str, error: impl Into<String>) -> Self {
        Self {
            header: ResultHeader {
                request_type: RequestType::Execution,
                uuid: uuid.to_string(),
                task_count: 0,
                error: Some(error.into()),
            },
            results: Vec::new(),
        }
    }
}

/// 一个作业的结果收集状态
#[derive(Debug)]
pub struct ClientJobEntry {
    pub job_uuid: String,
    pub name: String,
    task_count: usize,
    /// 队列中的作业（普通作业一个，广播作业每个节点一个）及其已收到的位置
    copies: HashMap<String, HashSet<usize>>,
    results: BTreeMap<usize, TaskResult>,
    submitted_at: Instant,
}

impl ClientJobEntry {
    pub fn new(job_uuid: &str, name: &str, task_count: usize, copies: Vec<String>) -> Self {
        Self {
            job_uuid: job_uuid.to_string(),
            name: name.to_string(),
            task_count,
            copies: copies.into_iter().map(|c| (c, HashSet::new())).collect(),
            results: BTreeMap::new(),
            submitted_at: Instant::now(),
        }
    }

    /// 加入某个队列作业的结果，返回作业是否已全部完成
    ///
    /// 同一位置先到先得，但已执行的结果会替换取消结果（广播作业的多个副本）。
    pub fn add_results(&mut self, queue_job_uuid: &str, results: Vec<TaskResult>) -> bool {
        let Some(received) = self.copies.get_mut(queue_job_uuid) else {
            warn!(
                "作业 {} 收到未知副本 {} 的结果，已忽略",
                self.job_uuid, queue_job_uuid
            );
            return self.is_complete();
        };

        for result in results {
            if result.position >= self.task_count {
                warn!(
                    "作业 {} 收到越界的任务位置 {}",
                    self.job_uuid, result.position
                );
                continue;
            }
            received.insert(result.position);
            match self.results.get(&result.position) {
                None => {
                    self.results.insert(result.position, result);
                }
                Some(existing)
                    if existing.state == TaskState::Cancelled
                        && result.state != TaskState::Cancelled =>
                {
                    self.results.insert(result.position, result);
                }
                Some(_) => {}
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.copies
            .values()
            .all(|received| received.len() == self.task_count)
    }

    pub fn received(&self) -> usize {
        self.results.len()
    }

    /// 按位置排序的结果
    pub fn into_response(self) -> ClientResponse {
        let results: Vec<TaskResult> = self.results.into_values().collect();
        debug!(
            "作业 {} ({}) 完成，耗时 {:?}",
            self.job_uuid,
            self.name,
            self.submitted_at.elapsed()
        );
        ClientResponse {
            header: ResultHeader {
                request_type: RequestType::Execution,
                uuid: self.job_uuid,
                task_count: results.len(),
                error: None,
            },
            results,
        }
    }
}

/// 一个客户端连接的全部作业状态
pub struct ClientChannelContext {
    driver: Arc<DriverContext>,
    uuid: String,
    entries: HashMap<String, ClientJobEntry>,
}

impl ClientChannelContext {
    pub fn new(driver: Arc<DriverContext>, uuid: impl Into<String>) -> Self {
        Self {
            driver,
            uuid: uuid.into(),
            entries: HashMap::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn active_jobs(&self) -> usize {
        self.entries.len()
    }

    /// 接收一个作业提交
    ///
    /// 任务帧数量与包头不符是协议错误；其它失败以作业级错误响应返回。
    pub fn submit(
        &mut self,
        header: JobHeader,
        data_provider: Vec<u8>,
        tasks: Vec<Vec<u8>>,
    ) -> GridResult<Option<ClientResponse>> {
        if tasks.len() != header.task_count {
            return Err(GridError::protocol(format!(
                "作业 {} 声明 {} 个任务，实际收到 {} 个",
                header.uuid,
                header.task_count,
                tasks.len()
            )));
        }
        if self.entries.contains_key(&header.uuid) {
            return Ok(Some(ClientResponse::error(
                &header.uuid,
                format!("作业 {} 已在执行中", header.uuid),
            )));
        }
        if tasks.is_empty() {
            return Ok(Some(ClientResponse {
                header: ResultHeader {
                    request_type: RequestType::Execution,
                    uuid: header.uuid,
                    task_count: 0,
                    error: None,
                },
                results: Vec::new(),
            }));
        }

        let mut bundle = TaskBundle::new(&header.uuid, &header.name, tasks.len(), header.sla.clone());
        bundle.parameters = header.parameters.clone();
        let tasks = tasks
            .into_iter()
            .enumerate()
            .map(|(position, data)| ServerTask::new(position, data))
            .collect();
        let job = ServerJob::new(bundle, Some(self.uuid.clone()), data_provider, tasks);

        let jobs = if header.sla.broadcast {
            let targets: Vec<String> = self
                .driver
                .nodes
                .all()
                .into_iter()
                .filter(|node| {
                    header
                        .sla
                        .execution_policy
                        .as_ref()
                        .map_or(true, |p| p.accepts(&node.info.policy_properties()))
                })
                .map(|node| node.uuid().to_string())
                .collect();
            if targets.is_empty() {
                return Ok(Some(ClientResponse::error(
                    &header.uuid,
                    "没有可以执行广播作业的节点",
                )));
            }
            targets.iter().map(|node| job.broadcast_copy(node)).collect()
        } else {
            vec![job]
        };

        let copies = jobs.iter().map(|j| j.uuid().to_string()).collect::<Vec<_>>();
        info!(
            "客户端 {} 提交作业 {} ({}, 任务数: {}, 副本数: {})",
            self.uuid,
            header.uuid,
            header.name,
            header.task_count,
            copies.len()
        );
        self.entries.insert(
            header.uuid.clone(),
            ClientJobEntry::new(&header.uuid, &header.name, header.task_count, copies),
        );

        let mut queued: Vec<String> = Vec::with_capacity(jobs.len());
        for job in jobs {
            let job_uuid = job.uuid().to_string();
            if let Err(e) = self.driver.queue.add_bundle(job) {
                warn!("作业 {} 入队失败: {}", job_uuid, e);
                // 只撤回本次提交已入队的副本，同名的其他作业不受影响
                for copy in &queued {
                    self.driver.cancel_queued_job(copy);
                }
                self.entries.remove(&header.uuid);
                return Ok(Some(ClientResponse::error(&header.uuid, e.to_string())));
            }
            queued.push(job_uuid);
        }
        Ok(None)
    }

    /// 收到一批结果，作业完成时返回完整响应
    pub fn on_results(
        &mut self,
        queue_job_uuid: &str,
        client_job_uuid: &str,
        results: Vec<TaskResult>,
    ) -> Option<ClientResponse> {
        let entry = match self.entries.get_mut(client_job_uuid) {
            Some(entry) => entry,
            None => {
                debug!("作业 {} 已结束，忽略迟到的结果", client_job_uuid);
                return None;
            }
        };
        if !entry.add_results(queue_job_uuid, results) {
            return None;
        }
        self.entries
            .remove(client_job_uuid)
            .map(ClientJobEntry::into_response)
    }

    /// 取消本连接提交的作业
    pub fn cancel(&mut self, job_uuid: &str) -> bool {
        if !self.entries.contains_key(job_uuid) {
            return false;
        }
        self.driver.cancel_job(job_uuid)
    }

    /// 连接断开：取消要求随客户端取消的作业
    pub fn disconnect(&mut self) {
        for (job_uuid, cancel) in self.driver.queue.client_jobs(&self.uuid) {
            if cancel {
                self.driver.cancel_job(&job_uuid);
            } else {
                info!("客户端 {} 已断开，作业 {} 继续执行", self.uuid, job_uuid);
            }
        }
        self.entries.clear();
    }
}
