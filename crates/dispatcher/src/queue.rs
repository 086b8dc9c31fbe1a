//! 作业队列
//!
//! 所有状态由一把互斥锁保护。`next_bundle` 从不阻塞：没有可分发的作业时直接返回
//! `None`，调用方通过 [`JobQueue::notifier`] 等待新作业。

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use taskgrid_core::{
    labels,
    models::{TaskResult, TaskState},
    GridError, GridResult, GridStatistics,
};

use crate::job::{CancelledJob, JobSummary, NodeBundle, RequeueOutcome, RequeueReason, ServerJob};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, ServerJob>,
    /// 只包含仍有待分发任务的作业；优先级降序，同优先级内先进先出
    priority_map: BTreeMap<Reverse<i32>, VecDeque<String>>,
    closed: bool,
}

impl QueueState {
    fn enqueue(&mut self, uuid: &str, priority: i32) {
        let list = self.priority_map.entry(Reverse(priority)).or_default();
        if !list.iter().any(|u| u == uuid) {
            list.push_back(uuid.to_string());
        }
    }

    fn dequeue(&mut self, uuid: &str, priority: i32) {
        if let Some(list) = self.priority_map.get_mut(&Reverse(priority)) {
            list.retain(|u| u != uuid);
            if list.is_empty() {
                self.priority_map.remove(&Reverse(priority));
            }
        }
    }

    /// 作业结束时移除，返回其在 Driver 中停留的毫秒数
    fn remove_if_finished(&mut self, uuid: &str) -> Option<f64> {
        let finished = self.jobs.get(uuid).is_some_and(|job| job.is_finished());
        if !finished {
            return None;
        }
        let job = self.jobs.remove(uuid)?;
        self.dequeue(uuid, job.priority());
        Some(job.queued_instant.elapsed().as_secs_f64() * 1000.0)
    }

    fn cancel_locked(&mut self, uuid: &str) -> Option<(CancelledJob, Option<f64>)> {
        let job = self.jobs.get_mut(uuid)?;
        if job.cancelled {
            return None;
        }
        job.cancelled = true;
        let removed: Vec<TaskResult> = job
            .pending
            .drain(..)
            .map(|t| TaskResult::cancelled(t.position))
            .collect();
        let cancelled = CancelledJob {
            job_uuid: uuid.to_string(),
            client_uuid: job.client_uuid.clone(),
            client_job_uuid: job.client_job_uuid.clone(),
            removed,
            in_flight: job.dispatched_channels > 0,
        };
        let priority = job.priority();
        self.dequeue(uuid, priority);
        let finished = self.remove_if_finished(uuid);
        Some((cancelled, finished))
    }
}

/// 优先级作业队列
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    statistics: Arc<GridStatistics>,
}

impl JobQueue {
    pub fn new(statistics: Arc<GridStatistics>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            statistics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 队列变化（新作业、重排队、恢复、通道释放）时触发
    pub fn notifier(&self) -> &Notify {
        &self.notify
    }

    /// 加入作业并唤醒等待中的分发者
    pub fn add_bundle(&self, mut job: ServerJob) -> GridResult<()> {
        let task_count = job.pending_count();
        if task_count == 0 {
            warn!("作业 {} 没有任务，忽略", job.uuid());
            return Ok(());
        }
        job.expires_at = job
            .header
            .sla
            .expiration
            .as_ref()
            .map(|e| e.resolve(job.queued_at));
        job.pending.sort_by_key(|t| t.position);

        {
            let mut state = self.lock();
            if state.closed {
                return Err(GridError::Internal("作业队列已关闭".to_string()));
            }
            if state.jobs.contains_key(job.uuid()) {
                return Err(GridError::Internal(format!("作业 {} 已在队列中", job.uuid())));
            }
            let uuid = job.uuid().to_string();
            let priority = job.priority();
            debug!(
                "作业入队: {} (任务数: {}, 优先级: {})",
                uuid, task_count, priority
            );
            state.jobs.insert(uuid.clone(), job);
            state.enqueue(&uuid, priority);
        }

        self.statistics
            .add_value(labels::TASK_QUEUE_TOTAL, task_count as f64);
        self.statistics
            .add_value(labels::TASK_QUEUE_COUNT, task_count as f64);
        self.statistics.add_value(labels::JOB_TOTAL, 1.0);
        self.statistics.add_value(labels::JOB_COUNT, 1.0);
        self.notify.notify_waiters();
        Ok(())
    }

    /// 取出下一个可分发给指定节点的任务包，不阻塞
    ///
    /// 选择优先级最高的合格作业，切出 `min(size, 待分发数)` 个任务。
    /// 有剩余时作业保留原优先级和入队时间，移到同优先级列表末尾。
    pub fn next_bundle(
        &self,
        node_uuid: &str,
        node_properties: &HashMap<String, String>,
        size: usize,
    ) -> Option<NodeBundle> {
        let size = size.max(1);
        let now = Utc::now();

        let (bundle, wait_ms) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.closed {
                return None;
            }

            let selected = state.priority_map.iter().find_map(|(priority, list)| {
                list.iter()
                    .position(|uuid| {
                        state
                            .jobs
                            .get(uuid)
                            .is_some_and(|job| is_eligible(job, node_uuid, node_properties, now))
                    })
                    .map(|idx| (*priority, idx))
            })?;

            let (priority, idx) = selected;
            let list = state.priority_map.get_mut(&priority)?;
            let uuid = list.remove(idx)?;
            let job = state.jobs.get_mut(&uuid)?;

            let count = size.min(job.pending.len());
            let tasks: Vec<_> = job
                .pending
                .drain(..count)
                .map(|mut t| {
                    t.state = TaskState::Executing;
                    t
                })
                .collect();
            let bundle_id = job.next_bundle_id;
            job.next_bundle_id += 1;
            job.dispatched_channels += 1;

            let bundle = NodeBundle {
                header: job.header.for_dispatch(bundle_id, tasks.len()),
                tasks,
                data_provider: job.data_provider.clone(),
                client_uuid: job.client_uuid.clone(),
                client_job_uuid: job.client_job_uuid.clone(),
            };
            let wait_ms = job.queued_instant.elapsed().as_secs_f64() * 1000.0;

            if !job.pending.is_empty() {
                list.push_back(uuid);
            }
            if list.is_empty() {
                state.priority_map.remove(&priority);
            }
            (bundle, wait_ms)
        };

        let count = bundle.tasks.len() as u64;
        debug!(
            "分发任务包 {} 给节点 {} (任务数: {})",
            bundle.header.key(),
            node_uuid,
            count
        );
        self.statistics
            .add_value(labels::TASK_QUEUE_COUNT, -(count as f64));
        self.statistics
            .add_values(labels::TASK_QUEUE_TIME, wait_ms * count as f64, count);
        self.statistics
            .add_value(labels::TASK_DISPATCH, count as f64);
        Some(bundle)
    }

    /// 节点完整返回了一个包的结果，释放其占用的通道
    ///
    /// 返回作业是否因此结束。
    pub fn complete_bundle(&self, job_uuid: &str) -> bool {
        let (finished, has_pending) = {
            let mut state = self.lock();
            let has_pending = match state.jobs.get_mut(job_uuid) {
                Some(job) => {
                    job.dispatched_channels = job.dispatched_channels.saturating_sub(1);
                    !job.pending.is_empty()
                }
                None => return false,
            };
            (state.remove_if_finished(job_uuid), has_pending)
        };

        if has_pending {
            self.notify.notify_waiters();
        }
        self.record_finished(job_uuid, finished)
    }

    /// 将包中的任务退回作业，位置不变
    ///
    /// 作业已取消时任务被丢弃；按 `reason` 与 SLA 计数重提交次数，超过上限的任务
    /// 以错误结果返回。
    pub fn requeue(&self, bundle: NodeBundle, reason: RequeueReason) -> RequeueOutcome {
        let job_uuid = bundle.job_uuid().to_string();
        let mut outcome = RequeueOutcome {
            client_uuid: bundle.client_uuid.clone(),
            client_job_uuid: bundle.client_job_uuid.clone(),
            ..Default::default()
        };

        let finished = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.jobs.get_mut(&job_uuid) {
                None => {
                    outcome.discarded = cancelled_results(&bundle);
                    None
                }
                Some(job) => {
                    job.dispatched_channels = job.dispatched_channels.saturating_sub(1);
                    if job.cancelled {
                        outcome.discarded = cancelled_results(&bundle);
                    } else {
                        let max = job.header.sla.max_task_resubmits;
                        let counted = match reason {
                            RequeueReason::NodeError => {
                                job.header.sla.apply_max_resubmits_upon_node_error
                            }
                            RequeueReason::BundleFailure => true,
                            RequeueReason::NodeRequest => false,
                        };
                        for mut task in bundle.tasks {
                            if counted {
                                if task.resubmit_count >= max {
                                    outcome.exhausted.push(TaskResult::failure(
                                        task.position,
                                        format!("任务超过最大重提交次数 {max}"),
                                        0,
                                    ));
                                    continue;
                                }
                                task.resubmit();
                            } else {
                                task.state = TaskState::Pending;
                                task.result = None;
                            }
                            job.pending.push(task);
                            outcome.requeued += 1;
                        }
                        job.pending.sort_by_key(|t| t.position);
                        if !job.pending.is_empty() {
                            let priority = job.priority();
                            state.enqueue(&job_uuid, priority);
                        }
                    }
                    state.remove_if_finished(&job_uuid)
                }
            }
        };

        if outcome.requeued > 0 {
            info!(
                "任务包重新排队: 作业 {} 的 {} 个任务 ({:?})",
                job_uuid, outcome.requeued, reason
            );
            self.statistics
                .add_value(labels::TASK_QUEUE_COUNT, outcome.requeued as f64);
            self.notify.notify_waiters();
        }
        self.record_finished(&job_uuid, finished);
        outcome
    }

    /// 取消作业：移除待分发任务，并阻止在途包重新排队
    ///
    /// 作业不存在或已取消时返回 `None`，重复取消没有额外效果。
    pub fn cancel_job(&self, job_uuid: &str) -> Option<CancelledJob> {
        let (cancelled, finished) = self.lock().cancel_locked(job_uuid)?;
        info!(
            "作业已取消: {} (移除 {} 个待分发任务)",
            job_uuid,
            cancelled.removed.len()
        );
        self.statistics
            .add_value(labels::TASK_QUEUE_COUNT, -(cancelled.removed.len() as f64));
        self.record_finished(job_uuid, finished);
        Some(cancelled)
    }

    pub fn set_suspended(&self, job_uuid: &str, suspended: bool) -> GridResult<()> {
        {
            let mut state = self.lock();
            let job = state
                .jobs
                .get_mut(job_uuid)
                .ok_or_else(|| GridError::job_not_found(job_uuid))?;
            job.header.sla.suspended = suspended;
        }
        info!(
            "作业 {} {}",
            job_uuid,
            if suspended { "已挂起" } else { "已恢复" }
        );
        if !suspended {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    pub fn update_priority(&self, job_uuid: &str, priority: i32) -> GridResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(job_uuid)
            .ok_or_else(|| GridError::job_not_found(job_uuid))?;
        let old = job.header.sla.priority;
        if old == priority {
            return Ok(());
        }
        job.header.sla.priority = priority;
        let queued = !job.pending.is_empty() && !job.cancelled;
        state.dequeue(job_uuid, old);
        if queued {
            state.enqueue(job_uuid, priority);
        }
        debug!("作业 {} 优先级: {} -> {}", job_uuid, old, priority);
        Ok(())
    }

    /// 取消所有在 `now` 之前过期的作业
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Vec<CancelledJob> {
        let expired: Vec<String> = self
            .lock()
            .jobs
            .values()
            .filter(|job| !job.cancelled && job.expires_at.is_some_and(|at| at <= now))
            .map(|job| job.uuid().to_string())
            .collect();

        expired
            .iter()
            .filter_map(|uuid| {
                info!("作业已过期: {}", uuid);
                self.cancel_job(uuid)
            })
            .collect()
    }

    /// 取消固定在某个节点上的广播副本
    pub fn remove_pinned(&self, node_uuid: &str) -> Vec<CancelledJob> {
        let pinned: Vec<String> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.pinned_node.as_deref() == Some(node_uuid))
            .map(|job| job.uuid().to_string())
            .collect();
        pinned
            .iter()
            .filter_map(|uuid| self.cancel_job(uuid))
            .collect()
    }

    /// 某个客户端提交的、尚未结束的作业：`(作业UUID, 断开时是否取消)`
    pub fn client_jobs(&self, client_uuid: &str) -> Vec<(String, bool)> {
        self.lock()
            .jobs
            .values()
            .filter(|job| !job.cancelled && job.client_uuid.as_deref() == Some(client_uuid))
            .map(|job| {
                (
                    job.uuid().to_string(),
                    job.header.sla.cancel_upon_client_disconnect,
                )
            })
            .collect()
    }

    /// 客户端视角的作业 UUID 对应的所有队列作业（包括广播副本）
    pub fn jobs_for_client_job(&self, client_job_uuid: &str) -> Vec<String> {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.client_job_uuid == client_job_uuid)
            .map(|job| job.uuid().to_string())
            .collect()
    }

    pub fn job(&self, job_uuid: &str) -> Option<JobSummary> {
        self.lock().jobs.get(job_uuid).map(JobSummary::from)
    }

    pub fn all_job_ids(&self) -> Vec<String> {
        self.lock().jobs.keys().cloned().collect()
    }

    /// 待分发的任务总数
    pub fn size(&self) -> usize {
        self.lock().jobs.values().map(|j| j.pending_count()).sum()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 关闭队列：不再接收作业，也不再分发
    pub fn close(&self) {
        self.lock().closed = true;
        info!("作业队列已关闭");
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn record_finished(&self, job_uuid: &str, elapsed_ms: Option<f64>) -> bool {
        match elapsed_ms {
            Some(ms) => {
                debug!("作业结束: {} (耗时 {:.1}ms)", job_uuid, ms);
                self.statistics.add_value(labels::JOB_COUNT, -1.0);
                self.statistics.add_value(labels::JOB_TIME, ms);
                true
            }
            None => false,
        }
    }
}

fn is_eligible(
    job: &ServerJob,
    node_uuid: &str,
    node_properties: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> bool {
    let sla = &job.header.sla;
    !job.cancelled
        && !sla.suspended
        && !job.pending.is_empty()
        && job.dispatched_channels < sla.max_channels.max(1)
        && job.expires_at.map_or(true, |at| at > now)
        && job.pinned_node.as_deref().map_or(true, |n| n == node_uuid)
        && sla
            .execution_policy
            .as_ref()
            .map_or(true, |p| p.accepts(node_properties))
}

fn cancelled_results(bundle: &NodeBundle) -> Vec<TaskResult> {
    bundle
        .tasks
        .iter()
        .map(|t| TaskResult::cancelled(t.position))
        .collect()
}
