//! 节点端执行管理
//!
//! 每个收到的任务包登记为一个 [`JobProcessingEntry`]，键为
//! [`bundle_key`]。任务在独立的 [`ExecutionPool`] 上运行，与网络 I/O 解耦。
//!
//! 任务包在网络上传输期间（包头已到、任务帧未读完）先登记为
//! [`JobPendingEntry`]，这段时间内到达的取消请求记在待定项上，
//! 正式登记时合并到执行项，取消不会丢失。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use taskgrid_core::{
    models::{bundle_key, TaskBundle, TaskEnvelope, TaskResult},
    GridError, GridResult,
};

use crate::executor::{ExecutorRegistry, TaskContext, TaskExecutor};

/// 执行池：限制同时运行的任务数，运行期间可调整大小
pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    size: Mutex<usize>,
}

impl ExecutionPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size: Mutex::new(size),
        }
    }

    pub fn size(&self) -> usize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前空闲的执行槽位
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 调整池大小
    ///
    /// 缩小时，正在运行的任务不受影响，多出的槽位在任务结束后回收。
    pub fn set_pool_size(&self, size: usize) {
        let size = size.max(1);
        let mut current = self.size.lock().unwrap_or_else(|e| e.into_inner());
        if size > *current {
            self.semaphore.add_permits(size - *current);
        } else if size < *current {
            let shrink = (*current - size) as u32;
            match self.semaphore.clone().try_acquire_many_owned(shrink) {
                Ok(permits) => permits.forget(),
                Err(_) => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let semaphore = self.semaphore.clone();
                        handle.spawn(async move {
                            if let Ok(permits) = semaphore.acquire_many_owned(shrink).await {
                                permits.forget();
                            }
                        });
                    }
                    Err(_) => warn!("当前不在运行时内，执行池无法缩小到 {}", size),
                },
            }
        }
        info!("执行池大小: {} -> {}", *current, size);
        *current = size;
    }

    async fn acquire(&self) -> GridResult<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GridError::Internal("执行池已关闭".to_string()))
    }

    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// 随任务包到达的单个任务
#[derive(Debug, Clone)]
pub struct NodeTask {
    pub position: usize,
    pub data: Vec<u8>,
}

impl NodeTask {
    pub fn new(position: usize, data: Vec<u8>) -> Self {
        Self { position, data }
    }
}

/// 可取消的任务执行单元
struct TaskWrapper {
    index: usize,
    context: TaskContext,
    executor: Result<Arc<dyn TaskExecutor>, String>,
    timeout: Option<Duration>,
    interruptible: bool,
    started: AtomicBool,
    ended: AtomicBool,
    future: Mutex<Option<AbortHandle>>,
    timeout_action: Mutex<Option<AbortHandle>>,
}

impl TaskWrapper {
    fn prepare(
        index: usize,
        bundle: &TaskBundle,
        task: NodeTask,
        data_provider: &Arc<Vec<u8>>,
        registry: &ExecutorRegistry,
    ) -> Self {
        let (kind, body, timeout, interruptible, executor) = match TaskEnvelope::from_bytes(&task.data) {
            Ok(envelope) => {
                let executor = registry.get(&envelope.kind).map_err(|e| e.to_string());
                (
                    envelope.kind,
                    envelope.body,
                    envelope.timeout_ms.map(Duration::from_millis),
                    envelope.interruptible,
                    executor,
                )
            }
            Err(e) => (String::new(), task.data, None, true, Err(e.to_string())),
        };
        Self {
            index,
            context: TaskContext {
                job_uuid: bundle.job_uuid.clone(),
                bundle_id: bundle.bundle_id,
                position: task.position,
                kind,
                body,
                data_provider: data_provider.clone(),
            },
            executor,
            timeout,
            interruptible,
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            future: Mutex::new(None),
            timeout_action: Mutex::new(None),
        }
    }

    fn position(&self) -> usize {
        self.context.position
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// 抢占结束权，只有第一次调用返回 `true`
    fn claim(&self) -> bool {
        !self.ended.swap(true, Ordering::AcqRel)
    }

    fn abort_future(&self) {
        if let Some(handle) = self.future.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    fn cancel_timeout(&self) {
        if let Some(handle) = self
            .timeout_action
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// 一个正在执行的任务包
pub struct JobProcessingEntry {
    key: String,
    bundle: Mutex<TaskBundle>,
    tasks: Vec<Arc<TaskWrapper>>,
    results: Mutex<Vec<Option<TaskResult>>>,
    submitted_count: usize,
    result_count: AtomicUsize,
    cancelled: AtomicBool,
    throwable: Mutex<Option<String>>,
    accumulated_nanos: AtomicU64,
    started_at: Instant,
}

impl JobProcessingEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn job_uuid(&self) -> String {
        self.bundle.lock().unwrap_or_else(|e| e.into_inner()).job_uuid.clone()
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted_count
    }

    pub fn result_count(&self) -> usize {
        self.result_count.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn set_throwable(&self, message: String) {
        let mut throwable = self.throwable.lock().unwrap_or_else(|e| e.into_inner());
        if throwable.is_none() {
            *throwable = Some(message);
        }
    }
}

/// 尚未正式登记的任务包上记录的取消请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPendingEntry {
    pub key: String,
    pub job_uuid: String,
    pub cancelled: bool,
    pub call_on_cancel: bool,
    pub requeue: bool,
}

impl JobPendingEntry {
    fn new(bundle: &TaskBundle) -> Self {
        Self {
            key: bundle.key(),
            job_uuid: bundle.job_uuid.clone(),
            cancelled: false,
            call_on_cancel: false,
            requeue: false,
        }
    }

    fn cancel(&mut self, call_on_cancel: bool, requeue: bool) {
        self.cancelled = true;
        self.call_on_cancel |= call_on_cancel;
        self.requeue |= requeue;
    }
}

/// 任务包执行完毕的监听者
pub trait ExecutionManagerListener: Send + Sync {
    /// `results` 与收到的任务顺序一致；`throwable` 是包级别的致命错误
    fn bundle_executed(&self, bundle: &TaskBundle, results: &[TaskResult], throwable: Option<&str>);
}

#[derive(Default)]
struct EntryTables {
    job_entries: HashMap<String, Arc<JobProcessingEntry>>,
    pending_entries: HashMap<String, JobPendingEntry>,
}

/// 节点执行管理器
pub struct ExecutionManager {
    registry: Arc<ExecutorRegistry>,
    pool: ExecutionPool,
    tables: Mutex<EntryTables>,
    listeners: Mutex<Vec<(u64, Arc<dyn ExecutionManagerListener>)>>,
    next_listener_id: AtomicU64,
    tasks_executed: AtomicU64,
    execution_nanos: AtomicU64,
}

impl ExecutionManager {
    pub fn new(registry: Arc<ExecutorRegistry>, processing_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pool: ExecutionPool::new(processing_threads),
            tables: Mutex::new(EntryTables::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            tasks_executed: AtomicU64::new(0),
            execution_nanos: AtomicU64::new(0),
        })
    }

    fn tables(&self) -> MutexGuard<'_, EntryTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn set_pool_size(&self, size: usize) {
        self.pool.set_pool_size(size);
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutionManagerListener>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// 任务包头已到达，任务尚未读完
    pub fn add_pending_entry(&self, bundle: &TaskBundle) {
        let entry = JobPendingEntry::new(bundle);
        debug!("登记待定任务包: {}", entry.key);
        self.tables()
            .pending_entries
            .entry(entry.key.clone())
            .or_insert(entry);
    }

    pub fn pending_entry(&self, key: &str) -> Option<JobPendingEntry> {
        self.tables().pending_entries.get(key).cloned()
    }

    /// 任务包未能完整读取时移除其待定项
    pub fn remove_pending_entry(&self, key: &str) -> Option<JobPendingEntry> {
        self.tables().pending_entries.remove(key)
    }

    /// 登记并执行一个任务包
    ///
    /// 登记时合并待定项上的取消请求；已被取消的包不再启动任何任务，
    /// 所有任务直接以取消状态结束。
    pub fn execute(
        self: &Arc<Self>,
        bundle: TaskBundle,
        data_provider: Arc<Vec<u8>>,
        tasks: Vec<NodeTask>,
    ) -> GridResult<Arc<JobProcessingEntry>> {
        let key = bundle.key();
        let wrappers: Vec<Arc<TaskWrapper>> = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| {
                Arc::new(TaskWrapper::prepare(
                    index,
                    &bundle,
                    task,
                    &data_provider,
                    &self.registry,
                ))
            })
            .collect();

        let entry = Arc::new(JobProcessingEntry {
            key: key.clone(),
            submitted_count: wrappers.len(),
            results: Mutex::new(vec![None; wrappers.len()]),
            tasks: wrappers,
            bundle: Mutex::new(bundle),
            result_count: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            throwable: Mutex::new(None),
            accumulated_nanos: AtomicU64::new(0),
            started_at: Instant::now(),
        });

        let pending = {
            let mut tables = self.tables();
            if tables.job_entries.contains_key(&key) {
                return Err(GridError::protocol(format!("任务包 {key} 已在执行")));
            }
            tables.job_entries.insert(key.clone(), entry.clone());
            tables.pending_entries.remove(&key)
        };
        debug!("登记任务包 {}，任务数: {}", key, entry.submitted_count);

        if entry.submitted_count == 0 {
            self.job_ended(&entry);
            return Ok(entry);
        }

        if let Some(pending) = pending.filter(|p| p.cancelled) {
            info!("任务包 {} 在登记前已被取消", key);
            self.cancel_entry(&entry, pending.call_on_cancel, pending.requeue);
            return Ok(entry);
        }

        for wrapper in &entry.tasks {
            self.spawn_task(&entry, wrapper);
        }
        Ok(entry)
    }

    fn spawn_task(self: &Arc<Self>, entry: &Arc<JobProcessingEntry>, wrapper: &Arc<TaskWrapper>) {
        if wrapper.is_ended() {
            return;
        }
        let executor = match &wrapper.executor {
            Ok(executor) => executor.clone(),
            Err(message) => {
                warn!("任务 {}#{} 无法执行: {}", entry.key, wrapper.position(), message);
                let result = TaskResult::failure(wrapper.position(), message.clone(), 0);
                self.task_ended(entry, wrapper, result);
                return;
            }
        };

        let manager = Arc::clone(self);
        let task_entry = Arc::clone(entry);
        let task = Arc::clone(wrapper);
        let handle = tokio::spawn(async move {
            let _permit = match manager.pool.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    task_entry.set_throwable(e.to_string());
                    let result = TaskResult::failure(task.position(), e.to_string(), 0);
                    manager.task_ended(&task_entry, &task, result);
                    return;
                }
            };
            if task.is_ended() {
                return;
            }
            task.started.store(true, Ordering::Release);
            manager.schedule_timeout(&task_entry, &task, &executor);

            let start = Instant::now();
            let outcome = AssertUnwindSafe(executor.execute(&task.context))
                .catch_unwind()
                .await;
            let nanos = start.elapsed().as_nanos() as u64;
            let result = match outcome {
                Ok(Ok(output)) => TaskResult::success(task.position(), output, nanos),
                Ok(Err(e)) => TaskResult::failure(task.position(), e.to_string(), nanos),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("任务 {}#{} panic: {}", task_entry.key, task.position(), message);
                    TaskResult::failure(task.position(), format!("任务执行panic: {message}"), nanos)
                }
            };
            manager.task_ended(&task_entry, &task, result);
        });

        *wrapper.future.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.abort_handle());
        if wrapper.is_ended() && wrapper.interruptible {
            wrapper.abort_future();
        }
    }

    fn schedule_timeout(
        self: &Arc<Self>,
        entry: &Arc<JobProcessingEntry>,
        wrapper: &Arc<TaskWrapper>,
        executor: &Arc<dyn TaskExecutor>,
    ) {
        let Some(timeout) = wrapper.timeout else {
            return;
        };
        let manager = Arc::clone(self);
        let entry = Arc::clone(entry);
        let task = Arc::clone(wrapper);
        let executor = Arc::clone(executor);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !task.claim() {
                return;
            }
            warn!("任务 {}#{} 执行超时 ({:?})", entry.key, task.position(), timeout);
            task.abort_future();
            executor.on_timeout(&task.context);
            let result = TaskResult::failure(
                task.position(),
                GridError::ExecutionTimeout.to_string(),
                timeout.as_nanos() as u64,
            );
            manager.record_result(&entry, &task, result);
        });
        *wrapper
            .timeout_action
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle.abort_handle());
    }

    /// 任务结束，每个任务只计一次；返回本次调用是否生效
    fn task_ended(&self, entry: &Arc<JobProcessingEntry>, wrapper: &TaskWrapper, result: TaskResult) -> bool {
        if !wrapper.claim() {
            return false;
        }
        self.record_result(entry, wrapper, result);
        true
    }

    fn record_result(&self, entry: &Arc<JobProcessingEntry>, wrapper: &TaskWrapper, result: TaskResult) {
        wrapper.cancel_timeout();
        entry
            .accumulated_nanos
            .fetch_add(result.elapsed_nanos, Ordering::Relaxed);
        entry.results.lock().unwrap_or_else(|e| e.into_inner())[wrapper.index] = Some(result);

        let count = entry.result_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == entry.submitted_count {
            self.job_ended(entry);
        }
    }

    fn job_ended(&self, entry: &Arc<JobProcessingEntry>) {
        {
            let mut tables = self.tables();
            if tables
                .job_entries
                .get(&entry.key)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                tables.job_entries.remove(&entry.key);
            }
        }

        let throwable = entry.throwable.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut bundle = entry.bundle.lock().unwrap_or_else(|e| e.into_inner()).clone();
        bundle.node_execution_nanos = entry.started_at.elapsed().as_nanos() as u64;
        bundle.throwable = throwable.clone();

        let results: Vec<TaskResult> = entry
            .results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flatten()
            .cloned()
            .collect();

        self.tasks_executed
            .fetch_add(results.len() as u64, Ordering::Relaxed);
        self.execution_nanos.fetch_add(
            entry.accumulated_nanos.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        debug!(
            "任务包 {} 执行完毕，结果数: {}，耗时: {}ns",
            entry.key,
            results.len(),
            bundle.node_execution_nanos
        );

        let listeners: Vec<Arc<dyn ExecutionManagerListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.bundle_executed(&bundle, &results, throwable.as_deref());
        }
    }

    fn cancel_entry(&self, entry: &Arc<JobProcessingEntry>, call_on_cancel: bool, requeue: bool) {
        entry.cancelled.store(true, Ordering::Release);
        if requeue {
            entry
                .bundle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .mark_requeue();
        }

        for wrapper in &entry.tasks {
            if wrapper.is_ended() {
                continue;
            }
            if !wrapper.interruptible && wrapper.started.load(Ordering::Acquire) {
                debug!("任务 {}#{} 不可中断，等待其自然结束", entry.key, wrapper.position());
                continue;
            }
            if !wrapper.claim() {
                continue;
            }
            wrapper.abort_future();
            if call_on_cancel {
                if let Ok(executor) = &wrapper.executor {
                    executor.on_cancel(&wrapper.context);
                }
            }
            self.record_result(entry, wrapper, TaskResult::cancelled(wrapper.position()));
        }
    }

    /// 取消作业在本节点上的所有任务包，返回受影响的包数（含待定包）
    pub fn cancel_job(&self, job_uuid: &str, call_on_cancel: bool, requeue: bool) -> usize {
        let (entries, pending) = {
            let mut tables = self.tables();
            let mut pending = 0;
            for entry in tables.pending_entries.values_mut() {
                if entry.job_uuid == job_uuid {
                    entry.cancel(call_on_cancel, requeue);
                    pending += 1;
                }
            }
            let entries: Vec<Arc<JobProcessingEntry>> = tables
                .job_entries
                .values()
                .filter(|entry| entry.job_uuid() == job_uuid)
                .cloned()
                .collect();
            (entries, pending)
        };

        if entries.is_empty() && pending == 0 {
            debug!("作业 {} 在本节点上没有任务包", job_uuid);
            return 0;
        }
        info!(
            "取消作业 {}: 执行中任务包 {} 个，待定 {} 个 (requeue: {})",
            job_uuid,
            entries.len(),
            pending,
            requeue
        );
        for entry in &entries {
            self.cancel_entry(entry, call_on_cancel, requeue);
        }
        entries.len() + pending
    }

    /// 取消所有任务包，用于关闭节点或断开连接
    ///
    /// 待定项对应的任务包不会再到达，直接丢弃。
    pub fn cancel_all_tasks(&self, call_on_cancel: bool, requeue: bool) {
        let (entries, dropped) = {
            let mut tables = self.tables();
            let dropped = tables.pending_entries.len();
            tables.pending_entries.clear();
            let entries: Vec<Arc<JobProcessingEntry>> = tables.job_entries.values().cloned().collect();
            (entries, dropped)
        };
        if dropped > 0 {
            debug!("丢弃 {} 个待定任务包", dropped);
        }
        if !entries.is_empty() {
            info!("取消全部 {} 个任务包 (requeue: {})", entries.len(), requeue);
        }
        for entry in &entries {
            self.cancel_entry(entry, call_on_cancel, requeue);
        }
    }

    /// 作业在本节点上仍在执行的任务包数
    pub fn nb_bundles(&self, job_uuid: &str) -> usize {
        self.tables()
            .job_entries
            .values()
            .filter(|entry| entry.job_uuid() == job_uuid)
            .count()
    }

    pub fn entry(&self, job_uuid: &str, bundle_id: u64) -> Option<Arc<JobProcessingEntry>> {
        self.tables()
            .job_entries
            .get(&bundle_key(job_uuid, bundle_id))
            .cloned()
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    /// 所有已结束任务的累计执行时间
    pub fn total_execution_time(&self) -> Duration {
        Duration::from_nanos(self.execution_nanos.load(Ordering::Relaxed))
    }

    /// 关闭执行池并取消所有任务
    pub fn shutdown(&self) {
        info!("关闭执行管理器");
        self.pool.close();
        self.cancel_all_tasks(true, false);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知错误".to_string()
    }
}
