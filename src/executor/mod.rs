//! Parallel task executor
//!
//! A strict-FIFO queue feeding a bounded pool of worker threads, with a
//! concurrency cap distinct from the worker count, cooperative
//! cancellation, and an optional load-driven resize monitor. Workers never
//! die from a task: panics become `Failed` records.

pub mod balancer;

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::core::context::Context;
use crate::core::services::{retry_transient, Clock, Fetcher};
use crate::core::{MortarError, MortarResult};
use crate::hash::Hasher;

pub use balancer::{AdaptiveLoadBalancer, FixedLoadProbe, LoadProbe, SystemLoadMetrics};

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Download,
    Install,
    Extract,
    Verify,
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Cooperative cancellation flag shared between a task and its callers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The work a task performs. Long-running thunks should poll the token.
pub type TaskThunk = Box<dyn FnOnce(&CancelToken) -> MortarResult<()> + Send + 'static>;

/// A unit of work for the executor.
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub package: String,
    pub version: String,
    pub source_url: String,
    pub target_path: PathBuf,
    thunk: TaskThunk,
    cancel: CancelToken,
}

impl Task {
    pub fn new(kind: TaskKind, package: &str, version: &str, thunk: TaskThunk) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            package: package.to_string(),
            version: version.to_string(),
            source_url: String::new(),
            target_path: PathBuf::new(),
            thunk,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_source_url(mut self, url: &str) -> Self {
        self.source_url = url.to_string();
        self
    }

    pub fn with_target_path(mut self, path: PathBuf) -> Self {
        self.target_path = path;
        self
    }
}

/// Archived view of a task, kept in the completed-tasks table.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub package: String,
    pub version: String,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// How `shutdown` treats queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain the queue, then stop.
    Graceful,
    /// Cancel queued tasks; running tasks finish.
    Immediate,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    queue_cv: Condvar,
    /// Guards nothing by itself; paired with `done_cv` for completion waits.
    done_lock: Mutex<()>,
    done_cv: Condvar,
    records: RwLock<HashMap<String, TaskRecord>>,
    tokens: Mutex<HashMap<String, CancelToken>>,
    active: AtomicUsize,
    live_workers: AtomicUsize,
    pending_exits: AtomicUsize,
    stop: AtomicBool,
    accepting: AtomicBool,
    max_concurrent: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn update_record<F: FnOnce(&mut TaskRecord)>(&self, id: &str, f: F) {
        if let Some(record) = self.records.write().get_mut(id) {
            f(record);
        }
    }

    fn notify_done(&self) {
        // Empty critical section orders the record write before waiter
        // re-checks; see `wait`.
        drop(self.done_lock.lock());
        self.done_cv.notify_all();
    }

    fn finish(&self, id: &str, status: TaskStatus, error: Option<String>) {
        let now = self.clock.now();
        self.update_record(id, |r| {
            r.status = status;
            r.error_message = error;
            r.end_time = Some(now);
        });
        self.tokens.lock().remove(id);
        self.notify_done();
    }
}

/// Bounded worker pool with FIFO task dispatch.
pub struct ParallelExecutor {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
    monitor: Mutex<Option<std::thread::JoinHandle<()>>>,
    balancer: Arc<AdaptiveLoadBalancer>,
    probe: Arc<dyn LoadProbe>,
    max_workers: usize,
    adaptive: bool,
}

impl ParallelExecutor {
    pub fn new(ctx: &Context) -> Self {
        let cfg = &ctx.config.executor;
        let max_workers = cfg.worker_count();
        let balancer = Arc::new(AdaptiveLoadBalancer::new(
            1,
            max_workers,
            Duration::from_millis(cfg.adjustment_interval_ms),
            ctx.clock.clone(),
        ));
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                done_lock: Mutex::new(()),
                done_cv: Condvar::new(),
                records: RwLock::new(HashMap::new()),
                tokens: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                live_workers: AtomicUsize::new(0),
                pending_exits: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                max_concurrent: AtomicUsize::new(cfg.max_concurrent_tasks),
                clock: ctx.clock.clone(),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
            monitor: Mutex::new(None),
            balancer,
            probe: Arc::new(FixedLoadProbe::new(0.5)),
            max_workers,
            adaptive: cfg.adaptive,
        }
    }

    /// Replace the load probe before `start`.
    pub fn with_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Spawn the worker pool (and the monitor thread when adaptive sizing
    /// is enabled). Idempotent.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for _ in 0..self.max_workers {
            workers.push(spawn_worker(self.shared.clone()));
        }
        drop(workers);

        if self.adaptive {
            let shared = self.shared.clone();
            let workers = self.workers.clone();
            let balancer = self.balancer.clone();
            let probe = self.probe.clone();
            *self.monitor.lock() = Some(std::thread::spawn(move || {
                monitor_loop(shared, workers, balancer, probe);
            }));
        }
        tracing::debug!(workers = self.max_workers, "executor started");
    }

    pub fn is_running(&self) -> bool {
        self.shared.live_workers.load(Ordering::SeqCst) > 0
            && !self.shared.stop.load(Ordering::SeqCst)
    }

    /// Enqueue a task. Non-blocking; returns the task id.
    pub fn submit(&self, task: Task) -> MortarResult<String> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(MortarError::ShutdownInProgress);
        }
        let id = task.id.clone();
        let record = TaskRecord {
            id: id.clone(),
            kind: task.kind,
            package: task.package.clone(),
            version: task.version.clone(),
            status: TaskStatus::Pending,
            error_message: None,
            submit_time: self.shared.clock.now(),
            start_time: None,
            end_time: None,
        };
        self.shared.records.write().insert(id.clone(), record);
        self.shared
            .tokens
            .lock()
            .insert(id.clone(), task.cancel.clone());
        self.shared.queue.lock().push_back(task);
        self.shared.queue_cv.notify_one();
        Ok(id)
    }

    /// Cancel a task. A queued task is removed immediately and archived as
    /// `Cancelled` with no start time; for a running task the flag is
    /// advisory. Returns false for unknown or already-terminal ids.
    pub fn cancel(&self, task_id: &str) -> bool {
        let queued = {
            let mut queue = self.shared.queue.lock();
            queue
                .iter()
                .position(|t| t.id == task_id)
                .map(|pos| queue.remove(pos).expect("position is valid"))
        };
        if let Some(task) = queued {
            task.cancel.cancel();
            self.shared.finish(task_id, TaskStatus::Cancelled, None);
            return true;
        }

        let token = self.shared.tokens.lock().get(task_id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Block until the task reaches a terminal status.
    pub fn wait(&self, task_id: &str, timeout: Duration) -> MortarResult<TaskStatus> {
        if !self.shared.records.read().contains_key(task_id) {
            return Err(MortarError::UnknownTask(task_id.to_string()));
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.done_lock.lock();
        loop {
            if let Some(status) = self.status(task_id) {
                if status.is_terminal() {
                    return Ok(status);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MortarError::Timeout(format!("task {}", task_id)));
            }
            self.shared
                .done_cv
                .wait_for(&mut guard, deadline - now);
        }
    }

    /// Block until the queue is empty and no task is running.
    pub fn wait_all(&self, timeout: Duration) -> MortarResult<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.done_lock.lock();
        loop {
            let idle = self.shared.queue.lock().is_empty()
                && self.shared.active.load(Ordering::SeqCst) == 0;
            if idle {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MortarError::Timeout("executor drain".to_string()));
            }
            self.shared
                .done_cv
                .wait_for(&mut guard, deadline - now);
        }
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.shared.records.read().get(task_id).map(|r| r.status)
    }

    pub fn record(&self, task_id: &str) -> Option<TaskRecord> {
        self.shared.records.read().get(task_id).cloned()
    }

    /// All archived terminal tasks.
    pub fn completed_tasks(&self) -> Vec<TaskRecord> {
        self.shared
            .records
            .read()
            .values()
            .filter(|r| r.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn failed_tasks(&self) -> Vec<TaskRecord> {
        self.shared
            .records
            .read()
            .values()
            .filter(|r| r.status == TaskStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    pub fn set_max_concurrent_tasks(&self, cap: usize) {
        self.shared.max_concurrent.store(cap, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();
    }

    /// Stop the pool and join every worker. Graceful mode drains the
    /// queue first; immediate mode cancels everything still queued.
    pub fn shutdown(&self, mode: ShutdownMode) {
        self.shared.accepting.store(false, Ordering::SeqCst);

        if mode == ShutdownMode::Immediate {
            let drained: Vec<Task> = self.shared.queue.lock().drain(..).collect();
            for task in drained {
                task.cancel.cancel();
                self.shared.finish(&task.id, TaskStatus::Cancelled, None);
            }
        }

        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
        tracing::debug!("executor shut down");
    }
}

fn spawn_worker(shared: Arc<Shared>) -> std::thread::JoinHandle<()> {
    shared.live_workers.fetch_add(1, Ordering::SeqCst);
    std::thread::spawn(move || {
        worker_loop(&shared);
        shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    })
}

fn worker_loop(shared: &Shared) {
    loop {
        // Downward resizes are taken between tasks, never mid-task.
        if shared
            .pending_exits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return;
        }

        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.stop.load(Ordering::SeqCst) && queue.is_empty() {
                    return;
                }
                if shared.pending_exits.load(Ordering::SeqCst) > 0 {
                    break None;
                }
                if !queue.is_empty()
                    && shared.active.load(Ordering::SeqCst)
                        < shared.max_concurrent.load(Ordering::SeqCst)
                {
                    // Claim the concurrency slot under the queue lock so
                    // the cap cannot be overshot.
                    shared.active.fetch_add(1, Ordering::SeqCst);
                    break queue.pop_front();
                }
                shared
                    .queue_cv
                    .wait_for(&mut queue, Duration::from_millis(100));
            }
        };

        let Some(task) = task else {
            continue;
        };

        let id = task.id.clone();
        if task.cancel.is_cancelled() {
            // Cancelled while queued but popped before removal: terminal
            // without ever starting.
            shared.active.fetch_sub(1, Ordering::SeqCst);
            shared.finish(&id, TaskStatus::Cancelled, None);
            shared.queue_cv.notify_all();
            continue;
        }

        let start = shared.clock.now();
        shared.update_record(&id, |r| {
            r.status = TaskStatus::Running;
            r.start_time = Some(start);
        });

        let token = task.cancel.clone();
        let thunk = task.thunk;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| thunk(&token)));

        let (status, error) = match outcome {
            Ok(Ok(())) => (TaskStatus::Completed, None),
            Ok(Err(MortarError::Cancelled(_))) => (TaskStatus::Cancelled, None),
            Ok(Err(e)) => (TaskStatus::Failed, Some(e.to_string())),
            Err(panic) => (TaskStatus::Failed, Some(panic_message(panic))),
        };
        if status == TaskStatus::Failed {
            tracing::warn!(task = %id, error = ?error, "task failed");
        }

        shared.active.fetch_sub(1, Ordering::SeqCst);
        shared.finish(&id, status, error);
        // A slot freed; wake workers parked on the cap.
        shared.queue_cv.notify_all();
    }
}

fn monitor_loop(
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
    balancer: Arc<AdaptiveLoadBalancer>,
    probe: Arc<dyn LoadProbe>,
) {
    while !shared.stop.load(Ordering::SeqCst) {
        balancer.record_sample(probe.sample());

        if balancer.should_adjust() {
            let live = shared.live_workers.load(Ordering::SeqCst);
            let optimal = balancer.optimal_workers(live);
            if optimal > live {
                tracing::info!(from = live, to = optimal, "growing worker pool");
                let mut workers = workers.lock();
                for _ in live..optimal {
                    workers.push(spawn_worker(shared.clone()));
                }
                balancer.mark_adjusted();
            } else if optimal < live {
                tracing::info!(from = live, to = optimal, "shrinking worker pool");
                shared
                    .pending_exits
                    .fetch_add(live - optimal, Ordering::SeqCst);
                shared.queue_cv.notify_all();
                balancer.mark_adjusted();
            }
        }

        // Sleep in slices so shutdown is not delayed a full second.
        for _ in 0..10 {
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

/// Builds the standard download / install / verify tasks.
pub struct TaskFactory {
    fetcher: Arc<dyn Fetcher>,
    hasher: Arc<dyn Hasher>,
    retry_base: Duration,
}

impl TaskFactory {
    pub fn new(ctx: &Context) -> Self {
        Self {
            fetcher: ctx.fetcher.clone(),
            hasher: ctx.hasher.clone(),
            retry_base: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Fetch a package into `target_path`, retrying transient failures
    /// with exponential backoff (three attempts).
    pub fn download_task(
        &self,
        package: &str,
        version: &str,
        source_url: &str,
        target_path: PathBuf,
    ) -> Task {
        let fetcher = self.fetcher.clone();
        let url = source_url.to_string();
        let ver = version.to_string();
        let target = target_path.clone();
        let retry_base = self.retry_base;
        Task::new(
            TaskKind::Download,
            package,
            version,
            Box::new(move |token| {
                if token.is_cancelled() {
                    return Err(MortarError::Cancelled("download".to_string()));
                }
                retry_transient(3, retry_base, || {
                    fetcher.fetch(&url, &ver, &target).map_err(MortarError::from)
                })
            }),
        )
        .with_source_url(source_url)
        .with_target_path(target_path)
    }

    /// Copy a populated directory into place.
    pub fn install_task(
        &self,
        package: &str,
        version: &str,
        source_path: PathBuf,
        target_path: PathBuf,
    ) -> Task {
        let target = target_path.clone();
        Task::new(
            TaskKind::Install,
            package,
            version,
            Box::new(move |token| {
                if token.is_cancelled() {
                    return Err(MortarError::Cancelled("install".to_string()));
                }
                std::fs::create_dir_all(&target)?;
                let mut options = fs_extra::dir::CopyOptions::new();
                options.content_only = true;
                options.overwrite = true;
                fs_extra::dir::copy(&source_path, &target, &options)
                    .map_err(|e| MortarError::cache(e.to_string()))?;
                Ok(())
            }),
        )
        .with_target_path(target_path)
    }

    /// Confirm a directory hashes to the expected fingerprint.
    pub fn verify_task(
        &self,
        package: &str,
        version: &str,
        package_path: PathBuf,
        expected_hash: &str,
    ) -> Task {
        let hasher = self.hasher.clone();
        let expected = expected_hash.to_string();
        let path = package_path.clone();
        let pkg = package.to_string();
        Task::new(
            TaskKind::Verify,
            package,
            version,
            Box::new(move |_token| {
                let actual = hasher.sha256_directory(&path)?;
                if actual != expected {
                    return Err(MortarError::CorruptEntry {
                        key: pkg.clone(),
                        reason: format!("hash mismatch: expected {} got {}", expected, actual),
                    });
                }
                Ok(())
            }),
        )
        .with_target_path(package_path)
    }
}
