// AgentWorkerPool: dispatcher + autoscaler + health monitor + retry policy +
// event bus, per spec.md 4.3. Owns the workers and the queue; `dispatch`,
// `health`, and `scale` each run as their own periodic background task
// against a single `Mutex<PoolState>`, mirroring the "single-writer actor
// per component" guidance in spec.md 5 — readers (`get_status`,
// `get_metrics`) just take a snapshot under the same lock rather than
// reaching into a running worker.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::{PoolConfig, ResourceLimits};
use crate::error::PoolError;
use crate::events::{EventBus, PoolEvent, PoolStatus, ScaleDirection};
use crate::metrics::{PoolMetrics, WorkerMetrics};
use crate::queue::{CompletedTask, TaskQueue};
use crate::task::{AgentTask, TaskErrorKind, TaskId, TaskResult, TaskSpec, TaskStatus};
use crate::worker::{AgentWorker, IWorkerRunner, WorkerId, WorkerOutcome, WorkerStatus};

struct RunningTaskEntry {
    task: AgentTask,
    worker_id: WorkerId,
}

struct ScaleOperation {
    direction: ScaleDirection,
    count: usize,
    timestamp: Instant,
}

struct PoolState {
    status: PoolStatus,
    workers: HashMap<WorkerId, AgentWorker>,
    queue: TaskQueue,
    running_tasks: HashMap<TaskId, RunningTaskEntry>,
    task_assignments: HashMap<TaskId, TaskStatus>,
    task_durations: VecDeque<u64>,
    last_scale_operation: Option<ScaleOperation>,
    total_tasks_completed: u64,
    total_tasks_failed: u64,
    started_at: Option<DateTime<Utc>>,
}

impl PoolState {
    fn new() -> Self {
        Self {
            status: PoolStatus::Stopped,
            workers: HashMap::new(),
            queue: TaskQueue::new(),
            running_tasks: HashMap::new(),
            task_assignments: HashMap::new(),
            task_durations: VecDeque::new(),
            last_scale_operation: None,
            total_tasks_completed: 0,
            total_tasks_failed: 0,
            started_at: None,
        }
    }
}

/// Bound on `taskDurations`, per spec.md 3.4 / 9 ("Bounded histories").
const MAX_TASK_DURATIONS: usize = 100;

/// Time-prune window for the completion ledger, per spec.md 9 ("completion
/// ledger capped and time-pruned"). Swept on every health tick.
const COMPLETED_TASK_RETENTION: Duration = Duration::from_secs(3600);

/// Read-only copy of a worker's state for introspection, since callers
/// cannot hold a reference into the pool's locked state.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pid: u32,
    pub status: WorkerStatus,
    pub current_task_id: Option<TaskId>,
    pub metrics: WorkerMetrics,
    pub uptime_ms: u64,
    pub idle_ms: u64,
}

impl From<&AgentWorker> for WorkerSnapshot {
    fn from(w: &AgentWorker) -> Self {
        Self {
            id: w.id.clone(),
            pid: w.pid,
            status: w.status,
            current_task_id: w.current_task.as_ref().map(|t| t.id.clone()),
            metrics: w.metrics,
            uptime_ms: w.uptime().as_millis() as u64,
            idle_ms: w.idle_for().as_millis() as u64,
        }
    }
}

pub struct AgentWorkerPool {
    config: PoolConfig,
    resource_limits: ResourceLimits,
    base_dir: PathBuf,
    runner: Arc<dyn IWorkerRunner>,
    events: EventBus,
    state: Mutex<PoolState>,
    tick_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    next_worker_seq: AtomicUsize,
}

impl AgentWorkerPool {
    pub fn new(
        config: PoolConfig,
        resource_limits: ResourceLimits,
        base_dir: PathBuf,
        runner: Arc<dyn IWorkerRunner>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            resource_limits,
            base_dir,
            runner,
            events: EventBus::new(),
            state: Mutex::new(PoolState::new()),
            tick_handles: std::sync::Mutex::new(Vec::new()),
            next_worker_seq: AtomicUsize::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Spawns `initialWorkers`, starts the dispatch/health/scale timers, and
    /// transitions `stopped → starting → running`. Takes `&Arc<Self>` since
    /// the background timers each hold their own clone of the pool.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.status != PoolStatus::Stopped {
                anyhow::bail!(PoolError::AlreadyInitialized);
            }
        }

        {
            let mut state = self.state.lock().await;
            state.status = PoolStatus::Starting;
        }
        self.events.emit(PoolEvent::PoolStatus {
            status: PoolStatus::Starting,
        });

        {
            let mut state = self.state.lock().await;
            for _ in 0..self.config.initial_workers {
                self.spawn_worker(&mut state).await?;
            }
            state.started_at = Some(Utc::now());
            state.status = PoolStatus::Running;
        }
        self.events.emit(PoolEvent::PoolStatus {
            status: PoolStatus::Running,
        });

        self.start_background_loops();
        Ok(())
    }

    fn start_background_loops(self: &Arc<Self>) {
        let dispatch_interval = self.config.dispatch_interval;
        let health_interval = self.config.health_check_interval;
        let mut handles = Vec::new();

        let pool = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dispatch_interval);
            loop {
                ticker.tick().await;
                pool.poll_all_workers_once().await;
                if let Err(err) = pool.dispatch_tick().await {
                    log::error!("dispatch tick failed: {err}");
                }
            }
        }));

        let pool = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            loop {
                ticker.tick().await;
                pool.health_tick().await;
            }
        }));

        // No distinct "scale tick" period is named in spec.md 4.3.1; reusing
        // healthCheckInterval here is a documented choice (see DESIGN.md).
        let pool = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            loop {
                ticker.tick().await;
                pool.scale_tick().await;
            }
        }));

        *self.tick_handles.lock().unwrap() = handles;
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        let task = AgentTask::from_spec(spec);
        let id = task.id.clone();

        {
            let mut state = self.state.lock().await;
            state
                .queue
                .enqueue(task.clone())
                .map_err(|_| PoolError::DuplicateTaskId(id.clone()))?;
            state.task_assignments.insert(id.clone(), TaskStatus::Queued);
        }
        self.events.emit(PoolEvent::TaskQueued { task });
        self.dispatch_tick().await?;
        Ok(id)
    }

    pub async fn cancel_task(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;

        if state.queue.remove(id) {
            state.task_assignments.insert(id.to_string(), TaskStatus::Cancelled);
            drop(state);
            self.events.emit(PoolEvent::TaskCancelled {
                task_id: id.to_string(),
                reason: "cancelled while queued".to_string(),
            });
            return Ok(true);
        }

        if let Some(entry) = state.running_tasks.remove(id) {
            if let Some(worker) = state.workers.get_mut(&entry.worker_id) {
                // Abort resolves synchronously; it always wins over a
                // concurrently-arriving `result` (documented Open Question
                // decision, see DESIGN.md).
                worker.abort().await;
            }
            state.task_assignments.insert(id.to_string(), TaskStatus::Cancelled);
            drop(state);
            self.events.emit(PoolEvent::TaskCancelled {
                task_id: id.to_string(),
                reason: "cancelled while running".to_string(),
            });
            return Ok(true);
        }

        Ok(false)
    }

    pub async fn get_task_status(&self, id: &str) -> Option<TaskStatus> {
        let state = self.state.lock().await;
        if state.queue.get_task(id).is_some() {
            return Some(TaskStatus::Queued);
        }
        if state.running_tasks.contains_key(id) {
            return Some(TaskStatus::Running);
        }
        state.task_assignments.get(id).copied()
    }

    pub async fn get_worker(&self, id: &str) -> Option<WorkerSnapshot> {
        let state = self.state.lock().await;
        state.workers.get(id).map(WorkerSnapshot::from)
    }

    pub async fn get_all_workers(&self) -> Vec<WorkerSnapshot> {
        let state = self.state.lock().await;
        state.workers.values().map(WorkerSnapshot::from).collect()
    }

    pub async fn get_status(&self) -> PoolStatus {
        self.state.lock().await.status
    }

    /// Most recent first, bounded to `limit`; backed by the time-pruned
    /// completion ledger (spec.md 9).
    pub async fn get_completed_tasks(&self, limit: usize) -> Vec<CompletedTask> {
        let state = self.state.lock().await;
        state.queue.get_completed_tasks(limit).into_iter().cloned().collect()
    }

    pub async fn get_metrics(&self) -> PoolMetrics {
        let state = self.state.lock().await;
        let total = state.workers.len();
        let idle = state.workers.values().filter(|w| w.is_idle()).count();
        let busy = state
            .workers
            .values()
            .filter(|w| matches!(w.status, WorkerStatus::Busy))
            .count();
        let error = state
            .workers
            .values()
            .filter(|w| matches!(w.status, WorkerStatus::Error))
            .count();
        let crashed = state
            .workers
            .values()
            .filter(|w| matches!(w.status, WorkerStatus::Crashed))
            .count();
        let utilization = if total == 0 { 0.0 } else { busy as f64 / total as f64 };
        let average_task_duration_ms = if state.task_durations.is_empty() {
            0.0
        } else {
            state.task_durations.iter().sum::<u64>() as f64 / state.task_durations.len() as f64
        };

        PoolMetrics {
            total_workers: total,
            idle_workers: idle,
            busy_workers: busy,
            error_workers: error,
            crashed_workers: crashed,
            utilization,
            queue_depth: state.queue.size_by_priority(),
            average_task_duration_ms,
            total_tasks_completed: state.total_tasks_completed,
            total_tasks_failed: state.total_tasks_failed,
            ..PoolMetrics::default()
        }
        .with_average_wait_time(state.queue.get_average_wait_time())
    }

    pub async fn scale_up(&self, count: Option<usize>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let from = state.workers.len();
        let n = count
            .unwrap_or(self.config.scale_up_step)
            .min(self.config.max_workers.saturating_sub(from));

        // Pool reports `scaling` for the duration of the resize (spec.md
        // 3.4/3.5 lifecycle), restoring whatever status it had before.
        let previous_status = state.status;
        if n > 0 {
            state.status = PoolStatus::Scaling;
        }
        drop(state);
        if n > 0 {
            self.events.emit(PoolEvent::PoolStatus { status: PoolStatus::Scaling });
        }

        let mut state = self.state.lock().await;
        for _ in 0..n {
            self.spawn_worker(&mut state).await?;
        }
        let to = state.workers.len();
        if n > 0 {
            state.last_scale_operation = Some(ScaleOperation {
                direction: ScaleDirection::Up,
                count: n,
                timestamp: Instant::now(),
            });
            state.status = previous_status;
        }
        drop(state);

        if n > 0 {
            self.events.emit(PoolEvent::PoolStatus { status: previous_status });
            self.events.emit(PoolEvent::PoolScaled {
                direction: ScaleDirection::Up,
                count: n,
                from,
                to,
            });
        }
        Ok(n)
    }

    pub async fn scale_down(&self, count: Option<usize>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let from = state.workers.len();
        let max_removable = from.saturating_sub(self.config.min_workers);
        let requested = count.unwrap_or(self.config.scale_down_step);

        let mut idle_ids: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|(_, w)| w.is_idle())
            .map(|(id, _)| id.clone())
            .collect();
        idle_ids.sort();
        let n = requested.min(max_removable).min(idle_ids.len());

        let previous_status = state.status;
        if n > 0 {
            state.status = PoolStatus::Scaling;
        }

        let mut terminated = Vec::new();
        for id in idle_ids.into_iter().take(n) {
            if let Some(worker) = state.workers.remove(&id) {
                terminated.push(worker);
            }
        }
        drop(state);
        if n > 0 {
            self.events.emit(PoolEvent::PoolStatus { status: PoolStatus::Scaling });
        }

        for mut worker in terminated {
            let _ = worker.terminate().await;
        }

        let mut state = self.state.lock().await;
        let to = state.workers.len();
        if n > 0 {
            state.last_scale_operation = Some(ScaleOperation {
                direction: ScaleDirection::Down,
                count: n,
                timestamp: Instant::now(),
            });
            state.status = previous_status;
        }
        drop(state);

        if n > 0 {
            self.events.emit(PoolEvent::PoolStatus { status: previous_status });
            self.events.emit(PoolEvent::PoolScaled {
                direction: ScaleDirection::Down,
                count: n,
                from,
                to,
            });
        }
        Ok(n)
    }

    /// Idempotent: a second call while already `stopped` is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.status == PoolStatus::Stopped {
                return Ok(());
            }
        }

        {
            let mut state = self.state.lock().await;
            state.status = PoolStatus::Stopping;
        }
        self.events.emit(PoolEvent::PoolStatus {
            status: PoolStatus::Stopping,
        });

        for handle in self.tick_handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        let workers = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.workers)
        };
        let terminations = workers.into_values().map(|mut w| async move {
            let _ = w.terminate().await;
        });
        futures::future::join_all(terminations).await;

        {
            let mut state = self.state.lock().await;
            state.queue.clear();
            state.running_tasks.clear();
            state.task_assignments.clear();
            state.status = PoolStatus::Stopped;
        }
        self.events.emit(PoolEvent::PoolStatus {
            status: PoolStatus::Stopped,
        });
        Ok(())
    }

    /// While queued work exists and at least one worker is idle: pick one,
    /// dequeue one task, assign, and call `execute`. Per spec.md 4.3.3 this
    /// must not block the tick on task completion — only on the `execute`
    /// call itself accepting the task (a single IPC send).
    async fn dispatch_tick(&self) -> Result<()> {
        loop {
            let (worker_id, mut worker, task) = {
                let mut state = self.state.lock().await;
                if state.queue.is_empty() {
                    return Ok(());
                }
                let Some(worker_id) = pick_idle_worker(&state) else {
                    return Ok(());
                };
                let task = state.queue.dequeue().expect("queue was non-empty");

                state.running_tasks.insert(
                    task.id.clone(),
                    RunningTaskEntry {
                        task: task.clone(),
                        worker_id: worker_id.clone(),
                    },
                );
                state.task_assignments.insert(task.id.clone(), TaskStatus::Running);

                // Taken out of the map so the `execute` IPC send below runs
                // with the pool's state lock released — per spec.md 5,
                // dispatch/scale/health ticks and the `submit_task`/
                // `cancel_task`/`get_status`/`get_metrics` accessors must
                // never block on it. Put back right after, win or lose.
                let worker = state
                    .workers
                    .remove(&worker_id)
                    .expect("picked worker exists in the same locked section");
                (worker_id, worker, task)
            };

            let default_timeout = self.config.task_timeout;
            let result = worker.execute(task.clone(), default_timeout).await;

            {
                let mut state = self.state.lock().await;
                state.workers.insert(worker_id.clone(), worker);
            }
            let outcome = result?;

            self.events.emit(PoolEvent::TaskAssigned {
                task_id: task.id.clone(),
                worker_id,
            });
            self.events.emit(PoolEvent::TaskStarted { task_id: task.id.clone() });

            if let Some(result) = outcome {
                // Synchronous resolution (blocked command / invalid type) —
                // never reached the child, so the worker was never marked
                // busy; resolve it right away and let this same loop continue.
                self.handle_task_outcome(task.id, result).await?;
            }
        }
    }

    async fn poll_all_workers_once(&self) {
        let ids: Vec<WorkerId> = {
            let state = self.state.lock().await;
            state.workers.keys().cloned().collect()
        };

        for id in ids {
            let outcome = {
                let mut state = self.state.lock().await;
                match state.workers.get_mut(&id) {
                    Some(worker) => worker.poll().await,
                    None => continue,
                }
            };

            match outcome {
                Ok(WorkerOutcome::None) => {}
                Ok(WorkerOutcome::TaskFinished(result)) => {
                    let task_id = result.task_id.clone();
                    if let Err(err) = self.handle_task_outcome(task_id, result).await {
                        log::error!("failed to handle task outcome for worker {id}: {err}");
                    }
                }
                Ok(WorkerOutcome::Crashed { code, signal }) => {
                    self.handle_worker_crash(id, code, signal).await;
                }
                Err(err) => log::error!("worker {id} poll failed: {err}"),
            }
        }
    }

    /// Does not itself trigger a new dispatch pass — callers that need one
    /// (the background dispatch loop, `submit_task`, `handle_worker_crash`)
    /// invoke `dispatch_tick` on their own. Keeping this function dispatch-
    /// free avoids a recursive `dispatch_tick → handle_task_outcome →
    /// dispatch_tick` async call cycle, since `dispatch_tick` itself resolves
    /// synchronous outcomes through this same path.
    async fn handle_task_outcome(&self, task_id: TaskId, result: TaskResult) -> Result<()> {
        let task = {
            let mut state = self.state.lock().await;
            state.running_tasks.remove(&task_id).map(|entry| entry.task)
        };
        let Some(task) = task else {
            return Ok(());
        };

        if result.success {
            self.complete_task(&task, result).await;
        } else {
            self.fail_or_retry_task(task, result).await;
        }

        Ok(())
    }

    async fn complete_task(&self, task: &AgentTask, result: TaskResult) {
        {
            let mut state = self.state.lock().await;
            state.total_tasks_completed += 1;
            state.task_durations.push_back(result.duration_ms);
            if state.task_durations.len() > MAX_TASK_DURATIONS {
                state.task_durations.pop_front();
            }
            state.task_assignments.insert(task.id.clone(), TaskStatus::Completed);
            state.queue.complete(task.clone(), result.clone());
        }
        self.events.emit(PoolEvent::TaskCompleted {
            task_id: task.id.clone(),
            result,
        });
    }

    /// Retries if budget remains; otherwise marks the task terminally failed.
    /// A task is executed at most `maxRetries + 1` times (spec.md 8.1).
    /// `BlockedCommand` and `InvalidTaskType` are never retried, regardless
    /// of remaining budget — spec.md 7 lists both as "fail immediately; no
    /// retry" since re-enqueueing a task whose command or type can never
    /// succeed would just loop it through the same synchronous rejection.
    async fn fail_or_retry_task(&self, task: AgentTask, result: TaskResult) {
        let retryable = !matches!(
            result.error,
            Some(TaskErrorKind::BlockedCommand) | Some(TaskErrorKind::InvalidTaskType)
        );
        if retryable && task.can_retry() {
            let retried = task.retry();
            {
                let mut state = self.state.lock().await;
                state
                    .task_assignments
                    .insert(retried.id.clone(), TaskStatus::Queued);
                let _ = state.queue.enqueue(retried.clone());
            }
            self.events.emit(PoolEvent::TaskQueued { task: retried });
        } else {
            {
                let mut state = self.state.lock().await;
                state.total_tasks_failed += 1;
                state.task_assignments.insert(task.id.clone(), TaskStatus::Failed);
                state.queue.complete(task.clone(), result.clone());
            }
            self.events.emit(PoolEvent::TaskFailed {
                task_id: task.id,
                error: result.error.map(|e| e.to_string()).unwrap_or_default(),
                final_attempt: true,
            });
        }
    }

    async fn handle_worker_crash(&self, worker_id: WorkerId, code: Option<i32>, signal: Option<i32>) {
        log::warn!("worker {worker_id} crashed (code={code:?}, signal={signal:?})");
        self.events.emit(PoolEvent::WorkerCrashed {
            worker_id: worker_id.clone(),
            code,
            signal,
        });

        let orphaned: Vec<AgentTask> = {
            let mut state = self.state.lock().await;
            let ids: Vec<TaskId> = state
                .running_tasks
                .iter()
                .filter(|(_, e)| e.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.running_tasks.remove(&id).map(|e| e.task))
                .collect()
        };

        for task in orphaned {
            let task_id = task.id.clone();
            let result = TaskResult::failure(
                task_id,
                1,
                String::new(),
                "worker crashed mid-execution".to_string(),
                0,
                TaskErrorKind::ExecutionError,
            );
            self.fail_or_retry_task(task, result).await;
        }

        if !self.restart_worker(&worker_id).await {
            let (below_min, running) = {
                let mut state = self.state.lock().await;
                state.workers.remove(&worker_id);
                let below_min = state.workers.len() < self.config.min_workers;
                let running = matches!(state.status, PoolStatus::Running | PoolStatus::Degraded);
                (below_min, running)
            };
            if below_min && running {
                let mut state = self.state.lock().await;
                if let Err(err) = self.spawn_worker(&mut state).await {
                    log::error!("failed to spawn replacement for crashed worker {worker_id}: {err}");
                }
            }
        }

        if let Err(err) = self.dispatch_tick().await {
            log::error!("post-crash dispatch tick failed: {err}");
        }
    }

    /// Respawns a fresh child under the same worker id. The pool's bookkeeping
    /// (`running_tasks`, `task_assignments`) is untouched here; the caller
    /// already requeued any orphaned task before calling this.
    async fn restart_worker(&self, worker_id: &WorkerId) -> bool {
        match AgentWorker::spawn(
            worker_id.clone(),
            &self.base_dir,
            self.resource_limits,
            self.runner.as_ref(),
        )
        .await
        {
            Ok(worker) => {
                let pid = worker.pid;
                {
                    let mut state = self.state.lock().await;
                    state.workers.insert(worker_id.clone(), worker);
                }
                self.events.emit(PoolEvent::WorkerStarted {
                    worker_id: worker_id.clone(),
                    pid,
                });
                true
            }
            Err(err) => {
                log::error!("failed to restart worker {worker_id}: {err}");
                false
            }
        }
    }

    async fn spawn_worker(&self, state: &mut PoolState) -> Result<WorkerId> {
        let seq = self.next_worker_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("worker-{seq}");
        let worker = AgentWorker::spawn(id.clone(), &self.base_dir, self.resource_limits, self.runner.as_ref())
            .await?;
        let pid = worker.pid;
        state.workers.insert(id.clone(), worker);
        self.events.emit(PoolEvent::WorkerStarted {
            worker_id: id.clone(),
            pid,
        });
        Ok(id)
    }

    async fn health_tick(&self) {
        {
            let mut state = self.state.lock().await;
            state.queue.cleanup_completed(COMPLETED_TASK_RETENTION);
        }

        let reports: Vec<(WorkerId, bool, Vec<String>)> = {
            let state = self.state.lock().await;
            state
                .workers
                .iter()
                .map(|(id, w)| {
                    let report = w.check_health();
                    (id.clone(), report.healthy, report.issues)
                })
                .collect()
        };

        let crashed_ids: Vec<WorkerId> = reports
            .iter()
            .filter(|(_, healthy, issues)| !healthy && issues.iter().any(|i| i.contains("not running")))
            .map(|(id, ..)| id.clone())
            .collect();
        for id in crashed_ids {
            self.handle_worker_crash(id, None, None).await;
        }

        let total = reports.len();
        let unhealthy = reports.iter().filter(|(_, healthy, _)| !healthy).count();
        if total == 0 {
            return;
        }
        let degraded = unhealthy * 2 > total;

        let mut state = self.state.lock().await;
        let transition = match (degraded, state.status) {
            (true, PoolStatus::Running) => Some(PoolStatus::Degraded),
            (false, PoolStatus::Degraded) => Some(PoolStatus::Running),
            _ => None,
        };
        if let Some(next) = transition {
            state.status = next;
            drop(state);
            self.events.emit(PoolEvent::PoolStatus { status: next });
        }
    }

    async fn scale_tick(&self) {
        let decision = {
            let state = self.state.lock().await;
            if !matches!(state.status, PoolStatus::Running | PoolStatus::Degraded) {
                return;
            }
            if let Some(last) = &state.last_scale_operation {
                if last.timestamp.elapsed() < self.config.cooldown_period {
                    return;
                }
            }

            let total = state.workers.len();
            let busy = state
                .workers
                .values()
                .filter(|w| matches!(w.status, WorkerStatus::Busy))
                .count();
            let utilization = if total == 0 { 0.0 } else { busy as f64 / total as f64 };

            if utilization >= self.config.scale_up_threshold && total < self.config.max_workers {
                Some(ScaleDirection::Up)
            } else if utilization <= self.config.scale_down_threshold && total > self.config.min_workers {
                Some(ScaleDirection::Down)
            } else {
                None
            }
        };

        match decision {
            Some(ScaleDirection::Up) => {
                let _ = self.scale_up(Some(self.config.scale_up_step)).await;
            }
            Some(ScaleDirection::Down) => {
                let _ = self.scale_down(Some(self.config.scale_down_step)).await;
            }
            None => {}
        }
    }
}

/// Least-recently-active idle worker — a deterministic, documented policy
/// per spec.md 9 ("any deterministic policy suffices but must be
/// documented").
fn pick_idle_worker(state: &PoolState) -> Option<WorkerId> {
    state
        .workers
        .iter()
        .filter(|(_, w)| w.is_idle())
        .min_by_key(|(_, w)| w.last_activity)
        .map(|(id, _)| id.clone())
}
