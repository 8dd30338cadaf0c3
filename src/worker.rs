// AgentWorker: one supervised child process, per spec.md 4.2.
//
// Modeled on `onefuzz-supervisor`'s `Worker`/`IWorkerRunner`/`IWorkerChild`
// split (see `worker.rs` in that crate): a small `Downcast`-able trait for
// the thing that knows how to spawn and talk to a child process, with a
// real `tokio::process`-backed implementation and, for tests, a `double`
// implementation that never touches the OS.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use downcast_rs::{impl_downcast, Downcast};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::{ResourceLimits, HEARTBEAT_INTERVAL, HEARTBEAT_STALE_AFTER};
use crate::ipc::{Envelope, MessageType};
use crate::security;
use crate::task::{AgentTask, TaskErrorKind, TaskResult, TaskType};

pub type WorkerId = String;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
    Error,
    Crashed,
}

/// Serializable exit status, mirroring the teacher's `onefuzz_supervisor::worker::ExitStatus`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl From<std::process::ExitStatus> for ExitStatus {
    #[cfg(unix)]
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
            success: status.success(),
        }
    }

    #[cfg(not(unix))]
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
            success: status.success(),
        }
    }
}

/// What spawning a task maps to at the wire level, per spec.md 4.2.2.
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

impl SpawnSpec {
    /// `None` iff the task's type has no child-invocation strategy
    /// (`TaskType::Unknown`); the caller should synthesize
    /// `INVALID_TASK_TYPE` without spawning anything.
    pub fn for_task(task: &AgentTask, worker_id: &str, worker_dir: &std::path::Path) -> Option<Self> {
        let (program, args) = match task.task_type {
            TaskType::Shell | TaskType::Script => (task.command.clone(), task.args.clone()),
            TaskType::ClaudeCode | TaskType::Agent => {
                let mut args = vec![task.command.clone()];
                args.extend(task.args.iter().cloned());
                ("claude".to_string(), args)
            }
            TaskType::Unknown => return None,
        };

        let cwd = task.cwd.clone().unwrap_or_else(|| worker_dir.to_path_buf());
        let env = security::filter_env(worker_id, worker_dir, &task.env);

        Some(Self {
            program,
            args,
            env,
            cwd,
        })
    }
}

/// Abstracts spawning a child process so tests never touch the OS, mirroring
/// `onefuzz_supervisor::worker::IWorkerRunner`.
#[async_trait]
pub trait IWorkerRunner: Downcast + Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn IChildProcess>>;
}
impl_downcast!(IWorkerRunner);

/// Abstracts the running child itself, mirroring `IWorkerChild`.
#[async_trait]
pub trait IChildProcess: Downcast + Send {
    fn pid(&self) -> u32;
    async fn send(&mut self, msg: &Envelope) -> Result<()>;
    /// Non-blocking: returns `None` if no message is buffered right now.
    fn try_recv(&mut self) -> Option<Envelope>;
    /// Non-blocking: returns `Some` once the child has exited.
    fn try_wait(&mut self) -> Result<Option<ExitStatus>>;
    /// SIGTERM, then SIGKILL after a grace period.
    async fn kill(&mut self) -> Result<()>;
}
impl_downcast!(IChildProcess);

pub struct ProcessRunner;

#[async_trait]
impl IWorkerRunner for ProcessRunner {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn IChildProcess>> {
        tokio::fs::create_dir_all(&spec.cwd).await?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_lines_into_channel(stdout, tx));

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_lines_into_channel_raw(stderr, log_tx));

        Ok(Box::new(ProcessChild {
            pid,
            child,
            stdin,
            rx,
            _stderr_rx: log_rx,
        }))
    }
}

async fn read_lines_into_channel(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<Envelope>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match Envelope::from_line(&line) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Err(err) => {
                log::warn!("discarding malformed child message: {err}");
            }
        }
    }
}

async fn read_lines_into_channel_raw(
    stderr: tokio::process::ChildStderr,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

pub struct ProcessChild {
    pid: u32,
    child: Child,
    stdin: Option<tokio::process::ChildStdin>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    _stderr_rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl IChildProcess for ProcessChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&mut self, msg: &Envelope) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            anyhow::bail!("child stdin already closed");
        };
        let line = msg.to_line()?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?.map(ExitStatus::from))
    }

    async fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        }

        let graceful = tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
        if graceful.is_err() {
            let _ = self.child.kill().await;
            let _ = self.child.wait().await;
        }

        Ok(())
    }
}

/// What happened during a single `poll()` pass, for the pool to react to.
pub enum WorkerOutcome {
    None,
    TaskFinished(TaskResult),
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
}

/// One supervised child process. `status = busy ⇔ current_task.is_some()`
/// is maintained as an invariant by every method that mutates `status`.
pub struct AgentWorker {
    pub id: WorkerId,
    pub pid: u32,
    pub status: WorkerStatus,
    pub current_task: Option<AgentTask>,
    pub metrics: crate::metrics::WorkerMetrics,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    working_dir: PathBuf,
    resource_limits: ResourceLimits,
    child: Option<Box<dyn IChildProcess>>,
    task_started_at: Option<Instant>,
    task_timeout: Option<Duration>,
    last_heartbeat_sent: Option<Instant>,
    ready_deadline: Option<Instant>,
}

impl AgentWorker {
    /// Constructs a worker in `starting` and kicks off the child spawn.
    /// `base_dir` is the pool's working-directory root (spec.md 6.3);
    /// the worker directory is `<base_dir>/<worker_id>`.
    pub async fn spawn(
        id: WorkerId,
        base_dir: &std::path::Path,
        resource_limits: ResourceLimits,
        runner: &dyn IWorkerRunner,
    ) -> Result<Self> {
        let working_dir = base_dir.join(&id);
        tokio::fs::create_dir_all(&working_dir).await?;

        let env = security::filter_env(&id, &working_dir, &HashMap::new());
        let spec = SpawnSpec {
            program: "claude".to_string(),
            args: vec![],
            env,
            cwd: working_dir.clone(),
        };

        log::info!("spawning worker {id}; cwd = {}", working_dir.display());
        let child = runner.spawn(&spec).await?;
        let pid = child.pid();

        let now = Utc::now();
        Ok(Self {
            id,
            pid,
            status: WorkerStatus::Starting,
            current_task: None,
            metrics: crate::metrics::WorkerMetrics::default(),
            started_at: now,
            last_activity: now,
            working_dir,
            ready_deadline: Some(Instant::now() + resource_limits.spawn_ready_timeout),
            resource_limits,
            child: Some(child),
            task_started_at: None,
            task_timeout: None,
            last_heartbeat_sent: None,
        })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle)
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            WorkerStatus::Starting
                | WorkerStatus::Idle
                | WorkerStatus::Busy
                | WorkerStatus::Stopping
                | WorkerStatus::Error
        )
    }

    /// Starts executing `task`. Synchronous short-circuits (blocked command,
    /// invalid type) are returned directly without touching `status`/`child`
    /// beyond staying idle; on success transitions to `busy`.
    pub async fn execute(&mut self, task: AgentTask, default_timeout: Duration) -> Result<Option<TaskResult>> {
        if !self.is_idle() {
            anyhow::bail!("worker `{}` is not idle", self.id);
        }

        if security::is_blocked(&task.command) {
            log::warn!("worker {} blocked command for task {}", self.id, task.id);
            return Ok(Some(TaskResult::failure(
                task.id,
                1,
                String::new(),
                "command blocked by security policy".to_string(),
                0,
                TaskErrorKind::BlockedCommand,
            )));
        }

        let Some(spec) = SpawnSpec::for_task(&task, &self.id, &self.working_dir) else {
            log::warn!("worker {} rejected unknown task type for {}", self.id, task.id);
            return Ok(Some(TaskResult::failure(
                task.id,
                1,
                String::new(),
                "unknown task type".to_string(),
                0,
                TaskErrorKind::InvalidTaskType,
            )));
        };

        let Some(child) = self.child.as_mut() else {
            anyhow::bail!("worker `{}` has no child process", self.id);
        };

        // The payload carries the resolved spawn strategy rather than the
        // raw task, since `claude`/shell dispatch is a worker-side concern.
        let envelope = Envelope::new(
            MessageType::Task,
            task.id.clone(),
            serde_json::json!({
                "taskId": task.id,
                "program": spec.program,
                "args": spec.args,
                "cwd": spec.cwd,
            }),
        );

        if let Err(err) = child.send(&envelope).await {
            log::error!("worker {} failed to send task {}: {err}", self.id, task.id);
            self.status = WorkerStatus::Error;
            return Ok(Some(TaskResult::failure(
                task.id,
                1,
                String::new(),
                err.to_string(),
                0,
                TaskErrorKind::ExecutionError,
            )));
        }

        self.task_timeout = Some(
            task.timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
        );
        self.task_started_at = Some(Instant::now());
        self.current_task = Some(task);
        self.status = WorkerStatus::Busy;
        self.last_activity = Utc::now();

        Ok(None)
    }

    /// Cancels the in-flight task synchronously: the abort is the
    /// authoritative outcome (documented Open Question decision, see
    /// DESIGN.md) rather than racing the child's own `result`.
    pub async fn abort(&mut self) -> Option<TaskResult> {
        let task = self.current_task.take()?;

        if let Some(child) = self.child.as_mut() {
            let msg = Envelope::abort(task.id.clone(), task.id.clone());
            let _ = child.send(&msg).await;
        }

        self.status = WorkerStatus::Idle;
        self.task_started_at = None;
        self.task_timeout = None;
        self.last_activity = Utc::now();

        Some(TaskResult::failure(
            task.id,
            1,
            String::new(),
            "task aborted".to_string(),
            0,
            TaskErrorKind::Aborted,
        ))
    }

    /// Sends `control:"shutdown"`, waits up to 5s, then kills. Idempotent.
    pub async fn terminate(&mut self) -> Result<()> {
        if matches!(self.status, WorkerStatus::Crashed) {
            return Ok(());
        }

        self.status = WorkerStatus::Stopping;

        if let Some(child) = self.child.as_mut() {
            let msg = Envelope::shutdown(self.id.clone());
            let _ = child.send(&msg).await;
            child.kill().await?;
        }

        self.pid = 0;
        self.status = WorkerStatus::Idle;
        Ok(())
    }

    /// One non-blocking pass: drains pending IPC messages, checks for
    /// timeouts/crashes, sends a heartbeat if due.
    pub async fn poll(&mut self) -> Result<WorkerOutcome> {
        if let Some(outcome) = self.check_crash()? {
            return Ok(outcome);
        }

        match self.status {
            WorkerStatus::Starting => self.poll_starting(),
            WorkerStatus::Busy => self.poll_busy().await,
            _ => Ok(WorkerOutcome::None),
        }
    }

    fn check_crash(&mut self) -> Result<Option<WorkerOutcome>> {
        if !self.is_live() {
            return Ok(None);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        if let Some(exit) = child.try_wait()? {
            self.status = WorkerStatus::Crashed;
            self.pid = 0;
            log::warn!("worker {} crashed: {:?}", self.id, exit);
            return Ok(Some(WorkerOutcome::Crashed {
                code: exit.code,
                signal: exit.signal,
            }));
        }
        Ok(None)
    }

    fn poll_starting(&mut self) -> Result<WorkerOutcome> {
        let Some(child) = self.child.as_mut() else {
            return Ok(WorkerOutcome::None);
        };

        while let Some(msg) = child.try_recv() {
            if msg.message_type == MessageType::Ready {
                self.status = WorkerStatus::Idle;
                self.last_activity = Utc::now();
                self.last_heartbeat_sent = Some(Instant::now());
                self.ready_deadline = None;
                return Ok(WorkerOutcome::None);
            }
        }

        if let Some(deadline) = self.ready_deadline {
            if Instant::now() >= deadline {
                log::error!("worker {} timed out waiting for ready", self.id);
                self.status = WorkerStatus::Error;
            }
        }

        Ok(WorkerOutcome::None)
    }

    async fn poll_busy(&mut self) -> Result<WorkerOutcome> {
        let task_id = self
            .current_task
            .as_ref()
            .map(|t| t.id.clone())
            .unwrap_or_default();

        let mut finished = None;
        {
            let Some(child) = self.child.as_mut() else {
                return Ok(WorkerOutcome::None);
            };

            while let Some(msg) = child.try_recv() {
                match msg.message_type {
                    MessageType::Result if msg.result_task_id().as_deref() == Some(task_id.as_str()) => {
                        finished = Some(self.result_from_envelope(&msg));
                    }
                    MessageType::Heartbeat => {
                        if let Some((cpu, memory)) = msg.heartbeat_metrics() {
                            self.metrics.record_heartbeat(cpu, memory);
                        }
                    }
                    MessageType::Log => {
                        log::debug!("worker {} child log: {:?}", self.id, msg.payload);
                    }
                    MessageType::Error => {
                        log::warn!("worker {} child error: {:?}", self.id, msg.payload);
                    }
                    _ => {}
                }
            }
        }

        if let Some(result) = finished {
            self.complete_current_task(result.clone());
            return Ok(WorkerOutcome::TaskFinished(result));
        }

        if let (Some(started), Some(timeout)) = (self.task_started_at, self.task_timeout) {
            if started.elapsed() >= timeout {
                log::warn!("worker {} task {} timed out", self.id, task_id);
                let result = TaskResult::failure(
                    task_id,
                    1,
                    String::new(),
                    "task exceeded its timeout".to_string(),
                    started.elapsed().as_millis() as u64,
                    TaskErrorKind::ExecutionError,
                );
                self.complete_current_task(result.clone());
                return Ok(WorkerOutcome::TaskFinished(result));
            }
        }

        self.maybe_send_heartbeat().await;

        Ok(WorkerOutcome::None)
    }

    fn result_from_envelope(&self, msg: &Envelope) -> TaskResult {
        let duration_ms = self
            .task_started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let task_id = msg.result_task_id().unwrap_or_default();
        let success = msg
            .payload
            .get("success")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let stdout = msg
            .payload
            .get("stdout")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stderr = msg
            .payload
            .get("stderr")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        if success {
            TaskResult::success(task_id, stdout, stderr, duration_ms)
        } else {
            let exit_code = msg
                .payload
                .get("exitCode")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(1) as i32;
            TaskResult::failure(
                task_id,
                exit_code,
                stdout,
                stderr,
                duration_ms,
                TaskErrorKind::NonZeroExit,
            )
        }
    }

    fn complete_current_task(&mut self, result: TaskResult) {
        self.metrics.record_completion(result.duration_ms, result.success);
        self.current_task = None;
        self.task_started_at = None;
        self.task_timeout = None;
        self.status = WorkerStatus::Idle;
        self.last_activity = Utc::now();
    }

    async fn maybe_send_heartbeat(&mut self) {
        let due = match self.last_heartbeat_sent {
            Some(last) => last.elapsed() >= HEARTBEAT_INTERVAL,
            None => true,
        };
        if !due {
            return;
        }

        if let Some(child) = self.child.as_mut() {
            let msg = Envelope::heartbeat(self.id.clone());
            if let Err(err) = child.send(&msg).await {
                log::error!("worker {} heartbeat send failed: {err}", self.id);
                self.status = WorkerStatus::Error;
                return;
            }
        }
        self.last_heartbeat_sent = Some(Instant::now());
    }

    /// `{healthy, issues, metrics}` per spec.md 4.2.4.
    pub fn check_health(&self) -> HealthReport {
        let mut issues = Vec::new();

        if !self.is_live() {
            issues.push("process not running".to_string());
        }

        if let Some(last) = self.metrics.last_heartbeat {
            let age = Utc::now() - last;
            if age.to_std().unwrap_or_default() > HEARTBEAT_STALE_AFTER {
                issues.push(format!("no heartbeat in {}s", age.num_seconds()));
            }
        }

        if self.metrics.memory_mb > self.resource_limits.memory_mb {
            issues.push(format!(
                "memory {}MB exceeds limit {}MB",
                self.metrics.memory_mb, self.resource_limits.memory_mb
            ));
        }

        HealthReport {
            healthy: issues.is_empty(),
            issues,
        }
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_activity).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
pub mod double;
