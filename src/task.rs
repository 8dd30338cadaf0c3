// Task and result types for the agent worker pool.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = String;
pub type WorkstreamId = String;

/// Dispatch strategy for a task's child invocation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Shell,
    Script,
    #[serde(rename = "claude-code")]
    ClaudeCode,
    Agent,
    /// Any `type` value outside the closed set above. Kept as a tag rather
    /// than rejected at deserialization so dispatch can synthesize
    /// `INVALID_TASK_TYPE` the way spec.md 4.2.2 describes, instead of
    /// failing the whole enqueue.
    #[serde(other)]
    Unknown,
}

/// Dequeue precedence: High > Medium > Low > Background.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    // Declared high-to-low so the derived `Ord` matches dequeue precedence.
    High,
    Medium,
    Low,
    Background,
}

pub const PRIORITY_ORDER: [Priority; 4] = [
    Priority::High,
    Priority::Medium,
    Priority::Low,
    Priority::Background,
];

/// A request to execute one command, per spec.md 3.1.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentTask {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub workstream_id: Option<WorkstreamId>,
}

fn default_max_retries() -> u32 {
    3
}

/// Fields a caller supplies to `AgentWorkerPool::submit_task`; the pool fills
/// in `id`, `created_at`, and retry bookkeeping.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TaskSpec {
    pub task_type: TaskType,
    pub priority: Priority,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub workstream_id: Option<WorkstreamId>,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Shell
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl AgentTask {
    /// Build a fresh, queueable task from a caller-provided spec.
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: spec.task_type,
            priority: spec.priority,
            command: spec.command,
            args: spec.args,
            env: spec.env,
            cwd: spec.cwd,
            timeout_ms: spec.timeout_ms,
            max_retries: spec.max_retries.unwrap_or(3),
            retry_count: 0,
            created_at: Utc::now(),
            payload: spec.payload,
            metadata: spec.metadata,
            workstream_id: spec.workstream_id,
        }
    }

    /// A copy of this task for re-enqueue after a failed attempt.
    pub fn retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Closed error taxonomy for a failed `TaskResult`, per spec.md 3.2 and 7.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    #[error("child process exited with a non-zero status")]
    NonZeroExit,
    #[error("failed to spawn child process")]
    SpawnError,
    #[error("task was aborted")]
    Aborted,
    #[error("command blocked by security policy")]
    BlockedCommand,
    #[error("unknown task type")]
    InvalidTaskType,
    #[error("execution error communicating with worker")]
    ExecutionError,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorKind>,
}

impl TaskResult {
    pub fn success(task_id: TaskId, stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            task_id,
            success: true,
            exit_code: 0,
            stdout: trim_trailing(stdout),
            stderr: trim_trailing(stderr),
            duration_ms,
            error: None,
        }
    }

    pub fn failure(
        task_id: TaskId,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: u64,
        error: TaskErrorKind,
    ) -> Self {
        Self {
            task_id,
            success: false,
            exit_code,
            stdout: trim_trailing(stdout),
            stderr: trim_trailing(stderr),
            duration_ms,
            error: Some(error),
        }
    }
}

fn trim_trailing(s: String) -> String {
    s.trim_end().to_string()
}

/// Status of a task as tracked by the pool, retained past completion for
/// status queries (spec.md 3.4 `taskAssignments`).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_high_first() {
        let mut ps = vec![Priority::Background, Priority::High, Priority::Low];
        ps.sort();
        assert_eq!(ps, vec![Priority::High, Priority::Low, Priority::Background]);
    }

    #[test]
    fn retry_increments_count_and_preserves_fields() {
        let spec = TaskSpec {
            task_type: TaskType::Shell,
            priority: Priority::High,
            command: "echo".into(),
            max_retries: Some(2),
            ..Default::default()
        };
        let task = AgentTask::from_spec(spec);
        assert!(task.can_retry());

        let retried = task.retry();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.id, task.id);
        assert_eq!(retried.max_retries, 2);
        assert!(retried.can_retry());

        let retried = retried.retry();
        assert!(!retried.can_retry());
    }

    #[test]
    fn result_trims_trailing_whitespace() {
        let result = TaskResult::success("t1".into(), "out\n\n".into(), "err \n".into(), 10);
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
    }
}
