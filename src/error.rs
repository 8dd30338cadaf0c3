// Synchronous, caller-facing pool errors, per spec.md 7 ("Configuration
// errors ... are surfaced synchronously to the caller"). Task-scoped
// failures never use this type; they live in `TaskResult::error`
// (`TaskErrorKind`, see task.rs).

use thiserror::Error;

use crate::worker::WorkerId;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is already initialized")]
    AlreadyInitialized,

    #[error("pool has not been initialized")]
    NotInitialized,

    #[error("task `{0}` already exists in queue")]
    DuplicateTaskId(String),

    #[error("worker `{0}` not found")]
    WorkerNotFound(WorkerId),

    #[error("invalid worker bounds: min ({min}) must be <= max ({max})")]
    InvalidBounds { min: usize, max: usize },
}
