//! An in-process agent worker pool: a scheduler and process supervisor that
//! executes heterogeneous command-style tasks across a dynamically sized set
//! of isolated child processes, with priority queueing, retry-on-failure,
//! per-worker health tracking, autoscaling, and cooperative abort.

pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod security;
pub mod task;
pub mod worker;

pub use config::{default_pool_config, default_resource_limits};
pub use pool::AgentWorkerPool;
pub use security::{BLOCKED_COMMANDS, ENV_WHITELIST};
