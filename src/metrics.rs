// Per-worker and pool-level metrics, per spec.md 3.3 and SPEC_FULL 15.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::SizeByPriority;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct WorkerMetrics {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_task_duration_ms: f64,
    pub uptime_ms: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            avg_task_duration_ms: 0.0,
            uptime_ms: 0,
            last_heartbeat: None,
        }
    }
}

impl WorkerMetrics {
    /// Rolling arithmetic mean over completed tasks (success + failure).
    pub fn record_completion(&mut self, duration_ms: u64, success: bool) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }

        let total = self.tasks_completed + self.tasks_failed;
        self.avg_task_duration_ms +=
            (duration_ms as f64 - self.avg_task_duration_ms) / total as f64;
    }

    pub fn record_heartbeat(&mut self, cpu_percent: f64, memory_mb: u64) {
        self.cpu_percent = cpu_percent;
        self.memory_mb = memory_mb;
        self.last_heartbeat = Some(Utc::now());
    }
}

/// Read-only aggregate view backing `AgentWorkerPool::get_metrics`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolMetrics {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub error_workers: usize,
    pub crashed_workers: usize,
    pub utilization: f64,
    pub queue_depth: SizeByPriority,
    pub average_wait_time_ms: u64,
    pub average_task_duration_ms: f64,
    pub total_tasks_completed: u64,
    pub total_tasks_failed: u64,
}

impl PoolMetrics {
    pub fn with_average_wait_time(mut self, wait: Duration) -> Self {
        self.average_wait_time_ms = wait.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_duration_is_arithmetic_mean() {
        let mut m = WorkerMetrics::default();
        m.record_completion(10, true);
        m.record_completion(20, true);
        m.record_completion(30, false);
        assert_eq!(m.tasks_completed, 2);
        assert_eq!(m.tasks_failed, 1);
        assert!((m.avg_task_duration_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn heartbeat_updates_cpu_memory_and_timestamp() {
        let mut m = WorkerMetrics::default();
        assert!(m.last_heartbeat.is_none());
        m.record_heartbeat(12.5, 256);
        assert_eq!(m.cpu_percent, 12.5);
        assert_eq!(m.memory_mb, 256);
        assert!(m.last_heartbeat.is_some());
    }
}
