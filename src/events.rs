// Unified event stream, per spec.md 4.3.8.
//
// Delivery is best-effort and multi-consumer: a `tokio::sync::broadcast`
// channel, as recommended by spec.md section 5 ("Events: multi-consumer,
// single-producer per event type; delivery is best-effort"). A single
// channel carries every event variant, which doubles as the "generic event
// channel" spec.md asks for; type-specific subscription is left to
// consumers filtering on the variant, since `broadcast` has no native
// per-topic fan-out.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::task::{AgentTask, TaskId, TaskResult};
use crate::worker::WorkerId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Stopped,
    Starting,
    Running,
    Degraded,
    Scaling,
    Stopping,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind")]
pub enum PoolEvent {
    #[serde(rename = "pool.status")]
    PoolStatus { status: PoolStatus },
    #[serde(rename = "pool.scaled")]
    PoolScaled {
        direction: ScaleDirection,
        count: usize,
        from: usize,
        to: usize,
    },
    #[serde(rename = "worker.started")]
    WorkerStarted { worker_id: WorkerId, pid: u32 },
    #[serde(rename = "worker.crashed")]
    WorkerCrashed {
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[serde(rename = "task.queued")]
    TaskQueued { task: AgentTask },
    #[serde(rename = "task.assigned")]
    TaskAssigned { task_id: TaskId, worker_id: WorkerId },
    #[serde(rename = "task.started")]
    TaskStarted { task_id: TaskId },
    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: TaskId, result: TaskResult },
    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: TaskId,
        error: String,
        final_attempt: bool,
    },
    #[serde(rename = "task.cancelled")]
    TaskCancelled { task_id: TaskId, reason: String },
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A multi-consumer, best-effort event bus. `subscribe()` may be called any
/// number of times; a slow or absent consumer never blocks the pool
/// (lagging receivers simply miss old events on their next `recv`).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    /// Errors only when there are no subscribers; that is not a pool
    /// failure, so this is intentionally infallible from the caller's view.
    pub fn emit(&self, event: PoolEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(PoolEvent::PoolStatus {
            status: PoolStatus::Running,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            PoolEvent::PoolStatus {
                status: PoolStatus::Running
            }
        ));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(PoolEvent::PoolStatus {
            status: PoolStatus::Stopped,
        });
    }
}
