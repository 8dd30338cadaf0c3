// Child process IPC framing, per spec.md 4.2.2 / 6.2.
//
// The wire is newline-delimited JSON objects shaped `{type, id, timestamp,
// payload}` written to the child's stdin and read from its stdout, one
// message per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ready,
    Heartbeat,
    Task,
    Result,
    Control,
    Log,
    Error,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: Value,
}

impl Envelope {
    pub fn new(message_type: MessageType, id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type,
            id: id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn task(task: &crate::task::AgentTask) -> Self {
        Self::new(
            MessageType::Task,
            task.id.clone(),
            serde_json::to_value(task).unwrap_or(Value::Null),
        )
    }

    pub fn heartbeat(id: impl Into<String>) -> Self {
        Self::new(MessageType::Heartbeat, id, Value::Null)
    }

    pub fn shutdown(id: impl Into<String>) -> Self {
        Self::new(MessageType::Control, id, Value::String("shutdown".into()))
    }

    pub fn abort(id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self::new(
            MessageType::Control,
            id,
            serde_json::json!({ "action": "abort", "taskId": task_id.into() }),
        )
    }

    /// Serializes as a single line terminated with `\n`, ready to write to a
    /// child's stdin.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }

    /// Heartbeat reply payload, `{cpu: seconds, memory: MB}`, rounded to
    /// integer MB per spec.md 4.2.2.
    pub fn heartbeat_metrics(&self) -> Option<(f64, u64)> {
        if self.message_type != MessageType::Heartbeat {
            return None;
        }
        let cpu = self.payload.get("cpu")?.as_f64()?;
        let memory = self.payload.get("memory")?.as_f64()?.round() as u64;
        Some((cpu, memory))
    }

    /// `payload.taskId` for a `result` message, used to correlate with the
    /// originating task.
    pub fn result_task_id(&self) -> Option<String> {
        if self.message_type != MessageType::Result {
            return None;
        }
        self.payload
            .get("taskId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_wire_line() {
        let msg = Envelope::heartbeat("hb-1");
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));

        let parsed = Envelope::from_line(&line).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn heartbeat_metrics_rounds_memory_to_integer_mb() {
        let msg = Envelope::new(
            MessageType::Heartbeat,
            "hb",
            serde_json::json!({ "cpu": 0.5, "memory": 128.6 }),
        );
        assert_eq!(msg.heartbeat_metrics(), Some((0.5, 129)));
    }

    #[test]
    fn result_task_id_extracts_correlation_id() {
        let msg = Envelope::new(
            MessageType::Result,
            "r1",
            serde_json::json!({ "taskId": "task-42" }),
        );
        assert_eq!(msg.result_task_id().as_deref(), Some("task-42"));
    }

    #[test]
    fn non_heartbeat_message_has_no_heartbeat_metrics() {
        let msg = Envelope::shutdown("c1");
        assert_eq!(msg.heartbeat_metrics(), None);
    }
}
