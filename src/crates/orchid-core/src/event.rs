//! Execution events: live streaming and durable step history.
//!
//! Every execution emits an ordered event sequence:
//!
//! ```text
//! execution_start
//!   (node_start (tool_call tool_result)* node_complete|node_error)*
//! execution_complete | execution_cancelled
//! ```
//!
//! Events go two places. A single live subscriber per execution receives
//! them over a bounded channel (encoded as SSE by the transport layer)
//! and every event is also appended to the active step's durable record.
//! If the live subscriber disconnects or cannot keep up, further live
//! events for it are dropped; the durable history is unaffected.
//!
//! Payloads carry digests (`arguments_digest`, `delta_digest`) rather than
//! full values: short stable hashes sufficient for correlation without
//! duplicating state into the stream.

use orchid_checkpoint::ExecutionStatus;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Short stable hash of a JSON value, for event payloads.
pub fn digest(value: &Value) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// A node lifecycle or execution lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStart {
        execution_id: String,
        thread_id: String,
    },
    NodeStart {
        node_id: String,
        step_index: u64,
    },
    ToolCall {
        node_id: String,
        tool_id: String,
        arguments_digest: String,
    },
    ToolResult {
        node_id: String,
        tool_id: String,
        status: String,
        result_digest: String,
    },
    NodeComplete {
        node_id: String,
        step_index: u64,
        delta_digest: String,
    },
    NodeError {
        node_id: String,
        step_index: u64,
        error_kind: String,
        detail: String,
    },
    ExecutionComplete {
        status: ExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    ExecutionCancelled,
}

impl ExecutionEvent {
    /// SSE event name, exactly as emitted on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStart { .. } => "execution_start",
            ExecutionEvent::NodeStart { .. } => "node_start",
            ExecutionEvent::ToolCall { .. } => "tool_call",
            ExecutionEvent::ToolResult { .. } => "tool_result",
            ExecutionEvent::NodeComplete { .. } => "node_complete",
            ExecutionEvent::NodeError { .. } => "node_error",
            ExecutionEvent::ExecutionComplete { .. } => "execution_complete",
            ExecutionEvent::ExecutionCancelled => "execution_cancelled",
        }
    }

    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionComplete { .. } | ExecutionEvent::ExecutionCancelled
        )
    }

    /// Event payload without the discriminant.
    pub fn payload(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("event");
        }
        value
    }

    /// Encode as one SSE frame: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.payload())
    }
}

/// Producer half of the per-execution live stream.
///
/// Publishing never blocks and never fails the execution: a full buffer
/// drops the event, a closed receiver permanently disconnects the
/// subscriber.
pub struct EventPublisher {
    live: Option<mpsc::Sender<ExecutionEvent>>,
    disconnected: AtomicBool,
}

/// Consumer half: a stream of events ending with a terminal event.
pub type EventStream = ReceiverStream<ExecutionEvent>;

impl EventPublisher {
    /// A publisher with no live subscriber; events go only to step records.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            live: None,
            disconnected: AtomicBool::new(false),
        })
    }

    /// A publisher with one live subscriber, buffered to `capacity`.
    pub fn with_subscriber(capacity: usize) -> (Arc<Self>, EventStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                live: Some(tx),
                disconnected: AtomicBool::new(false),
            }),
            ReceiverStream::new(rx),
        )
    }

    /// Publish to the live subscriber, if any.
    pub fn publish(&self, event: ExecutionEvent) {
        let Some(sender) = &self.live else {
            return;
        };
        if self.disconnected.load(Ordering::Relaxed) {
            return;
        }
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                // Bounded backpressure: a slow subscriber loses events
                // rather than stalling the execution.
                tracing::debug!(event = event.name(), "live subscriber lagging, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.disconnected.store(true, Ordering::Relaxed);
                tracing::debug!("live subscriber disconnected");
            }
        }
    }
}

/// Per-node event scope handed to executors and the tool loop.
///
/// Forwards live events through the execution's publisher and accumulates
/// the durable records that become the step's `events` list.
#[derive(Clone)]
pub struct NodeEvents {
    publisher: Arc<EventPublisher>,
    node_id: String,
    records: Arc<StdMutex<Vec<Value>>>,
}

impl NodeEvents {
    pub fn new(publisher: Arc<EventPublisher>, node_id: impl Into<String>) -> Self {
        Self {
            publisher,
            node_id: node_id.into(),
            records: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// A tool call is about to execute.
    pub fn tool_call(&self, tool_id: &str, args: &Value) {
        self.publisher.publish(ExecutionEvent::ToolCall {
            node_id: self.node_id.clone(),
            tool_id: tool_id.to_string(),
            arguments_digest: digest(args),
        });
    }

    /// A tool call finished; records the full invocation durably.
    pub fn tool_result(
        &self,
        tool_id: &str,
        args: &Value,
        started_at: chrono::DateTime<chrono::Utc>,
        outcome: &std::result::Result<Value, crate::tool::ToolError>,
    ) {
        let finished_at = chrono::Utc::now();
        let (status, payload) = match outcome {
            Ok(result) => ("ok", result.clone()),
            Err(err) => ("error", err.to_result_value()),
        };
        self.publisher.publish(ExecutionEvent::ToolResult {
            node_id: self.node_id.clone(),
            tool_id: tool_id.to_string(),
            status: status.to_string(),
            result_digest: digest(&payload),
        });
        self.push_record(serde_json::json!({
            "type": "tool_invocation",
            "tool_id": tool_id,
            "arguments": args,
            "started_at": started_at,
            "finished_at": finished_at,
            "status": status,
            "result": payload,
        }));
    }

    /// A router picked its target.
    pub fn router_decision(&self, target: &str) {
        self.push_record(serde_json::json!({
            "type": "router_decision",
            "target": target,
        }));
    }

    /// Arbitrary durable record.
    pub fn push_record(&self, record: Value) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Drain the durable records into the step record.
    pub fn take_records(&self) -> Vec<Value> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[test]
    fn sse_encoding_shape() {
        let event = ExecutionEvent::NodeStart {
            node_id: "agent".into(),
            step_index: 2,
        };
        let sse = event.to_sse();
        assert!(sse.starts_with("event: node_start\ndata: {"));
        assert!(sse.ends_with("\n\n"));
        assert!(sse.contains("\"node_id\":\"agent\""));
        assert!(!sse.contains("\"event\""));
    }

    #[test]
    fn digests_are_stable_and_distinct() {
        let a = digest(&json!({"q": "rust"}));
        let b = digest(&json!({"q": "rust"}));
        let c = digest(&json!({"q": "go"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn publisher_delivers_in_order() {
        let (publisher, mut stream) = EventPublisher::with_subscriber(16);
        publisher.publish(ExecutionEvent::ExecutionStart {
            execution_id: "e".into(),
            thread_id: "t".into(),
        });
        publisher.publish(ExecutionEvent::ExecutionCancelled);

        assert_eq!(stream.next().await.unwrap().name(), "execution_start");
        assert_eq!(stream.next().await.unwrap().name(), "execution_cancelled");
    }

    #[tokio::test]
    async fn full_buffer_drops_not_blocks() {
        let (publisher, _stream) = EventPublisher::with_subscriber(1);
        publisher.publish(ExecutionEvent::ExecutionCancelled);
        // Buffer is full; this must return immediately without blocking.
        publisher.publish(ExecutionEvent::ExecutionCancelled);
    }

    #[tokio::test]
    async fn closed_subscriber_marks_disconnected() {
        let (publisher, stream) = EventPublisher::with_subscriber(4);
        drop(stream);
        publisher.publish(ExecutionEvent::ExecutionCancelled);
        assert!(publisher.disconnected.load(Ordering::Relaxed));
    }

    #[test]
    fn node_events_accumulate_records() {
        let events = NodeEvents::new(EventPublisher::disabled(), "router");
        events.router_decision("path_a");
        let records = events.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["type"], "router_decision");
        assert_eq!(records[0]["target"], "path_a");
        assert!(events.take_records().is_empty());
    }
}
