//! Checkpoint and step-record data model.
//!
//! A [`Checkpoint`] is the complete resume context for one execution
//! thread: the merged state after a super-step, the frontier of nodes
//! eligible for the next super-step, and the join ledger tracking partially
//! satisfied fan-ins. Pause/resume across a request boundary is never a
//! suspended stack frame; this triple is everything the scheduler needs to
//! continue.
//!
//! A [`StepRecord`] is the durable history entry written once per node
//! completion: input snapshot, output delta, and the events observed while
//! the node ran.
//!
//! # Thread isolation
//!
//! Checkpoints are keyed by `thread_id`. Two different thread ids have
//! completely independent checkpoint chains:
//!
//! ```rust
//! use orchid_checkpoint::Checkpoint;
//! use serde_json::json;
//!
//! let a = Checkpoint::new("session-alice", "exec-1", json!({"n": 1}));
//! let b = Checkpoint::new("session-bob", "exec-2", json!({"n": 2}));
//! assert_ne!(a.thread_id, b.thread_id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle status of an execution.
///
/// Exactly one terminal status is ever assigned; `AwaitingInput` is the
/// only non-terminal status a checkpointed thread can be left in between
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingInput,
}

impl ExecutionStatus {
    /// Whether this status is terminal (the execution can never advance).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Progress of a single join node: which declared predecessors have
/// completed (with their deltas awaiting aggregation) and which failed.
///
/// `BTreeMap` keeps predecessor iteration in lexicographic node-id order so
/// aggregation is deterministic regardless of completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinProgress {
    /// Completed predecessors and the deltas they contributed.
    pub completed: BTreeMap<String, Value>,
    /// Failed predecessors and the error detail recorded for each.
    pub failed: BTreeMap<String, String>,
}

impl JoinProgress {
    /// Total number of predecessors accounted for so far.
    pub fn arrived(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// Join-node id to in-flight progress, serialized into every checkpoint so
/// a resumed execution does not re-await predecessors that already ran.
pub type JoinLedgerState = BTreeMap<String, JoinProgress>;

/// Resume context for one thread, written atomically after every
/// completed super-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// External token tying executions to this checkpoint chain.
    pub thread_id: String,
    /// Execution that produced this checkpoint.
    pub execution_id: String,
    /// Status of that execution as of this checkpoint.
    pub status: ExecutionStatus,
    /// Super-step ordinal, strictly increasing per thread.
    pub step_index: u64,
    /// Merged state after the super-step.
    pub state: Value,
    /// Node ids eligible to execute in the next super-step.
    pub frontier: Vec<String>,
    /// Partially satisfied joins.
    #[serde(default)]
    pub join_ledger: JoinLedgerState,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a step-zero checkpoint for a fresh thread.
    pub fn new(
        thread_id: impl Into<String>,
        execution_id: impl Into<String>,
        state: Value,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            execution_id: execution_id.into(),
            status: ExecutionStatus::Running,
            step_index: 0,
            state,
            frontier: Vec::new(),
            join_ledger: JoinLedgerState::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder-style frontier assignment.
    pub fn with_frontier(mut self, frontier: Vec<String>) -> Self {
        self.frontier = frontier;
        self
    }

    /// Builder-style status assignment.
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder-style step index assignment.
    pub fn with_step_index(mut self, step_index: u64) -> Self {
        self.step_index = step_index;
        self
    }

    /// Builder-style join-ledger assignment.
    pub fn with_join_ledger(mut self, ledger: JoinLedgerState) -> Self {
        self.join_ledger = ledger;
        self
    }
}

/// Error captured on a failed or cancelled step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Stable error-kind discriminant (e.g. `NODE_TIMEOUT`, `TOOL_LOOP_BUDGET`).
    pub kind: String,
    /// Human-readable detail.
    pub detail: String,
    /// Whether a retry could plausibly succeed.
    #[serde(default)]
    pub retryable: bool,
}

/// Durable record of one node completion within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Owning execution.
    pub execution_id: String,
    /// Super-step ordinal at which the node ran.
    pub step_index: u64,
    /// Node that ran.
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// State snapshot the node observed.
    pub input_state: Value,
    /// Delta the node produced (empty object for routers/parallels).
    pub output_delta: Value,
    /// Events observed while the node ran, in emission order. Includes
    /// tool invocation records and routing decisions.
    #[serde(default)]
    pub events: Vec<Value>,
    /// Present when the step failed or was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepRecord {
    /// Start a record at the current instant; `finish`/`finish_err` stamp
    /// the end time.
    pub fn begin(
        execution_id: impl Into<String>,
        step_index: u64,
        node_id: impl Into<String>,
        input_state: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            step_index,
            node_id: node_id.into(),
            started_at: now,
            finished_at: now,
            input_state,
            output_delta: Value::Object(Default::default()),
            events: Vec::new(),
            error: None,
        }
    }

    /// Complete the record with the node's delta.
    pub fn finish(mut self, output_delta: Value) -> Self {
        self.finished_at = Utc::now();
        self.output_delta = output_delta;
        self
    }

    /// Complete the record with an error.
    pub fn finish_err(mut self, error: StepError) -> Self {
        self.finished_at = Utc::now();
        self.error = Some(error);
        self
    }

    /// Append an observed event.
    pub fn push_event(&mut self, event: Value) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::AwaitingInput.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn checkpoint_roundtrip() {
        let cp = Checkpoint::new("t1", "e1", json!({"items": [1, 2]}))
            .with_frontier(vec!["a".into(), "b".into()])
            .with_step_index(3);

        let encoded = serde_json::to_string(&cp).unwrap();
        let decoded: Checkpoint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, cp);
    }

    #[test]
    fn join_progress_counts_both_outcomes() {
        let mut progress = JoinProgress::default();
        progress.completed.insert("a".into(), json!({"x": 1}));
        progress.failed.insert("b".into(), "boom".into());
        assert_eq!(progress.arrived(), 2);
    }

    #[test]
    fn step_record_event_order_preserved() {
        let mut record = StepRecord::begin("e1", 0, "agent", json!({}));
        record.push_event(json!({"type": "tool_call", "tool_id": "search"}));
        record.push_event(json!({"type": "tool_result", "tool_id": "search"}));
        assert_eq!(record.events[0]["type"], "tool_call");
        assert_eq!(record.events[1]["type"], "tool_result");
    }
}
