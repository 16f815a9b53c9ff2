//! Execution-scoped types: requests, records, options, cancellation.
//!
//! An [`ExecutionRequest`] supplies the initial input and an optional
//! `thread_id` (whose presence triggers resume semantics). The scheduler
//! maintains an [`ExecutionRecord`] through the run and answers with an
//! [`ExecutionResponse`]. [`ExecutionOptions`] carries the nested timeout
//! budgets and concurrency bounds; [`CancelToken`] is the cooperative
//! cancellation signal threaded through every node, tool call, and the
//! tool loop.

use crate::error::{GraphError, Result};
use chrono::{DateTime, Utc};
use orchid_checkpoint::ExecutionStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Cooperative cancellation signal.
///
/// Cancellation is observed, never preemptive: in-flight work may finish,
/// but its deltas are discarded, and no new LLM call, tool invocation, or
/// checkpoint write starts after the signal fires.
#[derive(Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

/// Owner side of a [`CancelToken`].
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (sender, receiver) = watch::channel(false);
        (CancelHandle { sender }, CancelToken { receiver })
    }

    /// A token that can never be cancelled (tests, fire-and-forget).
    pub fn never() -> CancelToken {
        static NEVER: std::sync::OnceLock<CancelToken> = std::sync::OnceLock::new();
        NEVER
            .get_or_init(|| {
                let (handle, token) = CancelToken::new();
                // One process-lifetime sender keeps the channel open.
                std::mem::forget(handle);
                token
            })
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Error out if cancellation has been signalled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GraphError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation fires.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                // Sender dropped without cancelling; treat as never.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// Timeout budgets and concurrency bounds for one execution.
///
/// The four timeout layers nest strictly: whole-execution > per-node >
/// per-tool-loop-iteration > per-tool-call. An inner layer firing fails
/// only its own scope; the outer firing cancels all nested work.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Whole-execution budget. `None` = unbounded.
    pub execution_timeout: Option<Duration>,
    /// Per-node budget.
    pub node_timeout: Duration,
    /// Per-tool-loop-iteration budget. `None` = bounded by the node budget.
    pub iteration_timeout: Option<Duration>,
    /// Per-tool-call budget.
    pub tool_timeout: Duration,
    /// Bound on concurrent node executions within one super-step.
    /// `None` = unbounded (I/O-bound LLM and tool calls).
    pub max_parallelism: Option<usize>,
    /// Live event buffer capacity.
    pub event_buffer: usize,
    /// Backoff policy for retryable provider failures.
    pub provider_retry: crate::retry::RetryPolicy,
    /// Nodes the scheduler pauses before instead of executing: the
    /// execution checkpoints and returns `AWAITING_INPUT` with the node
    /// left on the frontier. Resuming the thread disarms the pause for
    /// the checkpointed frontier, so the node runs with the overlaid
    /// input.
    pub interrupt_before: std::collections::HashSet<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            execution_timeout: None,
            node_timeout: Duration::from_secs(300),
            iteration_timeout: None,
            tool_timeout: Duration::from_secs(60),
            max_parallelism: None,
            event_buffer: 256,
            provider_retry: crate::retry::RetryPolicy::default(),
            interrupt_before: std::collections::HashSet::new(),
        }
    }
}

impl ExecutionOptions {
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_max_parallelism(mut self, bound: usize) -> Self {
        self.max_parallelism = Some(bound);
        self
    }

    pub fn with_provider_retry(mut self, policy: crate::retry::RetryPolicy) -> Self {
        self.provider_retry = policy;
        self
    }

    /// Pause before this node: checkpoint and return `AWAITING_INPUT`
    /// instead of executing it. Resume runs it with the overlaid input.
    pub fn with_interrupt_before(mut self, node: impl Into<String>) -> Self {
        self.interrupt_before.insert(node.into());
        self
    }
}

/// One execution request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Initial input, merged into state under property-wise rules.
    #[serde(default)]
    pub input: Value,
    /// Presence triggers resume semantics against this thread's
    /// checkpoint chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            thread_id: None,
        }
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Error summary surfaced on failed executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionErrorInfo {
    pub kind: String,
    pub detail: String,
}

impl From<&GraphError> for ExecutionErrorInfo {
    fn from(err: &GraphError) -> Self {
        Self {
            kind: err.kind().to_string(),
            detail: err.to_string(),
        }
    }
}

/// Mutable record of one execution's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_name: String,
    pub thread_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(workflow_name: impl Into<String>, thread_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4().to_string(),
            workflow_name: workflow_name.into(),
            thread_id: thread_id.into(),
            status: ExecutionStatus::Pending,
            current_node: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// The caller-facing result of an execution (or phase of one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub thread_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_input_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_token_observes_signal() {
        let (handle, token) = CancelToken::new();
        assert!(token.check().is_ok());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(GraphError::Cancelled)));
        // cancelled() resolves promptly once the signal fired.
        token.cancelled().await;
    }

    #[tokio::test]
    async fn never_token_is_uncancellable() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn options_defaults_are_sane() {
        let options = ExecutionOptions::default();
        assert!(options.execution_timeout.is_none());
        assert!(options.node_timeout > Duration::ZERO);
        assert!(options.tool_timeout < options.node_timeout);
    }

    #[test]
    fn record_status_updates_touch_timestamp() {
        let mut record = ExecutionRecord::new("wf", "t1");
        let created = record.updated_at;
        record.set_status(ExecutionStatus::Running);
        assert!(record.updated_at >= created);
        assert_eq!(record.status, ExecutionStatus::Running);
    }
}
