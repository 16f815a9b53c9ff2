//! Error types for graph compilation and execution.
//!
//! Two layers, mirroring when things can go wrong:
//!
//! - [`CompileError`]: structural, reachability, cycle, pairing, and
//!   condition errors. All graph-shape problems surface here, at compile
//!   time, so runtime failures are purely data- or side-effect-dependent.
//! - [`GraphError`]: everything the runtime can produce: timeouts,
//!   cancellation, tool-loop budget exhaustion, structured-output
//!   validation, provider failures, checkpoint storage failures.
//!
//! Tool failures are deliberately *not* here: they are surfaced to the
//! agent as structured tool results (see [`crate::tool::ToolError`]) so
//! the model can observe and recover from them within the same loop.

use crate::condition::ConditionParseError;
use crate::mapping::MappingParseError;
use crate::messages::Message;
use crate::state::StateError;
use orchid_checkpoint::CheckpointError;
use thiserror::Error;

/// Graph-shape errors, produced only by [`compile`](crate::compiler::compile).
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("node id '{0}' is reserved")]
    ReservedNodeId(String),

    #[error("'{referenced}' referenced by {by} does not exist")]
    UnknownNode { referenced: String, by: String },

    #[error("entry point '{0}' does not exist")]
    MissingEntryPoint(String),

    #[error("the end sentinel is not reachable from any path")]
    NoPathToEnd,

    #[error("edge '{0}' targets the start sentinel, which is only valid as a source")]
    EdgeToStart(String),

    #[error("edge '{0}' leaves the end sentinel, which is only valid as a target")]
    EdgeFromEnd(String),

    #[error("router '{0}' has no outgoing edges")]
    RouterWithoutRoutes(String),

    #[error("parallel node '{node}' fans out to {found} branches, need at least 2")]
    ParallelFanOutTooSmall { node: String, found: usize },

    #[error("join node '{node}' has {found} incoming edges, need at least 2")]
    JoinFanInTooSmall { node: String, found: usize },

    #[error(
        "join '{node}' wait_for {declared:?} does not match incoming predecessors {expected:?}"
    )]
    WaitForMismatch {
        node: String,
        declared: Vec<String>,
        expected: Vec<String>,
    },

    #[error("unconditional cycle through {0:?}; add a router with an exit route")]
    UnconditionalCycle(Vec<String>),

    #[error("parallel node '{parallel}' branches converge on multiple joins: {joins:?}")]
    AmbiguousJoin {
        parallel: String,
        joins: Vec<String>,
    },

    #[error(transparent)]
    Condition(#[from] ConditionParseError),

    #[error(transparent)]
    Mapping(#[from] MappingParseError),

    #[error("invalid config for node '{node}': {detail}")]
    InvalidNodeConfig { node: String, detail: String },

    #[error("join '{node}' names unknown reducer '{name}'")]
    UnknownReducer { node: String, name: String },

    #[error("cannot resolve '{reference}': {detail}")]
    Resolution { reference: String, detail: String },

    #[error("subgraph nesting depth {depth} exceeds limit {limit}")]
    NestingDepthExceeded { depth: usize, limit: usize },

    #[error(
        "router '{router}' runs inside a parallel region but its condition reads '{property}', \
         which a sibling branch writes"
    )]
    CrossBranchCondition { router: String, property: String },

    #[error("state schema: {0}")]
    StateSchema(String),
}

/// Errors produced while executing a compiled graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("node '{node}' failed: {detail}")]
    NodeExecution { node: String, detail: String },

    #[error("node '{node}' exceeded its timeout")]
    NodeTimeout { node: String },

    #[error("execution exceeded its timeout")]
    ExecutionTimeout,

    #[error("execution cancelled")]
    Cancelled,

    /// The agent tool loop hit its iteration cap. Carries the final
    /// message list so callers can inspect (or return) the transcript.
    #[error("tool loop exhausted its budget of {iterations} iterations")]
    ToolLoopBudgetExhausted {
        iterations: usize,
        transcript: Vec<Message>,
    },

    #[error("structured output failed validation: {0}")]
    SchemaValidation(String),

    #[error("provider error: {detail}")]
    Provider { detail: String, retryable: bool },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GraphError {
    /// Stable kind discriminant, used in step records and events.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphError::Compile(_) => "COMPILE",
            GraphError::State(_) => "STATE",
            GraphError::NodeExecution { .. } => "NODE_EXECUTION",
            GraphError::NodeTimeout { .. } => "NODE_TIMEOUT",
            GraphError::ExecutionTimeout => "EXECUTION_TIMEOUT",
            GraphError::Cancelled => "CANCELLED",
            GraphError::ToolLoopBudgetExhausted { .. } => "TOOL_LOOP_BUDGET_EXHAUSTED",
            GraphError::SchemaValidation(_) => "SCHEMA_VALIDATION",
            GraphError::Provider { .. } => "PROVIDER",
            GraphError::Checkpoint(_) => "CHECKPOINT",
            GraphError::Serialization(_) => "SERIALIZATION",
            GraphError::Yaml(_) => "SERIALIZATION",
            GraphError::Configuration(_) => "CONFIGURATION",
        }
    }

    /// Whether retrying the failed operation could plausibly succeed.
    pub fn retryable(&self) -> bool {
        match self {
            GraphError::Provider { retryable, .. } => *retryable,
            GraphError::NodeTimeout { .. } | GraphError::Checkpoint(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(GraphError::Cancelled.kind(), "CANCELLED");
        assert_eq!(GraphError::ExecutionTimeout.kind(), "EXECUTION_TIMEOUT");
        assert_eq!(
            GraphError::ToolLoopBudgetExhausted {
                iterations: 10,
                transcript: vec![],
            }
            .kind(),
            "TOOL_LOOP_BUDGET_EXHAUSTED"
        );
    }

    #[test]
    fn provider_retryability_propagates() {
        let retryable = GraphError::Provider {
            detail: "rate limited".into(),
            retryable: true,
        };
        let fatal = GraphError::Provider {
            detail: "invalid api key".into(),
            retryable: false,
        };
        assert!(retryable.retryable());
        assert!(!fatal.retryable());
    }

    #[test]
    fn compile_errors_display_context() {
        let err = CompileError::WaitForMismatch {
            node: "join".into(),
            declared: vec!["a".into()],
            expected: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("join"));
    }
}
