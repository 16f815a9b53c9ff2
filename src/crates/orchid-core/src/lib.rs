//! # orchid-core: persisted, resumable, streaming agent orchestration
//!
//! The execution engine behind orchid workflows: compile a declarative
//! graph of LLM agents and tools into an immutable dataflow, run it under
//! a super-step scheduler with deterministic state merging, checkpoint
//! after every step, and stream lifecycle events to a live subscriber.
//!
//! ## The shape of a workflow
//!
//! A workflow is a [`GraphSpec`]: nodes of five kinds (`AGENT`, `ROUTER`,
//! `PARALLEL`, `JOIN`, `SUBGRAPH`), ordered edges with optional router
//! conditions, and a JSON Schema for the state object whose properties
//! declare merge rules. Descriptions are pure data: they round-trip
//! through YAML/JSON and are compiled by [`compiler::compile`] into a
//! [`CompiledGraph`] shared across executions.
//!
//! ## Execution model
//!
//! Execution follows a super-step loop ([`GraphRuntime`]): all frontier
//! nodes run concurrently, their deltas merge in lexicographic node-id
//! order under the per-property merge rules, the join ledger advances,
//! events are emitted, and a [`Checkpoint`](orchid_checkpoint::Checkpoint)
//! is written. Reaching the end sentinel completes the execution; a pause
//! (interrupt or suspended subgraph) checkpoints and returns
//! `AWAITING_INPUT`, resumable later by thread id with new input overlaid
//! under the same merge rules.
//!
//! Inside every `AGENT` node runs the bounded [`tool_loop`]: a
//! ReAct-style conversation against a [`ChatModel`](llm::ChatModel) with
//! schema-validated tool calls, structured-output validation, provider
//! retries with backoff, and a hard iteration cap.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use orchid_core::{compile, CompileOptions, ExecutionRequest, GraphRuntime, GraphSpec};
//! use orchid_checkpoint::MemoryCheckpointer;
//! use std::sync::Arc;
//!
//! let spec = GraphSpec::from_yaml_str(WORKFLOW_YAML)?;
//! let graph = compile(&spec, &my_resolver, &CompileOptions::default()).await?;
//!
//! let runtime = GraphRuntime::new(graph, Arc::new(MemoryCheckpointer::new()));
//! let response = runtime
//!     .invoke(ExecutionRequest::new(serde_json::json!({"question": "why?"})))
//!     .await?;
//! println!("{:?}: {:?}", response.status, response.output);
//! ```
//!
//! ## Module map
//!
//! - [`graph`]: declarative descriptions ([`GraphSpec`], node kinds,
//!   sentinels)
//! - [`compiler`]: validation passes, reference resolution,
//!   [`CompiledGraph`]
//! - [`state`]: merge rules and deterministic delta merging
//! - [`condition`]: the sandboxed router predicate language
//! - [`mapping`]: `$.`-selector input mappings
//! - [`scheduler`]: the super-step runtime ([`GraphRuntime`])
//! - [`executors`]: the closed executor dispatch ([`NodeOutcome`])
//! - [`tool_loop`]: the bounded agent loop
//! - [`tool`]: the [`Tool`] trait, registry, and validating invoker
//! - [`llm`]: the provider seam ([`llm::ChatModel`])
//! - [`messages`]: transcript message types
//! - [`event`]: lifecycle events, SSE encoding, the live subscriber
//! - [`execution`]: requests, records, options, cancellation
//! - [`retry`]: exponential backoff for provider failures
//! - [`error`]: the [`GraphError`]/[`CompileError`] taxonomy

pub mod compiler;
pub mod condition;
pub mod error;
pub mod event;
pub mod execution;
pub mod executors;
pub mod graph;
pub mod llm;
pub mod mapping;
pub mod messages;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod tool;
pub mod tool_loop;

pub use compiler::{
    compile, AgentBinding, CompileOptions, CompiledGraph, JoinAggregation, JoinReducer, Resolver,
    MAX_SUBGRAPH_DEPTH,
};
pub use condition::Predicate;
pub use error::{CompileError, GraphError, Result};
pub use event::{digest, EventPublisher, EventStream, ExecutionEvent, NodeEvents};
pub use execution::{
    CancelHandle, CancelToken, ExecutionErrorInfo, ExecutionOptions, ExecutionRecord,
    ExecutionRequest, ExecutionResponse,
};
pub use executors::NodeOutcome;
pub use graph::{
    AgentNodeConfig, EdgeSpec, FailurePolicy, GraphSpec, JoinNodeConfig, NodeKind, NodeSpec,
    OnBudget, SubgraphNodeConfig, END, START,
};
pub use llm::{ChatModel, ChatRequest, ChatResponse, ModelConfig, ToolDefinition, UsageMetadata};
pub use mapping::{InputMapping, Selector};
pub use messages::{Message, MessageContent, MessageRole, ToolCall};
pub use retry::RetryPolicy;
pub use scheduler::{ExecutionHandle, GraphRuntime};
pub use state::{MergeRule, StateSchema, PLAN_CONFIRMED_KEY, STEP_KEY, THREAD_ID_KEY};
pub use tool::{Tool, ToolBinding, ToolError, ToolRegistry, ToolResult};
pub use tool_loop::{LoopOutput, ToolLoop, ToolLoopConfig, DEFAULT_MAX_ITERATIONS};

// Re-export the checkpoint crate's surface the runtime hands back to
// callers.
pub use orchid_checkpoint::{Checkpoint, Checkpointer, ExecutionStatus, StepRecord};
