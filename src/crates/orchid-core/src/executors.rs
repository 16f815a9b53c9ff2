//! Node executors: the closed dispatch over the five node kinds.
//!
//! Every executor is a pure function of `(state snapshot, node, context)`
//! to a [`NodeOutcome`]. Executors never mutate state (they return a
//! delta for the scheduler to merge) and they never abort the execution
//! directly: failures are values the scheduler routes through catch
//! edges, join failure policies, or the execution's terminal status.

use crate::compiler::{CompiledKind, CompiledNode};
use crate::error::GraphError;
use crate::event::{EventPublisher, NodeEvents};
use crate::execution::{CancelToken, ExecutionOptions, ExecutionRequest};
use crate::graph::{NodeId, OnBudget};
use crate::scheduler::GraphRuntime;
use crate::tool_loop::{ToolLoop, ToolLoopConfig, DEFAULT_MAX_ITERATIONS};
use orchid_checkpoint::{Checkpointer, ExecutionStatus, JoinProgress};
use serde_json::{json, Value};
use std::sync::Arc;

/// What a node produced.
#[derive(Debug)]
pub enum NodeOutcome {
    /// Merge `delta` into state and push `next` onto the frontier.
    StateUpdate { delta: Value, next: Vec<NodeId> },
    /// Pause the execution; the node stays on the frontier and re-runs
    /// when the thread is resumed with new input.
    Suspend { reason: String },
    /// The node failed; the scheduler consults catch edges and join
    /// failure policies.
    Fail { error: GraphError },
}

/// Everything an executor may touch.
pub(crate) struct NodeContext<'a> {
    pub state: &'a Value,
    pub cancel: &'a CancelToken,
    pub events: &'a NodeEvents,
    pub options: &'a ExecutionOptions,
    pub checkpointer: &'a Arc<dyn Checkpointer>,
    pub publisher: &'a Arc<EventPublisher>,
    pub thread_id: &'a str,
    /// Ledger snapshot for JOIN nodes.
    pub join_progress: Option<JoinProgress>,
}

/// Dispatch on node kind.
pub(crate) async fn execute_node(node: &CompiledNode, ctx: NodeContext<'_>) -> NodeOutcome {
    match &node.kind {
        CompiledKind::Agent(agent) => execute_agent(node, agent, ctx).await,
        CompiledKind::Router(router) => {
            let target = router.select(ctx.state);
            tracing::debug!(node = %node.id, %target, "router decision");
            ctx.events.router_decision(target);
            NodeOutcome::StateUpdate {
                delta: json!({}),
                next: vec![target.to_string()],
            }
        }
        CompiledKind::Parallel { branches } => NodeOutcome::StateUpdate {
            delta: json!({}),
            next: branches.clone(),
        },
        CompiledKind::Join(join) => {
            let progress = ctx.join_progress.unwrap_or_default();
            match join.aggregation.aggregate(&progress.completed) {
                Ok(delta) => NodeOutcome::StateUpdate {
                    delta,
                    next: node.next.clone(),
                },
                Err(error) => NodeOutcome::Fail { error },
            }
        }
        CompiledKind::Subgraph(subgraph) => execute_subgraph(node, subgraph, ctx).await,
    }
}

async fn execute_agent(
    node: &CompiledNode,
    agent: &crate::compiler::CompiledAgent,
    ctx: NodeContext<'_>,
) -> NodeOutcome {
    let bundle = if agent.input_mapping.is_empty() {
        ctx.state.clone()
    } else {
        agent.input_mapping.apply(ctx.state)
    };

    let config = ToolLoopConfig {
        max_iterations: agent
            .max_iterations
            .or(agent.binding.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS),
        tool_timeout: ctx.options.tool_timeout,
        iteration_timeout: ctx.options.iteration_timeout,
        provider_retry: ctx.options.provider_retry.clone(),
    };

    let mut tool_loop = ToolLoop::new(
        agent.binding.model.clone(),
        agent.binding.model_config.clone(),
        agent.binding.system_prompt.clone(),
        agent.binding.tools.clone(),
    )
    .with_config(config);
    if let Some(schema) = &agent.binding.output_schema {
        tool_loop = match tool_loop.with_output_schema(schema.clone()) {
            Ok(tool_loop) => tool_loop,
            Err(error) => return NodeOutcome::Fail { error },
        };
    }

    match tool_loop.run(bundle, ctx.cancel, ctx.events).await {
        Ok(output) => NodeOutcome::StateUpdate {
            delta: json!({ &agent.output_key: output.response }),
            next: node.next.clone(),
        },
        Err(GraphError::ToolLoopBudgetExhausted {
            iterations,
            transcript,
        }) if agent.on_budget == OnBudget::ReturnPartial => {
            // Budget hit but the node is configured to complete with what
            // the model said last.
            let partial = transcript
                .iter()
                .rev()
                .find(|m| m.is_assistant())
                .map(|m| m.content.to_value())
                .unwrap_or(Value::Null);
            ctx.events.push_record(json!({
                "type": "budget_exhausted_partial",
                "iterations": iterations,
            }));
            NodeOutcome::StateUpdate {
                delta: json!({ &agent.output_key: partial }),
                next: node.next.clone(),
            }
        }
        Err(error) => NodeOutcome::Fail { error },
    }
}

async fn execute_subgraph(
    node: &CompiledNode,
    subgraph: &crate::compiler::CompiledSubgraph,
    ctx: NodeContext<'_>,
) -> NodeOutcome {
    let projected = if subgraph.input_mapping.is_empty() {
        ctx.state.clone()
    } else {
        subgraph.input_mapping.apply(ctx.state)
    };

    // The child shares the parent's checkpointer under a namespaced
    // thread, so pausing and resuming nests.
    let child_thread = format!("{}/{}", ctx.thread_id, node.id);
    let runtime = GraphRuntime::new(subgraph.graph.clone(), ctx.checkpointer.clone())
        .with_options(ctx.options.clone());
    let request = ExecutionRequest::new(projected).with_thread_id(child_thread);

    // The child's own lifecycle events stay out of the parent's stream;
    // cancellation and timeouts still propagate through the shared token
    // and the parent's per-node budget.
    let result = Box::pin(runtime.run_with(
        request,
        EventPublisher::disabled(),
        ctx.cancel.clone(),
    ))
    .await;

    match result {
        Ok(response) => match response.status {
            ExecutionStatus::Completed => NodeOutcome::StateUpdate {
                delta: json!({ &subgraph.output_key: response.output.unwrap_or(Value::Null) }),
                next: node.next.clone(),
            },
            ExecutionStatus::AwaitingInput => NodeOutcome::Suspend {
                reason: response
                    .awaiting_input_reason
                    .unwrap_or_else(|| format!("subgraph '{}' is awaiting input", node.id)),
            },
            ExecutionStatus::Cancelled => NodeOutcome::Fail {
                error: GraphError::Cancelled,
            },
            _ => NodeOutcome::Fail {
                error: GraphError::NodeExecution {
                    node: node.id.clone(),
                    detail: response
                        .error
                        .map(|e| format!("{}: {}", e.kind, e.detail))
                        .unwrap_or_else(|| "subgraph failed".into()),
                },
            },
        },
        Err(error) => NodeOutcome::Fail { error },
    }
}
