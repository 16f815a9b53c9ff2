//! The super-step scheduler.
//!
//! [`GraphRuntime`] drives a [`CompiledGraph`] against a checkpointer:
//!
//! 1. Load the thread's checkpoint (resume) or initialize state from the
//!    request input.
//! 2. While the frontier is non-empty: execute every ready node
//!    concurrently under its timeout, merge the resulting deltas in
//!    lexicographic node-id order, update the join ledger, emit events,
//!    checkpoint, and advance.
//! 3. Terminal status on an empty frontier (`COMPLETED`), an unhandled
//!    failure (`FAILED`), cancellation, or a pause (`AWAITING_INPUT`).
//!
//! # Ordering guarantees
//!
//! Within a super-step, deltas merge deterministically regardless of task
//! completion order. Across super-steps the `__step__` counter is strictly
//! monotonic, so any step reading a property observes a strictly smaller
//! step index on its writer.
//!
//! # Cancellation
//!
//! Cancellation is cooperative: in-flight nodes may finish, but their
//! deltas are discarded, their steps are reported cancelled, and no new
//! model call, tool invocation, or checkpoint write starts afterwards.

use crate::compiler::{CompiledGraph, CompiledKind};
use crate::error::{GraphError, Result};
use crate::event::{digest, EventPublisher, EventStream, ExecutionEvent, NodeEvents};
use crate::execution::{
    CancelHandle, CancelToken, ExecutionErrorInfo, ExecutionOptions, ExecutionRecord,
    ExecutionRequest, ExecutionResponse,
};
use crate::executors::{execute_node, NodeContext, NodeOutcome};
use crate::graph::{NodeId, END, START};
use crate::state::STEP_KEY;
use orchid_checkpoint::{
    Checkpoint, Checkpointer, ExecutionStatus, JoinLedgerState, StepError, StepRecord,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Executes a compiled graph. Cheap to clone; safe to share.
#[derive(Clone)]
pub struct GraphRuntime {
    graph: CompiledGraph,
    checkpointer: Arc<dyn Checkpointer>,
    options: ExecutionOptions,
}

/// A running execution started with [`GraphRuntime::start`].
pub struct ExecutionHandle {
    events: Option<EventStream>,
    cancel: CancelHandle,
    task: tokio::task::JoinHandle<Result<ExecutionResponse>>,
}

impl ExecutionHandle {
    /// The live event stream. Take it once; events not consumed are
    /// dropped under backpressure.
    pub fn take_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    /// Signal cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the execution to reach a terminal status.
    pub async fn join(self) -> Result<ExecutionResponse> {
        self.task.await.map_err(|e| GraphError::NodeExecution {
            node: "<runtime>".into(),
            detail: format!("execution task panicked: {e}"),
        })?
    }
}

impl GraphRuntime {
    pub fn new(graph: CompiledGraph, checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            graph,
            checkpointer,
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Run to a terminal (or awaiting-input) status without streaming.
    pub async fn invoke(&self, request: ExecutionRequest) -> Result<ExecutionResponse> {
        self.run_with(request, EventPublisher::disabled(), CancelToken::never())
            .await
    }

    /// Spawn the execution and return a handle with the live event stream.
    pub fn start(&self, request: ExecutionRequest) -> ExecutionHandle {
        let (publisher, events) = EventPublisher::with_subscriber(self.options.event_buffer);
        let (cancel, token) = CancelToken::new();
        let runtime = self.clone();
        let task = tokio::spawn(async move { runtime.run_with(request, publisher, token).await });
        ExecutionHandle {
            events: Some(events),
            cancel,
            task,
        }
    }

    /// Core loop. Returns `Ok` with an in-band terminal status for
    /// execution-level outcomes; `Err` only for request-level failures
    /// (unloadable checkpoint, malformed input).
    pub(crate) async fn run_with(
        &self,
        request: ExecutionRequest,
        publisher: Arc<EventPublisher>,
        cancel: CancelToken,
    ) -> Result<ExecutionResponse> {
        let schema = &self.graph.inner.state_schema;
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let deadline = self.options.execution_timeout.map(|t| Instant::now() + t);

        let existing = self
            .checkpointer
            .load(&thread_id)
            .await?
            .filter(|cp| cp.status == ExecutionStatus::AwaitingInput);

        let mut record;
        let mut state;
        let mut frontier: Vec<NodeId>;
        let mut ledger: JoinLedgerState;
        let mut step_index: u64;
        let mut resume_skip: HashSet<NodeId> = HashSet::new();

        if let Some(cp) = existing {
            tracing::info!(%thread_id, step = cp.step_index, "resuming execution");
            record = ExecutionRecord::new(self.graph.name(), &thread_id);
            record.execution_id = cp.execution_id.clone();
            state = cp.state;
            // Overlay the caller's new input under the merge rules.
            schema.apply(&mut state, &request.input)?;
            frontier = cp.frontier.clone();
            ledger = cp.join_ledger;
            step_index = cp.step_index;
            // The pause that produced this checkpoint is disarmed for the
            // checkpointed frontier; the paused nodes now run.
            resume_skip = cp.frontier.iter().cloned().collect();
            record.set_status(ExecutionStatus::Running);
        } else {
            tracing::info!(graph = %self.graph.name(), %thread_id, "starting execution");
            record = ExecutionRecord::new(self.graph.name(), &thread_id);
            state = json!({ "thread_id": thread_id });
            schema.apply(&mut state, &request.input)?;
            frontier = self.graph.inner.entry_targets.clone();
            ledger = JoinLedgerState::new();
            step_index = 0;
            record.set_status(ExecutionStatus::Running);

            // Step 0 records the input itself, so history shows what the
            // execution started from.
            let input_step = StepRecord::begin(&record.execution_id, 0, START, json!({}))
                .finish(request.input.clone());
            self.checkpointer.append_step(input_step).await?;
            self.checkpointer
                .save(
                    Checkpoint::new(&thread_id, &record.execution_id, state.clone())
                        .with_status(ExecutionStatus::Running)
                        .with_frontier(frontier.clone()),
                )
                .await?;
        }

        publisher.publish(ExecutionEvent::ExecutionStart {
            execution_id: record.execution_id.clone(),
            thread_id: thread_id.clone(),
        });

        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(&mut record, &publisher));
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Ok(self.finish_failed(
                    &mut record,
                    &publisher,
                    GraphError::ExecutionTimeout,
                ));
            }

            if frontier.is_empty() {
                // A non-empty ledger with nothing left to run means a join
                // is waiting on predecessors that can no longer arrive.
                if let Some((join_id, _)) = ledger.iter().find(|(_, p)| p.arrived() > 0) {
                    let error = GraphError::NodeExecution {
                        node: join_id.clone(),
                        detail: "join is stalled: some predecessors can no longer arrive".into(),
                    };
                    return Ok(self.finish_failed(&mut record, &publisher, error));
                }
                break;
            }

            step_index += 1;

            // Partition out interrupted nodes; a resume's first super-step
            // skips the pause for the checkpointed frontier.
            let mut runnable: Vec<NodeId> = Vec::new();
            let mut paused: Vec<NodeId> = Vec::new();
            for id in frontier.drain(..) {
                if self.options.interrupt_before.contains(&id) && !resume_skip.contains(&id) {
                    paused.push(id);
                } else {
                    runnable.push(id);
                }
            }
            resume_skip.clear();

            if runnable.is_empty() {
                let reason = format!("awaiting input before {:?}", paused);
                return Ok(self
                    .finish_awaiting(
                        &mut record,
                        &publisher,
                        &thread_id,
                        step_index,
                        state.clone(),
                        paused,
                        ledger.clone(),
                        reason,
                    )
                    .await);
            }

            runnable.sort();
            runnable.dedup();
            record.current_node = runnable.first().cloned();

            // Execute the super-step.
            let snapshot = state.clone();
            let semaphore = self
                .options
                .max_parallelism
                .map(|n| Arc::new(Semaphore::new(n)));
            let node_budget = |_: &str| -> Duration {
                match deadline {
                    Some(d) => self
                        .options
                        .node_timeout
                        .min(d.saturating_duration_since(Instant::now())),
                    None => self.options.node_timeout,
                }
            };

            let node_futures: Vec<_> = runnable
                .iter()
                .map(|id| {
                    let id = id.clone();
                    let snapshot = &snapshot;
                    let ledger = &ledger;
                    let publisher = &publisher;
                    let cancel = &cancel;
                    let semaphore = semaphore.clone();
                    let budget = node_budget(&id);
                    let thread_id = thread_id.as_str();
                    async move {
                        let _permit = match &semaphore {
                            Some(s) => s.acquire().await.ok(),
                            None => None,
                        };
                        let events = NodeEvents::new(publisher.clone(), &id);
                        let started_at = chrono::Utc::now();
                        publisher.publish(ExecutionEvent::NodeStart {
                            node_id: id.clone(),
                            step_index,
                        });

                        let Some(node) = self.graph.node(&id) else {
                            return (
                                id.clone(),
                                started_at,
                                events,
                                NodeOutcome::Fail {
                                    error: GraphError::NodeExecution {
                                        node: id.clone(),
                                        detail: "node not present in compiled graph".into(),
                                    },
                                },
                            );
                        };

                        let join_progress = match &node.kind {
                            CompiledKind::Join(_) => {
                                Some(ledger.get(&id).cloned().unwrap_or_default())
                            }
                            _ => None,
                        };

                        let ctx = NodeContext {
                            state: snapshot,
                            cancel,
                            events: &events,
                            options: &self.options,
                            checkpointer: &self.checkpointer,
                            publisher,
                            thread_id,
                            join_progress,
                        };

                        let outcome =
                            match tokio::time::timeout(budget, execute_node(node, ctx)).await {
                                Ok(outcome) => outcome,
                                Err(_) => NodeOutcome::Fail {
                                    error: GraphError::NodeTimeout { node: id.clone() },
                                },
                            };
                        (id, started_at, events, outcome)
                    }
                })
                .collect();

            let results = futures::future::join_all(node_futures).await;

            if cancel.is_cancelled() {
                // In-flight nodes were allowed to settle; their deltas are
                // discarded and their steps reported cancelled.
                for (node_id, _, _, _) in &results {
                    publisher.publish(ExecutionEvent::NodeError {
                        node_id: node_id.clone(),
                        step_index,
                        error_kind: "CANCELLED".into(),
                        detail: "execution cancelled".into(),
                    });
                }
                return Ok(self.finish_cancelled(&mut record, &publisher));
            }

            // Deterministic processing order: results follow the sorted
            // runnable order.
            let mut deltas: Vec<(String, Value)> = Vec::new();
            let mut next_frontier: Vec<NodeId> = paused;
            let mut suspensions: Vec<(NodeId, String)> = Vec::new();
            let mut failures: Vec<(NodeId, GraphError)> = Vec::new();
            let mut steps: Vec<StepRecord> = Vec::new();
            let mut fired_joins: Vec<NodeId> = Vec::new();

            for (node_id, started_at, events, outcome) in results {
                let mut step = StepRecord::begin(
                    &record.execution_id,
                    step_index,
                    &node_id,
                    snapshot.clone(),
                );
                step.started_at = started_at;

                match outcome {
                    NodeOutcome::StateUpdate { delta, next } => {
                        publisher.publish(ExecutionEvent::NodeComplete {
                            node_id: node_id.clone(),
                            step_index,
                            delta_digest: digest(&delta),
                        });
                        if matches!(
                            self.graph.node(&node_id).map(|n| &n.kind),
                            Some(CompiledKind::Join(_))
                        ) {
                            fired_joins.push(node_id.clone());
                        }
                        for target in next {
                            if target == END {
                                continue;
                            }
                            // A target join that waits on this node takes
                            // the delta into its ledger instead of running.
                            let into_ledger = matches!(
                                self.graph.node(&target).map(|n| &n.kind),
                                Some(CompiledKind::Join(join)) if join.wait_for.contains(&node_id)
                            );
                            if into_ledger {
                                ledger
                                    .entry(target)
                                    .or_default()
                                    .completed
                                    .insert(node_id.clone(), delta.clone());
                            } else {
                                next_frontier.push(target);
                            }
                        }
                        step.events = events.take_records();
                        steps.push(step.finish(delta.clone()));
                        deltas.push((node_id, delta));
                    }
                    NodeOutcome::Suspend { reason } => {
                        step.events = events.take_records();
                        step.push_event(json!({"type": "suspend", "reason": reason}));
                        steps.push(step.finish(json!({})));
                        // The node re-runs when the thread resumes.
                        next_frontier.push(node_id.clone());
                        suspensions.push((node_id, reason));
                    }
                    NodeOutcome::Fail { error } => {
                        publisher.publish(ExecutionEvent::NodeError {
                            node_id: node_id.clone(),
                            step_index,
                            error_kind: error.kind().into(),
                            detail: error.to_string(),
                        });
                        step.events = events.take_records();
                        steps.push(step.finish_err(StepError {
                            kind: error.kind().into(),
                            detail: error.to_string(),
                            retryable: error.retryable(),
                        }));
                        failures.push((node_id, error));
                    }
                }
            }

            // Failure routing: catch edge, then enclosing join, then fatal.
            let mut fatal: Option<GraphError> = None;
            for (node_id, error) in failures {
                let node = self.graph.node(&node_id);
                if let Some(catch) = node.and_then(|n| n.on_error.clone()) {
                    tracing::debug!(node = %node_id, %catch, "routing failure to catch edge");
                    deltas.push((
                        node_id.clone(),
                        json!({"error": {
                            "kind": error.kind(),
                            "detail": error.to_string(),
                            "node": node_id,
                        }}),
                    ));
                    if catch != END {
                        next_frontier.push(catch);
                    }
                } else if let Some(join_id) = node.and_then(|n| n.feeds_join.clone()) {
                    ledger
                        .entry(join_id)
                        .or_default()
                        .failed
                        .insert(node_id, error.to_string());
                } else if fatal.is_none() {
                    fatal = Some(error);
                }
            }

            // Merge this super-step's deltas deterministically.
            if fatal.is_none() {
                if let Err(error) = schema.apply_many(&mut state, &deltas) {
                    fatal = Some(error.into());
                }
                state[STEP_KEY] = json!(step_index);
            }

            // A join that fired this super-step consumed its ledger entry;
            // it must not be rescheduled by the readiness scan below.
            for join_id in fired_joins {
                ledger.remove(&join_id);
            }

            // Join readiness and failure policies.
            if fatal.is_none() {
                let mut ready: Vec<NodeId> = Vec::new();
                let mut tripped: Vec<NodeId> = Vec::new();
                for (join_id, progress) in ledger.iter() {
                    let Some(CompiledKind::Join(join)) =
                        self.graph.node(join_id).map(|n| &n.kind)
                    else {
                        continue;
                    };
                    match join.readiness(progress) {
                        Some(false) => ready.push(join_id.clone()),
                        Some(true) => tripped.push(join_id.clone()),
                        None => {}
                    }
                }
                for join_id in ready {
                    next_frontier.push(join_id);
                }
                for join_id in tripped {
                    let progress = ledger.remove(&join_id).unwrap_or_default();
                    let detail = progress
                        .failed
                        .iter()
                        .map(|(n, e)| format!("{n}: {e}"))
                        .collect::<Vec<_>>()
                        .join("; ");
                    let error = GraphError::NodeExecution {
                        node: join_id.clone(),
                        detail: format!("join failure policy tripped ({detail})"),
                    };
                    let catch = self
                        .graph
                        .node(&join_id)
                        .and_then(|n| n.on_error.clone());
                    match catch {
                        Some(catch) => {
                            let delta = json!({"error": {
                                "kind": error.kind(),
                                "detail": error.to_string(),
                                "node": join_id,
                            }});
                            if let Err(merge_err) = schema.apply(&mut state, &delta) {
                                fatal = Some(merge_err.into());
                            } else if catch != END {
                                next_frontier.push(catch);
                            }
                        }
                        None => {
                            if fatal.is_none() {
                                fatal = Some(error);
                            }
                        }
                    }
                }
            }
            // Durable history, then the checkpoint.
            for step in steps {
                if let Err(error) = self.checkpointer.append_step(step).await {
                    return Ok(self.finish_failed(&mut record, &publisher, error.into()));
                }
            }

            if let Some(mut error) = fatal {
                // A per-node timeout that fired because the execution
                // budget ran out is reported as the outer timeout.
                if matches!(error, GraphError::NodeTimeout { .. })
                    && deadline.map(|d| Instant::now() >= d).unwrap_or(false)
                {
                    error = GraphError::ExecutionTimeout;
                }
                let checkpoint =
                    self.checkpoint_for(&thread_id, &record, step_index, &state, &[], &ledger)
                        .with_status(ExecutionStatus::Failed);
                let _ = self.checkpointer.save(checkpoint).await;
                return Ok(self.finish_failed(&mut record, &publisher, error));
            }

            next_frontier.sort();
            next_frontier.dedup();
            frontier = next_frontier;

            if !suspensions.is_empty() {
                let reason = suspensions
                    .iter()
                    .map(|(node, reason)| format!("{node}: {reason}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Ok(self
                    .finish_awaiting(
                        &mut record,
                        &publisher,
                        &thread_id,
                        step_index,
                        state.clone(),
                        frontier.clone(),
                        ledger.clone(),
                        reason,
                    )
                    .await);
            }

            // Super-steps made up entirely of nodes on a branch that exits
            // to END without its join are not checkpointed.
            let exempt_only = runnable
                .iter()
                .all(|id| self.graph.inner.checkpoint_exempt.contains(id));
            if !exempt_only {
                let status = if frontier.is_empty() {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Running
                };
                let checkpoint = self
                    .checkpoint_for(&thread_id, &record, step_index, &state, &frontier, &ledger)
                    .with_status(status);
                if let Err(error) = self.checkpointer.save(checkpoint).await {
                    // No state delta survives a failed checkpoint write.
                    return Ok(self.finish_failed(&mut record, &publisher, error.into()));
                }
            }
        }

        // Empty frontier: completed.
        let output = match &self.graph.inner.output_key {
            Some(key) => state.get(key).cloned().unwrap_or(Value::Null),
            None => state.clone(),
        };
        record.set_status(ExecutionStatus::Completed);
        record.output = Some(output.clone());
        record.current_node = None;
        tracing::info!(execution_id = %record.execution_id, "execution completed");
        publisher.publish(ExecutionEvent::ExecutionComplete {
            status: ExecutionStatus::Completed,
            output: Some(output.clone()),
        });
        Ok(ExecutionResponse {
            execution_id: record.execution_id.clone(),
            thread_id,
            status: ExecutionStatus::Completed,
            output: Some(output),
            error: None,
            awaiting_input_reason: None,
        })
    }

    fn checkpoint_for(
        &self,
        thread_id: &str,
        record: &ExecutionRecord,
        step_index: u64,
        state: &Value,
        frontier: &[NodeId],
        ledger: &JoinLedgerState,
    ) -> Checkpoint {
        Checkpoint::new(thread_id, &record.execution_id, state.clone())
            .with_step_index(step_index)
            .with_frontier(frontier.to_vec())
            .with_join_ledger(ledger.clone())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_awaiting(
        &self,
        record: &mut ExecutionRecord,
        publisher: &EventPublisher,
        thread_id: &str,
        step_index: u64,
        state: Value,
        frontier: Vec<NodeId>,
        ledger: JoinLedgerState,
        reason: String,
    ) -> ExecutionResponse {
        record.set_status(ExecutionStatus::AwaitingInput);
        let checkpoint = Checkpoint::new(thread_id, &record.execution_id, state)
            .with_status(ExecutionStatus::AwaitingInput)
            .with_step_index(step_index)
            .with_frontier(frontier)
            .with_join_ledger(ledger);
        if let Err(error) = self.checkpointer.save(checkpoint).await {
            return self.finish_failed(record, publisher, error.into());
        }
        tracing::info!(execution_id = %record.execution_id, %reason, "execution awaiting input");
        publisher.publish(ExecutionEvent::ExecutionComplete {
            status: ExecutionStatus::AwaitingInput,
            output: None,
        });
        ExecutionResponse {
            execution_id: record.execution_id.clone(),
            thread_id: record.thread_id.clone(),
            status: ExecutionStatus::AwaitingInput,
            output: None,
            error: None,
            awaiting_input_reason: Some(reason),
        }
    }

    fn finish_failed(
        &self,
        record: &mut ExecutionRecord,
        publisher: &EventPublisher,
        error: GraphError,
    ) -> ExecutionResponse {
        let info = ExecutionErrorInfo::from(&error);
        record.set_status(ExecutionStatus::Failed);
        record.error = Some(info.clone());
        tracing::warn!(execution_id = %record.execution_id, kind = %info.kind, "execution failed");
        publisher.publish(ExecutionEvent::ExecutionComplete {
            status: ExecutionStatus::Failed,
            output: None,
        });
        ExecutionResponse {
            execution_id: record.execution_id.clone(),
            thread_id: record.thread_id.clone(),
            status: ExecutionStatus::Failed,
            output: None,
            error: Some(info),
            awaiting_input_reason: None,
        }
    }

    fn finish_cancelled(
        &self,
        record: &mut ExecutionRecord,
        publisher: &EventPublisher,
    ) -> ExecutionResponse {
        record.set_status(ExecutionStatus::Cancelled);
        tracing::info!(execution_id = %record.execution_id, "execution cancelled");
        publisher.publish(ExecutionEvent::ExecutionCancelled);
        ExecutionResponse {
            execution_id: record.execution_id.clone(),
            thread_id: record.thread_id.clone(),
            status: ExecutionStatus::Cancelled,
            output: None,
            error: None,
            awaiting_input_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, AgentBinding, CompileOptions, Resolver};
    use crate::graph::{GraphSpec, NodeKind};
    use crate::llm::{ChatModel, ChatRequest, ChatResponse, ModelConfig};
    use crate::messages::Message;
    use async_trait::async_trait;
    use orchid_checkpoint::MemoryCheckpointer;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Model that always answers with a fixed structured value and counts
    /// its calls.
    #[derive(Clone)]
    struct FixedModel {
        response: Value,
        calls: Arc<AtomicUsize>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(GraphError::Provider {
                    detail: "model rejected the request".into(),
                    retryable: false,
                });
            }
            Ok(ChatResponse::new(Message::assistant(self.response.clone())))
        }

        fn clone_box(&self) -> Box<dyn ChatModel> {
            Box::new(self.clone())
        }
    }

    /// Resolver over fixed per-agent responses.
    #[derive(Default)]
    struct FixedResolver {
        models: HashMap<String, FixedModel>,
    }

    impl FixedResolver {
        fn agent(mut self, agent_id: &str, response: Value) -> Self {
            self.models.insert(
                agent_id.to_string(),
                FixedModel {
                    response,
                    calls: Arc::new(AtomicUsize::new(0)),
                    fail: false,
                    delay: None,
                },
            );
            self
        }

        fn slow_agent(mut self, agent_id: &str, response: Value, delay: Duration) -> Self {
            self.models.insert(
                agent_id.to_string(),
                FixedModel {
                    response,
                    calls: Arc::new(AtomicUsize::new(0)),
                    fail: false,
                    delay: Some(delay),
                },
            );
            self
        }

        fn failing_agent(mut self, agent_id: &str) -> Self {
            self.models.insert(
                agent_id.to_string(),
                FixedModel {
                    response: Value::Null,
                    calls: Arc::new(AtomicUsize::new(0)),
                    fail: true,
                    delay: None,
                },
            );
            self
        }

        fn calls(&self, agent_id: &str) -> usize {
            self.models[agent_id].calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve_agent(
            &self,
            agent_id: &str,
        ) -> std::result::Result<AgentBinding, String> {
            let model = self
                .models
                .get(agent_id)
                .ok_or_else(|| format!("unknown agent '{agent_id}'"))?;
            Ok(AgentBinding {
                agent_id: agent_id.to_string(),
                system_prompt: "test agent".into(),
                model: Arc::new(model.clone()),
                model_config: ModelConfig::new("mock", "fixed"),
                tools: Vec::new(),
                output_schema: None,
                max_iterations: None,
            })
        }
    }

    fn agent_node(id: &str, agent_id: &str, output_key: &str) -> (String, NodeKind, Value) {
        (
            id.to_string(),
            NodeKind::Agent,
            json!({"agent_id": agent_id, "output_key": output_key}),
        )
    }

    async fn runtime_for(
        spec: GraphSpec,
        resolver: &FixedResolver,
    ) -> (GraphRuntime, Arc<MemoryCheckpointer>) {
        let graph = compile(&spec, resolver, &CompileOptions::default())
            .await
            .unwrap();
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        (GraphRuntime::new(graph, checkpointer.clone()), checkpointer)
    }

    #[tokio::test]
    async fn linear_chain_records_three_steps() {
        let resolver = FixedResolver::default()
            .agent("first", json!(2))
            .agent("second", json!(3));
        let (na, ka, ca) = agent_node("a", "first", "x");
        let (nb, kb, cb) = agent_node("b", "second", "y");
        let spec = GraphSpec::new("linear", "a")
            .add_node(na, ka, ca)
            .add_node(nb, kb, cb)
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END);
        let (runtime, checkpointer) = runtime_for(spec, &resolver).await;

        let response = runtime
            .invoke(ExecutionRequest::new(json!({})))
            .await
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);
        let output = response.output.unwrap();
        assert_eq!(output["x"], 2);
        assert_eq!(output["y"], 3);

        let steps = checkpointer
            .list_steps(&response.execution_id)
            .await
            .unwrap();
        assert_eq!(steps.len(), 3);
        let a_step = steps.iter().find(|s| s.node_id == "a").unwrap();
        let b_step = steps.iter().find(|s| s.node_id == "b").unwrap();
        // Causal ordering: b reads what a wrote, so a's step is earlier.
        assert!(a_step.step_index < b_step.step_index);
        assert_eq!(b_step.input_state["x"], 2);
    }

    #[tokio::test]
    async fn router_default_short_circuits() {
        let resolver = FixedResolver::default().agent("worker", json!("visited"));
        let (np, kp, cp) = agent_node("path", "worker", "path_result");
        let spec = GraphSpec::new("short-circuit", "r")
            .add_node("r", NodeKind::Router, json!({}))
            .add_node(np, kp, cp)
            .add_edge(START, "r")
            .add_conditional_edge("r", "path", "plan_confirmed == true")
            .add_conditional_edge("r", END, "default")
            .add_edge("path", END);
        let (runtime, checkpointer) = runtime_for(spec, &resolver).await;

        // Empty input: the default route ends the execution; the worker
        // never runs.
        let response = runtime
            .invoke(ExecutionRequest::new(json!({})))
            .await
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);
        assert_eq!(resolver.calls("worker"), 0);
        let steps = checkpointer
            .list_steps(&response.execution_id)
            .await
            .unwrap();
        assert!(steps.iter().all(|s| s.node_id != "path"));

        // Confirmed input: the path runs exactly once.
        let response = runtime
            .invoke(ExecutionRequest::new(json!({"plan_confirmed": true})))
            .await
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);
        assert_eq!(resolver.calls("worker"), 1);
        assert_eq!(response.output.unwrap()["path_result"], "visited");
    }

    #[tokio::test]
    async fn interrupt_then_resume_without_replay() {
        let resolver = FixedResolver::default()
            .agent("planner", json!(["step one", "step two"]))
            .agent("executor", json!("executed"));
        let (na, ka, ca) = agent_node("plan", "planner", "plan");
        let (nb, kb, cb) = agent_node("execute", "executor", "result");
        let spec = GraphSpec::new("wizard", "plan")
            .add_node(na, ka, ca)
            .add_node(nb, kb, cb)
            .add_edge(START, "plan")
            .add_edge("plan", "execute")
            .add_edge("execute", END);
        let graph = compile(&spec, &resolver, &CompileOptions::default())
            .await
            .unwrap();
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let runtime = GraphRuntime::new(graph, checkpointer.clone()).with_options(
            ExecutionOptions::default().with_interrupt_before("execute"),
        );

        let first = runtime
            .invoke(ExecutionRequest::new(json!({})).with_thread_id("wizard-1"))
            .await
            .unwrap();
        assert_eq!(first.status, ExecutionStatus::AwaitingInput);
        assert!(first.awaiting_input_reason.is_some());
        assert_eq!(resolver.calls("planner"), 1);
        assert_eq!(resolver.calls("executor"), 0);

        let second = runtime
            .invoke(
                ExecutionRequest::new(json!({"plan_confirmed": true}))
                    .with_thread_id("wizard-1"),
            )
            .await
            .unwrap();
        assert_eq!(second.status, ExecutionStatus::Completed);
        let output = second.output.unwrap();
        assert_eq!(output["result"], "executed");
        assert_eq!(output["plan"], json!(["step one", "step two"]));
        // Phase one is not replayed on resume.
        assert_eq!(resolver.calls("planner"), 1);
        assert_eq!(resolver.calls("executor"), 1);
        assert_eq!(second.execution_id, first.execution_id);
    }

    #[tokio::test]
    async fn catch_edge_routes_failure() {
        let resolver = FixedResolver::default()
            .failing_agent("broken")
            .agent("medic", json!("recovered"));
        let spec = GraphSpec::new("catch", "risky")
            .add_node(
                "risky",
                NodeKind::Agent,
                json!({
                    "agent_id": "broken",
                    "output_key": "never",
                    "on_error": "recover"
                }),
            )
            .add_node(
                "recover",
                NodeKind::Agent,
                json!({"agent_id": "medic", "output_key": "fixed"}),
            )
            .add_edge(START, "risky")
            .add_edge("risky", END)
            .add_edge("recover", END);
        let (runtime, _) = runtime_for(spec, &resolver).await;

        let response = runtime
            .invoke(ExecutionRequest::new(json!({})))
            .await
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);
        let output = response.output.unwrap();
        assert_eq!(output["fixed"], "recovered");
        assert_eq!(output["error"]["kind"], "PROVIDER");
        assert_eq!(output["error"]["node"], "risky");
    }

    #[tokio::test]
    async fn unhandled_failure_fails_execution() {
        let resolver = FixedResolver::default().failing_agent("broken");
        let (na, ka, ca) = agent_node("a", "broken", "x");
        let spec = GraphSpec::new("fail", "a")
            .add_node(na, ka, ca)
            .add_edge(START, "a")
            .add_edge("a", END);
        let (runtime, _) = runtime_for(spec, &resolver).await;

        let response = runtime
            .invoke(ExecutionRequest::new(json!({})))
            .await
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::Failed);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "PROVIDER");
        assert!(error.detail.contains("rejected"));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let resolver = FixedResolver::default().slow_agent(
            "slowpoke",
            json!("never"),
            Duration::from_millis(200),
        );
        let (na, ka, ca) = agent_node("a", "slowpoke", "x");
        let spec = GraphSpec::new("cancel", "a")
            .add_node(na, ka, ca)
            .add_edge(START, "a")
            .add_edge("a", END);
        let (runtime, _) = runtime_for(spec, &resolver).await;

        let handle = runtime.start(ExecutionRequest::new(json!({})));
        handle.cancel();
        let response = handle.join().await.unwrap();
        // Cancelled either before the first super-step or right after it;
        // both are terminal CANCELLED.
        assert_eq!(response.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn event_stream_order_for_linear_run() {
        use tokio_stream::StreamExt;

        let resolver = FixedResolver::default().agent("only", json!("done"));
        let (na, ka, ca) = agent_node("a", "only", "x");
        let spec = GraphSpec::new("events", "a")
            .add_node(na, ka, ca)
            .add_edge(START, "a")
            .add_edge("a", END);
        let (runtime, _) = runtime_for(spec, &resolver).await;

        let mut handle = runtime.start(ExecutionRequest::new(json!({})));
        let mut stream = handle.take_events().unwrap();
        let response = handle.join().await.unwrap();
        assert_eq!(response.status, ExecutionStatus::Completed);

        let mut names = Vec::new();
        while let Some(event) = stream.next().await {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "execution_start",
                "node_start",
                "node_complete",
                "execution_complete"
            ]
        );
    }
}
