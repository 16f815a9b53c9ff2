//! Graph compilation: validation, reference resolution, and the immutable
//! executable form.
//!
//! Compilation is where every graph-shape error surfaces, so runtime
//! failures are purely data- or side-effect-dependent. The passes run in
//! order, each with its own error kind:
//!
//! 1. **Structural**: sentinels used on the correct side, ids unique,
//!    per-kind shape rules (router ≥ 1 out, parallel ≥ 2 out, join ≥ 2 in
//!    with `wait_for` matching its predecessors, agent/join/subgraph
//!    exactly 1 out), typed configs decode.
//! 2. **Reachability**: every node reachable from the start (warn, not
//!    fail, on unreachable nodes); the end sentinel reachable.
//! 3. **Cycle policy**: a cycle is legal only if it contains a router
//!    with at least one route leaving the cycle; an all-unconditional
//!    cycle is rejected.
//! 4. **Parallel/join pairing**: each parallel region converges on one
//!    join; a branch may exit to the end sentinel instead, which excludes
//!    it from the join's `wait_for` and disables checkpointing for the
//!    steps on that branch.
//! 5. **Router conditions**: parsed to sandboxed predicates; a `default`
//!    route is synthesized (to the end sentinel) when missing.
//!
//! Agent references resolve through the caller-supplied [`Resolver`];
//! join aggregation names resolve against built-ins plus the reducer
//! table in [`CompileOptions`]. The result is a [`CompiledGraph`]: an
//! `Arc`'d immutable structure shared by every execution of the workflow
//! version.

use crate::condition::Predicate;
use crate::error::{CompileError, GraphError, Result};
use crate::graph::{
    AgentNodeConfig, EdgeSpec, FailurePolicy, GraphSpec, JoinNodeConfig, NodeId, NodeKind,
    OnBudget, SubgraphNodeConfig, END, START,
};
use crate::llm::{ChatModel, ModelConfig};
use crate::mapping::InputMapping;
use crate::state::StateSchema;
use crate::tool::ToolBinding;
use async_trait::async_trait;
use orchid_checkpoint::JoinProgress;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Default bound on SUBGRAPH nesting.
pub const MAX_SUBGRAPH_DEPTH: usize = 4;

/// A fully resolved agent: model handle, bound tools, prompts, schema.
#[derive(Clone)]
pub struct AgentBinding {
    pub agent_id: String,
    pub system_prompt: String,
    pub model: Arc<dyn ChatModel>,
    pub model_config: ModelConfig,
    pub tools: Vec<ToolBinding>,
    /// Structured-output schema declared by the agent definition.
    pub output_schema: Option<Value>,
    /// Definition-level iteration cap (node config may override).
    pub max_iterations: Option<usize>,
}

impl std::fmt::Debug for AgentBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBinding")
            .field("agent_id", &self.agent_id)
            .field("model", &self.model_config.model_name)
            .field("tools", &self.tools.len())
            .finish()
    }
}

/// Fetches agent and tool definitions by identifier at compile time.
///
/// Implementations typically sit in front of a database of agent records;
/// [`orchid-agents`](https://docs.rs/orchid-agents) ships an in-memory
/// catalog for tests and single-process deployments.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_agent(
        &self,
        agent_id: &str,
    ) -> std::result::Result<AgentBinding, String>;

    /// Resolve a tool by id. Defaults to the process-wide registry.
    async fn resolve_tool(&self, tool_id: &str) -> std::result::Result<ToolBinding, String> {
        crate::tool::ToolRegistry::global_resolve(tool_id).map_err(|e| e.to_string())
    }
}

/// Aggregates a join's predecessor deltas into one final delta.
///
/// Deltas arrive keyed by predecessor node id in lexicographic order, so
/// reduction is deterministic.
pub trait JoinReducer: Send + Sync {
    fn name(&self) -> &str;
    fn reduce(&self, deltas: &BTreeMap<String, Value>) -> std::result::Result<Value, String>;
}

/// Compile-time configuration: custom join reducers and the nesting bound.
pub struct CompileOptions {
    pub reducers: HashMap<String, Arc<dyn JoinReducer>>,
    pub max_subgraph_depth: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            reducers: HashMap::new(),
            max_subgraph_depth: MAX_SUBGRAPH_DEPTH,
        }
    }
}

impl CompileOptions {
    pub fn with_reducer(mut self, reducer: Arc<dyn JoinReducer>) -> Self {
        self.reducers.insert(reducer.name().to_string(), reducer);
        self
    }
}

/// How a join combines its predecessors' deltas.
#[derive(Clone)]
pub enum JoinAggregation {
    /// Shallow key-wise merge of the deltas, lexicographic predecessor
    /// order, later keys winning.
    MergeObject,
    /// Per property: concatenate array values across predecessors.
    AppendList,
    Named(Arc<dyn JoinReducer>),
}

impl JoinAggregation {
    /// Synthesize the join's final delta.
    pub fn aggregate(&self, deltas: &BTreeMap<String, Value>) -> Result<Value> {
        match self {
            JoinAggregation::MergeObject => {
                let mut merged = serde_json::Map::new();
                for delta in deltas.values() {
                    if let Some(map) = delta.as_object() {
                        for (key, value) in map {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
                Ok(Value::Object(merged))
            }
            JoinAggregation::AppendList => {
                let mut merged = serde_json::Map::new();
                for delta in deltas.values() {
                    if let Some(map) = delta.as_object() {
                        for (key, value) in map {
                            match (merged.get_mut(key), value) {
                                (Some(Value::Array(list)), Value::Array(items)) => {
                                    list.extend(items.iter().cloned());
                                }
                                (Some(existing), _) => {
                                    *existing = value.clone();
                                }
                                (None, Value::Array(items)) => {
                                    merged.insert(key.clone(), Value::Array(items.clone()));
                                }
                                (None, _) => {
                                    merged.insert(key.clone(), value.clone());
                                }
                            }
                        }
                    }
                }
                Ok(Value::Object(merged))
            }
            JoinAggregation::Named(reducer) => reducer
                .reduce(deltas)
                .map_err(|detail| GraphError::NodeExecution {
                    node: format!("reducer '{}'", reducer.name()),
                    detail,
                }),
        }
    }
}

/// Compiled AGENT node.
pub(crate) struct CompiledAgent {
    pub binding: AgentBinding,
    pub input_mapping: InputMapping,
    pub output_key: String,
    pub max_iterations: Option<usize>,
    pub on_budget: OnBudget,
}

/// Compiled ROUTER node: ordered routes, last one guaranteed `default`.
pub(crate) struct CompiledRouter {
    pub routes: Vec<(Predicate, NodeId)>,
}

impl CompiledRouter {
    /// First matching route target. The trailing default guarantees a hit.
    pub fn select(&self, state: &Value) -> &str {
        for (predicate, target) in &self.routes {
            if predicate.matches(state) {
                return target;
            }
        }
        // Unreachable: compilation guarantees a trailing default route.
        END
    }
}

/// Compiled JOIN node.
pub(crate) struct CompiledJoin {
    pub wait_for: Vec<NodeId>,
    pub aggregation: JoinAggregation,
    pub failure_policy: FailurePolicy,
}

impl CompiledJoin {
    /// Consult the failure policy against arrived predecessors.
    /// `Some(true)` = join must fail; `Some(false)` = join is ready;
    /// `None` = keep waiting.
    pub fn readiness(&self, progress: &JoinProgress) -> Option<bool> {
        let total = self.wait_for.len();
        let failed = progress.failed.len();
        let arrived = progress.arrived();
        match self.failure_policy {
            FailurePolicy::Any if failed > 0 => return Some(true),
            FailurePolicy::Majority if failed * 2 > total => return Some(true),
            FailurePolicy::AllRequired if failed == total => return Some(true),
            _ => {}
        }
        if arrived == total {
            Some(false)
        } else {
            None
        }
    }
}

/// Compiled SUBGRAPH node.
pub(crate) struct CompiledSubgraph {
    pub graph: CompiledGraph,
    pub input_mapping: InputMapping,
    pub output_key: String,
}

/// Kind-specific compiled payload.
pub(crate) enum CompiledKind {
    Agent(CompiledAgent),
    Router(CompiledRouter),
    Parallel { branches: Vec<NodeId> },
    Join(CompiledJoin),
    Subgraph(CompiledSubgraph),
}

impl CompiledKind {
    pub fn name(&self) -> &'static str {
        match self {
            CompiledKind::Agent(_) => "AGENT",
            CompiledKind::Router(_) => "ROUTER",
            CompiledKind::Parallel { .. } => "PARALLEL",
            CompiledKind::Join(_) => "JOIN",
            CompiledKind::Subgraph(_) => "SUBGRAPH",
        }
    }
}

/// A compiled node: payload plus control-flow annotations.
pub(crate) struct CompiledNode {
    pub id: NodeId,
    pub kind: CompiledKind,
    /// Successors for non-router nodes (exactly one for agent/join/
    /// subgraph, the branch heads for parallel).
    pub next: Vec<NodeId>,
    /// Catch edge target.
    pub on_error: Option<NodeId>,
    /// The join this node feeds, when its successor is a join that waits
    /// on it.
    pub feeds_join: Option<NodeId>,
}

pub(crate) struct CompiledInner {
    pub name: String,
    pub nodes: HashMap<NodeId, CompiledNode>,
    pub entry_targets: Vec<NodeId>,
    pub state_schema: StateSchema,
    pub output_key: Option<String>,
    /// Nodes on parallel branches that exit to the end sentinel without
    /// passing the region's join; checkpointing is skipped for
    /// super-steps composed entirely of these.
    pub checkpoint_exempt: HashSet<NodeId>,
    pub warnings: Vec<String>,
}

/// An immutable, executable graph, shared across executions.
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) inner: Arc<CompiledInner>,
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Warnings accumulated during compilation (unreachable nodes,
    /// synthesized defaults).
    pub fn warnings(&self) -> &[String] {
        &self.inner.warnings
    }

    pub(crate) fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.inner.nodes.get(id)
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.inner.name)
            .field("nodes", &self.inner.nodes.len())
            .finish()
    }
}

/// Compile a description into an executable graph.
pub async fn compile(
    spec: &GraphSpec,
    resolver: &dyn Resolver,
    options: &CompileOptions,
) -> Result<CompiledGraph> {
    compile_at_depth(spec, resolver, options, 0).await
}

fn compile_at_depth<'a>(
    spec: &'a GraphSpec,
    resolver: &'a dyn Resolver,
    options: &'a CompileOptions,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<CompiledGraph>> + Send + 'a>> {
    Box::pin(async move {
        if depth > options.max_subgraph_depth {
            return Err(CompileError::NestingDepthExceeded {
                depth,
                limit: options.max_subgraph_depth,
            }
            .into());
        }

        let mut warnings = Vec::new();

        // Pass 1: structure.
        validate_structure(spec)?;
        let entry_targets = entry_targets(spec);

        // Pass 2: reachability. Unreachable nodes warn and still compile;
        // they simply never enter a frontier.
        validate_reachability(spec, &entry_targets, &mut warnings)?;

        // Pass 3: cycle policy.
        validate_cycles(spec)?;

        // Pass 4: parallel/join pairing.
        let checkpoint_exempt = validate_parallel_regions(spec)?;

        // Pass 5: routers, then resolution.
        let state_schema = StateSchema::from_json_schema(&spec.state_schema)
            .map_err(|e| CompileError::StateSchema(e.to_string()))?;

        let mut nodes = HashMap::new();
        for node_spec in &spec.nodes {
            let compiled = compile_node(spec, node_spec, resolver, options, depth, &mut warnings)
                .await?;
            nodes.insert(node_spec.id.clone(), compiled);
        }

        // Annotate which nodes feed joins.
        let join_waits: HashMap<NodeId, HashSet<NodeId>> = nodes
            .iter()
            .filter_map(|(id, node)| match &node.kind {
                CompiledKind::Join(join) => {
                    Some((id.clone(), join.wait_for.iter().cloned().collect()))
                }
                _ => None,
            })
            .collect();
        for node in nodes.values_mut() {
            node.feeds_join = node.next.iter().find_map(|target| {
                join_waits
                    .get(target)
                    .filter(|waits| waits.contains(&node.id))
                    .map(|_| target.clone())
            });
        }

        for warning in &warnings {
            tracing::warn!(graph = %spec.name, "{warning}");
        }

        tracing::debug!(graph = %spec.name, nodes = nodes.len(), "graph compiled");
        Ok(CompiledGraph {
            inner: Arc::new(CompiledInner {
                name: spec.name.clone(),
                nodes,
                entry_targets,
                state_schema,
                output_key: spec.output_key.clone(),
                checkpoint_exempt,
                warnings,
            }),
        })
    })
}

fn entry_targets(spec: &GraphSpec) -> Vec<NodeId> {
    let from_start: Vec<NodeId> = spec
        .edges_from(START)
        .map(|e| e.target.clone())
        .collect();
    if from_start.is_empty() {
        vec![spec.entry_point.clone()]
    } else {
        from_start
    }
}

fn validate_structure(spec: &GraphSpec) -> Result<()> {
    let mut seen = HashSet::new();
    for node in &spec.nodes {
        if node.id == START || node.id == END {
            return Err(CompileError::ReservedNodeId(node.id.clone()).into());
        }
        if !seen.insert(node.id.as_str()) {
            return Err(CompileError::DuplicateNodeId(node.id.clone()).into());
        }
    }

    for edge in &spec.edges {
        if edge.target == START {
            return Err(CompileError::EdgeToStart(format!(
                "{} -> {}",
                edge.source, edge.target
            ))
            .into());
        }
        if edge.source == END {
            return Err(CompileError::EdgeFromEnd(format!(
                "{} -> {}",
                edge.source, edge.target
            ))
            .into());
        }
        for (endpoint, side) in [(&edge.source, "source"), (&edge.target, "target")] {
            if endpoint != START && endpoint != END && spec.node(endpoint).is_none() {
                return Err(CompileError::UnknownNode {
                    referenced: endpoint.clone(),
                    by: format!("edge {side} {} -> {}", edge.source, edge.target),
                }
                .into());
            }
        }
    }

    if spec.edges_from(START).next().is_none() && spec.node(&spec.entry_point).is_none() {
        return Err(CompileError::MissingEntryPoint(spec.entry_point.clone()).into());
    }

    // Per-kind shape rules.
    for node in &spec.nodes {
        let out: Vec<&EdgeSpec> = spec.edges_from(&node.id).collect();
        let into: Vec<&EdgeSpec> = spec.edges_into(&node.id).collect();
        match node.kind {
            NodeKind::Router => {
                if out.is_empty() {
                    return Err(CompileError::RouterWithoutRoutes(node.id.clone()).into());
                }
            }
            NodeKind::Parallel => {
                if out.len() < 2 {
                    return Err(CompileError::ParallelFanOutTooSmall {
                        node: node.id.clone(),
                        found: out.len(),
                    }
                    .into());
                }
            }
            NodeKind::Join => {
                if into.len() < 2 {
                    return Err(CompileError::JoinFanInTooSmall {
                        node: node.id.clone(),
                        found: into.len(),
                    }
                    .into());
                }
                if out.len() != 1 {
                    return Err(CompileError::InvalidNodeConfig {
                        node: node.id.clone(),
                        detail: format!("JOIN nodes need exactly one outgoing edge, found {}", out.len()),
                    }
                    .into());
                }
                let config: JoinNodeConfig = decode_config(&node.id, &node.config)?;
                let mut declared: Vec<String> = config.wait_for.clone();
                let mut expected: Vec<String> =
                    into.iter().map(|e| e.source.clone()).collect();
                declared.sort();
                declared.dedup();
                expected.sort();
                expected.dedup();
                if declared != expected {
                    return Err(CompileError::WaitForMismatch {
                        node: node.id.clone(),
                        declared,
                        expected,
                    }
                    .into());
                }
            }
            NodeKind::Agent | NodeKind::Subgraph => {
                if out.len() != 1 {
                    return Err(CompileError::InvalidNodeConfig {
                        node: node.id.clone(),
                        detail: format!(
                            "{} nodes need exactly one outgoing edge, found {}",
                            node.kind.as_str(),
                            out.len()
                        ),
                    }
                    .into());
                }
            }
        }
    }

    Ok(())
}

fn decode_config<T: serde::de::DeserializeOwned>(node: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| {
        CompileError::InvalidNodeConfig {
            node: node.to_string(),
            detail: e.to_string(),
        }
        .into()
    })
}

fn validate_reachability(
    spec: &GraphSpec,
    entry_targets: &[NodeId],
    warnings: &mut Vec<String>,
) -> Result<()> {
    let mut reachable: HashSet<NodeId> = HashSet::new();
    let mut end_reached = false;
    let mut queue: VecDeque<NodeId> = entry_targets.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        if id == END {
            end_reached = true;
            continue;
        }
        if !reachable.insert(id.clone()) {
            continue;
        }
        for edge in spec.edges_from(&id) {
            queue.push_back(edge.target.clone());
        }
    }

    if !end_reached {
        return Err(CompileError::NoPathToEnd.into());
    }

    for node in &spec.nodes {
        if !reachable.contains(&node.id) {
            warnings.push(format!("node '{}' is unreachable from the start", node.id));
        }
    }
    Ok(())
}

/// A cycle is legal only when it contains a router able to leave it.
fn validate_cycles(spec: &GraphSpec) -> Result<()> {
    // Adjacency restricted to real nodes.
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &spec.edges {
        if edge.source != START && edge.target != END {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
    }

    for component in strongly_connected(spec, &adjacency) {
        let has_internal_cycle = component.len() > 1
            || component.iter().any(|id| {
                adjacency
                    .get(id.as_str())
                    .map(|next| next.iter().any(|t| *t == id.as_str()))
                    .unwrap_or(false)
            });
        if !has_internal_cycle {
            continue;
        }
        let set: HashSet<&str> = component.iter().map(|s| s.as_str()).collect();
        let breakable = component.iter().any(|id| {
            matches!(spec.node(id).map(|n| n.kind), Some(NodeKind::Router))
                && spec
                    .edges_from(id)
                    .any(|e| e.target == END || !set.contains(e.target.as_str()))
        });
        if !breakable {
            let mut names = component.clone();
            names.sort();
            return Err(CompileError::UnconditionalCycle(names).into());
        }
    }
    Ok(())
}

/// Tarjan's strongly connected components over the node-only adjacency.
fn strongly_connected(
    spec: &GraphSpec,
    adjacency: &HashMap<&str, Vec<&str>>,
) -> Vec<Vec<String>> {
    struct Frame<'a> {
        node: &'a str,
        next_child: usize,
    }

    let mut index_of: HashMap<&str, usize> = HashMap::new();
    let mut low: HashMap<&str, usize> = HashMap::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut counter = 0usize;
    let mut components = Vec::new();

    for start in spec.nodes.iter().map(|n| n.id.as_str()) {
        if index_of.contains_key(start) {
            continue;
        }
        let mut frames = vec![Frame {
            node: start,
            next_child: 0,
        }];
        index_of.insert(start, counter);
        low.insert(start, counter);
        counter += 1;
        stack.push(start);
        on_stack.insert(start);

        while let Some(frame) = frames.last_mut() {
            let node = frame.node;
            let children = adjacency.get(node).map(|c| c.as_slice()).unwrap_or(&[]);
            if frame.next_child < children.len() {
                let child = children[frame.next_child];
                frame.next_child += 1;
                if !index_of.contains_key(child) {
                    index_of.insert(child, counter);
                    low.insert(child, counter);
                    counter += 1;
                    stack.push(child);
                    on_stack.insert(child);
                    frames.push(Frame {
                        node: child,
                        next_child: 0,
                    });
                } else if on_stack.contains(child) {
                    let child_index = index_of[child];
                    let entry = low.get_mut(node).expect("visited");
                    *entry = (*entry).min(child_index);
                }
            } else {
                let finished = frames.pop().expect("frame present");
                if let Some(parent) = frames.last() {
                    let child_low = low[finished.node];
                    let entry = low.get_mut(parent.node).expect("visited");
                    *entry = (*entry).min(child_low);
                }
                if low[finished.node] == index_of[finished.node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack.remove(member);
                        component.push(member.to_string());
                        if member == finished.node {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
    }
    components
}

/// Pass 4: each parallel region converges on exactly one join; branches
/// exiting straight to END are flagged checkpoint-exempt. Routers inside
/// a region must not read properties written by sibling branches.
fn validate_parallel_regions(spec: &GraphSpec) -> Result<HashSet<NodeId>> {
    let mut exempt = HashSet::new();

    for parallel in spec.nodes.iter().filter(|n| n.kind == NodeKind::Parallel) {
        let branch_heads: Vec<NodeId> =
            spec.edges_from(&parallel.id).map(|e| e.target.clone()).collect();

        let mut joins: HashSet<NodeId> = HashSet::new();
        let mut branch_members: Vec<HashSet<NodeId>> = Vec::new();
        let mut branch_exits_to_end: Vec<bool> = Vec::new();

        for head in &branch_heads {
            let mut members = HashSet::new();
            let mut exits = false;
            let mut queue = VecDeque::from([head.clone()]);
            while let Some(id) = queue.pop_front() {
                if id == END {
                    exits = true;
                    continue;
                }
                let Some(node) = spec.node(&id) else { continue };
                if node.kind == NodeKind::Join {
                    joins.insert(id.clone());
                    continue;
                }
                if !members.insert(id.clone()) {
                    continue;
                }
                for edge in spec.edges_from(&id) {
                    queue.push_back(edge.target.clone());
                }
            }
            branch_members.push(members);
            branch_exits_to_end.push(exits);
        }

        if joins.len() > 1 {
            let mut names: Vec<String> = joins.into_iter().collect();
            names.sort();
            return Err(CompileError::AmbiguousJoin {
                parallel: parallel.id.clone(),
                joins: names,
            }
            .into());
        }

        // A branch that can exit to END without the join is legal; its
        // nodes are excluded from checkpointing.
        for (members, exits) in branch_members.iter().zip(&branch_exits_to_end) {
            if *exits {
                exempt.extend(members.iter().cloned());
            }
        }

        // Cross-branch condition check: a router on one branch must not
        // read a property a sibling branch writes before the join.
        let branch_writes: Vec<HashSet<String>> = branch_members
            .iter()
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| spec.node(id))
                    .filter_map(|n| output_key_of(n))
                    .collect()
            })
            .collect();

        for (branch_index, members) in branch_members.iter().enumerate() {
            let sibling_writes: HashSet<&String> = branch_writes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != branch_index)
                .flat_map(|(_, writes)| writes.iter())
                .collect();
            for router_id in members
                .iter()
                .filter(|id| matches!(spec.node(id).map(|n| n.kind), Some(NodeKind::Router)))
            {
                for edge in spec.edges_from(router_id) {
                    let Some(condition) = &edge.condition else { continue };
                    let predicate = Predicate::parse(condition)
                        .map_err(CompileError::from)?;
                    for reference in predicate.references() {
                        if sibling_writes.contains(&reference) {
                            return Err(CompileError::CrossBranchCondition {
                                router: router_id.clone(),
                                property: reference,
                            }
                            .into());
                        }
                    }
                }
            }
        }
    }

    Ok(exempt)
}

fn output_key_of(node: &crate::graph::NodeSpec) -> Option<String> {
    match node.kind {
        NodeKind::Agent | NodeKind::Subgraph => node
            .config
            .get("output_key")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

async fn compile_node(
    spec: &GraphSpec,
    node_spec: &crate::graph::NodeSpec,
    resolver: &dyn Resolver,
    options: &CompileOptions,
    depth: usize,
    warnings: &mut Vec<String>,
) -> Result<CompiledNode> {
    let id = node_spec.id.clone();
    let outgoing: Vec<&EdgeSpec> = spec.edges_from(&id).collect();

    let (kind, next, on_error) = match node_spec.kind {
        NodeKind::Agent => {
            let config: AgentNodeConfig = decode_config(&id, &node_spec.config)?;
            let binding = resolver
                .resolve_agent(&config.agent_id)
                .await
                .map_err(|detail| CompileError::Resolution {
                    reference: config.agent_id.clone(),
                    detail,
                })?;
            let mapping = InputMapping::parse(
                config
                    .input_mapping
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            )
            .map_err(CompileError::from)?;
            validate_catch_edge(spec, &id, &config.on_error)?;
            (
                CompiledKind::Agent(CompiledAgent {
                    binding,
                    input_mapping: mapping,
                    output_key: config.output_key,
                    max_iterations: config.max_iterations,
                    on_budget: config.on_budget,
                }),
                vec![outgoing[0].target.clone()],
                config.on_error,
            )
        }
        NodeKind::Router => {
            let mut routes = Vec::new();
            let mut has_default = false;
            for edge in &outgoing {
                let predicate = match &edge.condition {
                    Some(condition) => Predicate::parse(condition).map_err(CompileError::from)?,
                    // An unconditional router edge is an always-match route.
                    None => Predicate::Default,
                };
                if predicate.is_default() {
                    has_default = true;
                }
                routes.push((predicate, edge.target.clone()));
            }
            if !has_default {
                warnings.push(format!(
                    "router '{id}' has no default route; synthesized default -> {END}"
                ));
                routes.push((Predicate::Default, END.to_string()));
            }
            (CompiledKind::Router(CompiledRouter { routes }), Vec::new(), None)
        }
        NodeKind::Parallel => {
            let branches: Vec<NodeId> = outgoing.iter().map(|e| e.target.clone()).collect();
            (
                CompiledKind::Parallel {
                    branches: branches.clone(),
                },
                branches,
                None,
            )
        }
        NodeKind::Join => {
            let config: JoinNodeConfig = decode_config(&id, &node_spec.config)?;
            let aggregation = match config.aggregation_strategy.as_str() {
                "merge_object" => JoinAggregation::MergeObject,
                "append_list" => JoinAggregation::AppendList,
                name => match options.reducers.get(name) {
                    Some(reducer) => JoinAggregation::Named(reducer.clone()),
                    None => {
                        return Err(CompileError::UnknownReducer {
                            node: id,
                            name: name.to_string(),
                        }
                        .into())
                    }
                },
            };
            validate_catch_edge(spec, &id, &config.on_error)?;
            (
                CompiledKind::Join(CompiledJoin {
                    wait_for: config.wait_for,
                    aggregation,
                    failure_policy: config.failure_policy,
                }),
                vec![outgoing[0].target.clone()],
                config.on_error,
            )
        }
        NodeKind::Subgraph => {
            let config: SubgraphNodeConfig = decode_config(&id, &node_spec.config)?;
            let child = compile_at_depth(&config.graph, resolver, options, depth + 1).await?;
            let mapping = InputMapping::parse(
                config
                    .input_mapping
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            )
            .map_err(CompileError::from)?;
            validate_catch_edge(spec, &id, &config.on_error)?;
            (
                CompiledKind::Subgraph(CompiledSubgraph {
                    graph: child,
                    input_mapping: mapping,
                    output_key: config.output_key,
                }),
                vec![outgoing[0].target.clone()],
                config.on_error,
            )
        }
    };

    Ok(CompiledNode {
        id,
        kind,
        next,
        on_error,
        feeds_join: None,
    })
}

fn validate_catch_edge(spec: &GraphSpec, node: &str, target: &Option<NodeId>) -> Result<()> {
    if let Some(target) = target {
        if target != END && spec.node(target).is_none() {
            return Err(CompileError::UnknownNode {
                referenced: target.clone(),
                by: format!("on_error of node '{node}'"),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, ChatResponse};
    use crate::messages::Message;
    use serde_json::json;

    #[derive(Clone)]
    struct NullModel;

    #[async_trait]
    impl ChatModel for NullModel {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse::new(Message::assistant("ok")))
        }

        fn clone_box(&self) -> Box<dyn ChatModel> {
            Box::new(self.clone())
        }
    }

    struct NullResolver;

    #[async_trait]
    impl Resolver for NullResolver {
        async fn resolve_agent(
            &self,
            agent_id: &str,
        ) -> std::result::Result<AgentBinding, String> {
            if agent_id == "missing" {
                return Err("unknown agent".into());
            }
            Ok(AgentBinding {
                agent_id: agent_id.to_string(),
                system_prompt: "test".into(),
                model: Arc::new(NullModel),
                model_config: ModelConfig::new("mock", "null"),
                tools: Vec::new(),
                output_schema: None,
                max_iterations: None,
            })
        }
    }

    fn agent(id: &str, output_key: &str) -> (String, NodeKind, Value) {
        (
            id.to_string(),
            NodeKind::Agent,
            json!({"agent_id": "any", "output_key": output_key}),
        )
    }

    fn linear_spec() -> GraphSpec {
        let (a, ak, ac) = agent("a", "x");
        let (b, bk, bc) = agent("b", "y");
        GraphSpec::new("linear", "a")
            .add_node(a, ak, ac)
            .add_node(b, bk, bc)
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END)
    }

    async fn try_compile(spec: GraphSpec) -> Result<CompiledGraph> {
        compile(&spec, &NullResolver, &CompileOptions::default()).await
    }

    fn compile_err(result: Result<CompiledGraph>) -> CompileError {
        match result.unwrap_err() {
            GraphError::Compile(err) => err,
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compiles_linear_chain() {
        let graph = try_compile(linear_spec()).await.unwrap();
        assert_eq!(graph.inner.entry_targets, vec!["a".to_string()]);
        assert_eq!(graph.node("a").unwrap().next, vec!["b".to_string()]);
        assert!(graph.warnings().is_empty());
    }

    #[tokio::test]
    async fn rejects_duplicate_ids() {
        let (a, ak, ac) = agent("a", "x");
        let (a2, ak2, ac2) = agent("a", "y");
        let spec = GraphSpec::new("dup", "a")
            .add_node(a, ak, ac)
            .add_node(a2, ak2, ac2)
            .add_edge(START, "a")
            .add_edge("a", END);
        assert!(matches!(
            compile_err(try_compile(spec).await),
            CompileError::DuplicateNodeId(_)
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_edge_endpoint() {
        let (a, ak, ac) = agent("a", "x");
        let spec = GraphSpec::new("bad-edge", "a")
            .add_node(a, ak, ac)
            .add_edge(START, "a")
            .add_edge("a", "ghost")
            .add_edge("a", END);
        assert!(matches!(
            compile_err(try_compile(spec).await),
            CompileError::UnknownNode { .. }
        ));
    }

    #[tokio::test]
    async fn rejects_unresolvable_agent() {
        let spec = GraphSpec::new("bad-agent", "a")
            .add_node(
                "a",
                NodeKind::Agent,
                json!({"agent_id": "missing", "output_key": "x"}),
            )
            .add_edge(START, "a")
            .add_edge("a", END);
        assert!(matches!(
            compile_err(try_compile(spec).await),
            CompileError::Resolution { .. }
        ));
    }

    #[tokio::test]
    async fn rejects_missing_path_to_end() {
        let (a, ak, ac) = agent("a", "x");
        let (b, bk, bc) = agent("b", "y");
        let spec = GraphSpec::new("no-end", "a")
            .add_node(a, ak, ac)
            .add_node(b, bk, bc)
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", "a");
        let err = compile_err(try_compile(spec).await);
        // Both the reachability and the cycle pass would object; the
        // reachability pass runs first.
        assert!(matches!(err, CompileError::NoPathToEnd));
    }

    #[tokio::test]
    async fn warns_on_unreachable_node() {
        let (a, ak, ac) = agent("a", "x");
        let (orphan, ok_, oc) = agent("orphan", "y");
        let spec = GraphSpec::new("orphan", "a")
            .add_node(a, ak, ac)
            .add_node(orphan, ok_, oc)
            .add_edge(START, "a")
            .add_edge("a", END)
            .add_edge("orphan", END);
        let graph = try_compile(spec).await.unwrap();
        assert!(graph.warnings().iter().any(|w| w.contains("orphan")));
    }

    #[tokio::test]
    async fn rejects_unconditional_cycle() {
        let (a, ak, ac) = agent("a", "x");
        let (b, bk, bc) = agent("b", "y");
        let (c, ck, cc) = agent("c", "z");
        let spec = GraphSpec::new("cycle", "a")
            .add_node(a, ak, ac)
            .add_node(b, bk, bc)
            .add_node(c, ck, cc)
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", "a")
            .add_edge("a", "c")
            .add_edge("c", END);
        // "a" fans out to two edges though it's an agent; rebuild with a
        // router so the shape rules pass but the a<->b cycle remains
        // unconditional... agents cannot express this, so use two joins?
        // Simplest legal shape: router r with in-cycle default only.
        let _ = spec;
        let (w, wk, wc) = agent("work", "x");
        let spec = GraphSpec::new("cycle", "work")
            .add_node(w, wk, wc)
            .add_node("r", NodeKind::Router, json!({}))
            .add_edge(START, "work")
            .add_edge("work", "r")
            .add_conditional_edge("r", "work", "default")
            .add_edge("r", END); // unreachable route: declared after default
        // Route order: default first means the END edge never fires, but
        // statically the router CAN leave the cycle, so this compiles.
        let graph = try_compile(spec).await.unwrap();
        assert!(graph.node("r").is_some());

        // Now a truly unbreakable cycle: router whose every route stays
        // inside.
        let (w2, w2k, w2c) = agent("work", "x");
        let spec = GraphSpec::new("cycle2", "work")
            .add_node(w2, w2k, w2c)
            .add_node("r", NodeKind::Router, json!({}))
            .add_edge(START, "work")
            .add_edge("work", "r")
            .add_conditional_edge("r", "work", "default");
        let err = compile_err(try_compile(spec).await);
        assert!(matches!(err, CompileError::NoPathToEnd | CompileError::UnconditionalCycle(_)));
    }

    #[tokio::test]
    async fn join_wait_for_must_match_predecessors() {
        let (a, ak, ac) = agent("a", "x");
        let (b, bk, bc) = agent("b", "y");
        let spec = GraphSpec::new("join", "p")
            .add_node("p", NodeKind::Parallel, json!({}))
            .add_node(a, ak, ac)
            .add_node(b, bk, bc)
            .add_node("j", NodeKind::Join, json!({"wait_for": ["a"]}))
            .add_edge(START, "p")
            .add_edge("p", "a")
            .add_edge("p", "b")
            .add_edge("a", "j")
            .add_edge("b", "j")
            .add_edge("j", END);
        assert!(matches!(
            compile_err(try_compile(spec).await),
            CompileError::WaitForMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn parallel_requires_two_branches() {
        let (a, ak, ac) = agent("a", "x");
        let spec = GraphSpec::new("thin", "p")
            .add_node("p", NodeKind::Parallel, json!({}))
            .add_node(a, ak, ac)
            .add_edge(START, "p")
            .add_edge("p", "a")
            .add_edge("a", END);
        assert!(matches!(
            compile_err(try_compile(spec).await),
            CompileError::ParallelFanOutTooSmall { .. }
        ));
    }

    #[tokio::test]
    async fn branch_to_end_is_checkpoint_exempt() {
        let (a, ak, ac) = agent("a", "items");
        let (b, bk, bc) = agent("b", "items");
        let (c, ck, cc) = agent("c", "side");
        let spec = GraphSpec::new("exempt", "p")
            .add_node("p", NodeKind::Parallel, json!({}))
            .add_node(a, ak, ac)
            .add_node(b, bk, bc)
            .add_node(c, ck, cc)
            .add_node("j", NodeKind::Join, json!({"wait_for": ["a", "b"]}))
            .add_edge(START, "p")
            .add_edge("p", "a")
            .add_edge("p", "b")
            .add_edge("p", "c")
            .add_edge("a", "j")
            .add_edge("b", "j")
            .add_edge("c", END)
            .add_edge("j", END);
        let graph = try_compile(spec).await.unwrap();
        assert!(graph.inner.checkpoint_exempt.contains("c"));
        assert!(!graph.inner.checkpoint_exempt.contains("a"));
    }

    #[tokio::test]
    async fn router_default_synthesized() {
        let (a, ak, ac) = agent("a", "x");
        let spec = GraphSpec::new("router", "r")
            .add_node("r", NodeKind::Router, json!({}))
            .add_node(a, ak, ac)
            .add_conditional_edge("r", "a", "go == true")
            .add_edge(START, "r")
            .add_edge("a", END);
        let graph = try_compile(spec).await.unwrap();
        let CompiledKind::Router(router) = &graph.node("r").unwrap().kind else {
            panic!("expected router");
        };
        assert_eq!(router.routes.len(), 2);
        assert!(router.routes.last().unwrap().0.is_default());
        assert_eq!(router.select(&json!({})), END);
        assert_eq!(router.select(&json!({"go": true})), "a");
        assert!(graph.warnings().iter().any(|w| w.contains("synthesized")));
    }

    #[tokio::test]
    async fn cross_branch_condition_rejected() {
        let (a, ak, ac) = agent("a", "left_out");
        let (b, bk, bc) = agent("b", "right_out");
        let (c, ck, cc) = agent("c", "after_router");
        let spec = GraphSpec::new("cross", "p")
            .add_node("p", NodeKind::Parallel, json!({}))
            .add_node(a, ak, ac)
            .add_node(b, bk, bc)
            .add_node(c, ck, cc)
            .add_node("r", NodeKind::Router, json!({}))
            .add_node("j", NodeKind::Join, json!({"wait_for": ["a", "c"]}))
            .add_edge(START, "p")
            .add_edge("p", "a")
            .add_edge("p", "r")
            // Router condition reads the sibling branch's output.
            .add_conditional_edge("r", "b", "left_out == 'x'")
            .add_conditional_edge("r", "c", "default")
            .add_edge("b", "c")
            .add_edge("a", "j")
            .add_edge("c", "j")
            .add_edge("j", END);
        assert!(matches!(
            compile_err(try_compile(spec).await),
            CompileError::CrossBranchCondition { .. }
        ));
    }

    #[tokio::test]
    async fn subgraph_depth_limit() {
        fn nested(depth: usize) -> GraphSpec {
            let inner: Value = if depth == 0 {
                let (a, _, ac) = agent("leaf", "x");
                return GraphSpec::new("leaf-graph", "leaf")
                    .add_node(a, NodeKind::Agent, ac)
                    .add_edge(START, "leaf")
                    .add_edge("leaf", END);
            } else {
                serde_json::to_value(nested(depth - 1)).unwrap()
            };
            GraphSpec::new(format!("level-{depth}"), "sub")
                .add_node(
                    "sub",
                    NodeKind::Subgraph,
                    json!({"graph": inner, "output_key": "child"}),
                )
                .add_edge(START, "sub")
                .add_edge("sub", END)
        }

        // Depth 3 nesting compiles under the default limit of 4.
        assert!(try_compile(nested(3)).await.is_ok());
        // Depth 6 exceeds it.
        assert!(matches!(
            compile_err(try_compile(nested(6)).await),
            CompileError::NestingDepthExceeded { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_join_reducer_rejected() {
        let (a, ak, ac) = agent("a", "x");
        let (b, bk, bc) = agent("b", "y");
        let spec = GraphSpec::new("reducer", "p")
            .add_node("p", NodeKind::Parallel, json!({}))
            .add_node(a, ak, ac)
            .add_node(b, bk, bc)
            .add_node(
                "j",
                NodeKind::Join,
                json!({"wait_for": ["a", "b"], "aggregation_strategy": "tally"}),
            )
            .add_edge(START, "p")
            .add_edge("p", "a")
            .add_edge("p", "b")
            .add_edge("a", "j")
            .add_edge("b", "j")
            .add_edge("j", END);
        assert!(matches!(
            compile_err(try_compile(spec).await),
            CompileError::UnknownReducer { .. }
        ));
    }

    #[tokio::test]
    async fn join_readiness_policies() {
        let join = CompiledJoin {
            wait_for: vec!["a".into(), "b".into(), "c".into()],
            aggregation: JoinAggregation::MergeObject,
            failure_policy: FailurePolicy::Majority,
        };
        let mut progress = JoinProgress::default();
        progress.completed.insert("a".into(), json!({}));
        assert_eq!(join.readiness(&progress), None);
        progress.failed.insert("b".into(), "boom".into());
        assert_eq!(join.readiness(&progress), None);
        progress.failed.insert("c".into(), "boom".into());
        // 2 of 3 failed: majority policy trips.
        assert_eq!(join.readiness(&progress), Some(true));
    }

    #[tokio::test]
    async fn join_aggregation_append_list() {
        let aggregation = JoinAggregation::AppendList;
        let mut deltas = BTreeMap::new();
        deltas.insert("a".to_string(), json!({"items": [1]}));
        deltas.insert("b".to_string(), json!({"items": [2]}));
        deltas.insert("c".to_string(), json!({"items": [3]}));
        let delta = aggregation.aggregate(&deltas).unwrap();
        assert_eq!(delta, json!({"items": [1, 2, 3]}));
    }
}
