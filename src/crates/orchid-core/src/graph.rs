//! Declarative graph descriptions.
//!
//! A [`GraphSpec`] is the value-object input to the compiler: nodes with a
//! kind and per-kind config, ordered edges with optional router
//! conditions, an entry point, and a JSON Schema for the state object
//! (including per-property merge rules, see [`crate::state`]).
//!
//! Descriptions are pure data (no closures, no resolved references), so
//! they round-trip through JSON and YAML and can be stored as workflow
//! documents:
//!
//! ```yaml
//! name: support_triage
//! entry_point: classify
//! state_schema:
//!   type: object
//!   properties:
//!     findings: { type: array, merge: append_list }
//! nodes:
//!   - id: classify
//!     kind: AGENT
//!     config:
//!       agent_id: classifier
//!       output_key: category
//! edges:
//!   - { source: __start__, target: classify }
//!   - { source: classify, target: __end__ }
//! ```
//!
//! The executable form is produced by
//! [`compile`](crate::compiler::compile); a description itself cannot run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{GraphError, Result};

/// Node identifier: unique name for each node in the graph.
pub type NodeId = String;

/// Sentinel marking where execution begins. Valid only as an edge source.
pub const START: &str = "__start__";

/// Sentinel marking successful completion. Valid only as an edge target.
pub const END: &str = "__end__";

/// The closed set of node kinds. Extensions come from new tools, not new
/// kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    /// Runs the bounded agent tool loop and writes the final response
    /// under `output_key`.
    Agent,
    /// Selects one outgoing edge by evaluating conditions in order.
    Router,
    /// Fans out to every outgoing edge concurrently.
    Parallel,
    /// Waits for declared predecessors and aggregates their deltas.
    Join,
    /// Runs a nested graph against a projection of parent state.
    Subgraph,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Agent => "AGENT",
            NodeKind::Router => "ROUTER",
            NodeKind::Parallel => "PARALLEL",
            NodeKind::Join => "JOIN",
            NodeKind::Subgraph => "SUBGRAPH",
        }
    }
}

/// One node of a description: id, kind, and kind-specific config (decoded
/// into a typed config at compile time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: Value,
}

/// One edge of a description. `condition` is meaningful only on router
/// sources: a predicate expression or the token `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A declarative workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    /// Ordered: for routers, condition evaluation follows declaration order.
    pub edges: Vec<EdgeSpec>,
    pub entry_point: NodeId,
    /// JSON Schema for the state object; property schemas may carry a
    /// `merge` keyword (see [`crate::state::StateSchema`]).
    #[serde(default = "default_state_schema")]
    pub state_schema: Value,
    /// When set, a completed execution's output is the final state
    /// projected through this property instead of the whole state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

fn default_state_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl GraphSpec {
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_point: entry_point.into(),
            state_schema: default_state_schema(),
            output_key: None,
        }
    }

    pub fn add_node(mut self, id: impl Into<String>, kind: NodeKind, config: Value) -> Self {
        self.nodes.push(NodeSpec {
            id: id.into(),
            kind,
            config,
        });
        self
    }

    pub fn add_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(EdgeSpec {
            source: source.into(),
            target: target.into(),
            condition: None,
        });
        self
    }

    pub fn add_conditional_edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.edges.push(EdgeSpec {
            source: source.into(),
            target: target.into(),
            condition: Some(condition.into()),
        });
        self
    }

    pub fn with_state_schema(mut self, schema: Value) -> Self {
        self.state_schema = schema;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_output_key(mut self, output_key: impl Into<String>) -> Self {
        self.output_key = Some(output_key.into());
        self
    }

    /// Find a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Incoming edges of a node, in declaration order.
    pub fn edges_into<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Parse a description from YAML.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        serde_yaml::from_str(source).map_err(GraphError::from)
    }

    /// Parse a description from JSON.
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(GraphError::from)
    }

    /// Load a description from a `.yaml`/`.yml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Configuration(format!("cannot read {}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Serialize to YAML (workflow-document storage format).
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(GraphError::from)
    }
}

/// What to do when the tool loop hits its iteration cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnBudget {
    /// Fail the node (default).
    #[default]
    Fail,
    /// Complete the node with the last assistant message as a partial
    /// result.
    ReturnPartial,
}

/// Typed config for AGENT nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNodeConfig {
    /// Agent definition to resolve and bind.
    pub agent_id: String,
    /// Target argument name → `$.`-selector over state.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// State property the loop's final response is written under.
    pub output_key: String,
    /// Override for the loop's iteration cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub on_budget: OnBudget,
    /// Catch edge: node to route to if this node fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<NodeId>,
}

/// Join failure policies, consulted when a predecessor failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail as soon as any predecessor fails (default).
    #[default]
    Any,
    /// Fail only if more than half of the predecessors failed.
    Majority,
    /// Fail only if every predecessor failed.
    AllRequired,
}

/// Typed config for JOIN nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinNodeConfig {
    /// Predecessors this join waits for. Must match the incoming edges.
    pub wait_for: Vec<NodeId>,
    /// `merge_object`, `append_list`, or the name of a reducer registered
    /// in [`CompileOptions`](crate::compiler::CompileOptions).
    #[serde(default = "default_aggregation")]
    pub aggregation_strategy: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<NodeId>,
}

fn default_aggregation() -> String {
    "merge_object".to_string()
}

/// Typed config for SUBGRAPH nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphNodeConfig {
    /// Nested graph description, compiled along with the parent.
    pub graph: GraphSpec,
    /// Projection of parent state into the child's initial state.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// Parent state property the child's final state is written under.
    pub output_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<NodeId>,
}
