//! Prebuilt workflow descriptions.
//!
//! Common graph shapes expressed as plain [`GraphSpec`] values: callers
//! register the referenced agents in a catalog, compile, and run. Nothing
//! here is executable by itself; these are descriptions, the same thing
//! a user would write in YAML.

use orchid_core::graph::{GraphSpec, NodeKind, END, START};
use serde_json::json;

/// Node id of the confirmation gate in [`confirmation_wizard`] graphs.
/// Pass it to
/// [`ExecutionOptions::with_interrupt_before`](orchid_core::ExecutionOptions::with_interrupt_before)
/// to pause there.
pub const CONFIRM_GATE: &str = "confirm_gate";

/// A straight chain of agents: each node writes its response under its
/// own output key, and the next node sees the accumulated state.
///
/// `stages` is `(node_id, agent_id, output_key)` in execution order.
pub fn linear_agent_chain(name: &str, stages: &[(&str, &str, &str)]) -> GraphSpec {
    let mut spec = GraphSpec::new(name, stages.first().map(|s| s.0).unwrap_or(END));
    for (node_id, agent_id, output_key) in stages {
        spec = spec.add_node(
            *node_id,
            NodeKind::Agent,
            json!({"agent_id": agent_id, "output_key": output_key}),
        );
    }
    let mut previous = START.to_string();
    for (node_id, _, _) in stages {
        spec = spec.add_edge(previous, *node_id);
        previous = node_id.to_string();
    }
    spec.add_edge(previous, END)
}

/// A plan-then-confirm wizard.
///
/// The planner writes a plan, the confirmation gate routes on
/// `plan_confirmed`: confirmed plans proceed to the executor, anything
/// else ends the run. Pause the execution at the gate
/// (`interrupt_before(CONFIRM_GATE)`) to hand the plan to a user; resume
/// the same thread with `{"plan_confirmed": true}` to proceed.
pub fn confirmation_wizard(name: &str, planner_agent: &str, executor_agent: &str) -> GraphSpec {
    GraphSpec::new(name, "plan")
        .add_node(
            "plan",
            NodeKind::Agent,
            json!({"agent_id": planner_agent, "output_key": "plan"}),
        )
        .add_node(CONFIRM_GATE, NodeKind::Router, json!({}))
        .add_node(
            "execute",
            NodeKind::Agent,
            json!({
                "agent_id": executor_agent,
                "output_key": "result",
                "input_mapping": {"plan": "$.plan"}
            }),
        )
        .add_edge(START, "plan")
        .add_edge("plan", CONFIRM_GATE)
        .add_conditional_edge(CONFIRM_GATE, "execute", "plan_confirmed == true")
        .add_conditional_edge(CONFIRM_GATE, END, "default")
        .add_edge("execute", END)
}

/// Concurrent fan-out over worker agents with a joining aggregation.
///
/// Every worker writes under `output_key`; the join combines the branch
/// deltas with `aggregation_strategy` (`append_list` for list-valued
/// outputs, `merge_object` for disjoint keys, or a registered reducer
/// name).
pub fn fan_out_join(
    name: &str,
    workers: &[(&str, &str)],
    output_key: &str,
    aggregation_strategy: &str,
) -> GraphSpec {
    let mut spec = GraphSpec::new(name, "fan_out").add_node("fan_out", NodeKind::Parallel, json!({}));
    let wait_for: Vec<&str> = workers.iter().map(|(node_id, _)| *node_id).collect();
    for (node_id, agent_id) in workers {
        spec = spec.add_node(
            *node_id,
            NodeKind::Agent,
            json!({"agent_id": agent_id, "output_key": output_key}),
        );
    }
    spec = spec.add_node(
        "gather",
        NodeKind::Join,
        json!({
            "wait_for": wait_for,
            "aggregation_strategy": aggregation_strategy,
        }),
    );
    spec = spec.add_edge(START, "fan_out");
    for (node_id, _) in workers {
        spec = spec.add_edge("fan_out", *node_id).add_edge(*node_id, "gather");
    }
    spec.add_edge("gather", END)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_shape() {
        let spec = linear_agent_chain(
            "pipeline",
            &[("draft", "writer", "draft"), ("review", "editor", "review")],
        );
        assert_eq!(spec.nodes.len(), 2);
        assert_eq!(spec.edges.len(), 3);
        assert_eq!(spec.edges[0].source, START);
        assert_eq!(spec.edges.last().unwrap().target, END);
    }

    #[test]
    fn wizard_routes_on_confirmation() {
        let spec = confirmation_wizard("wizard", "planner", "executor");
        let gate_edges: Vec<_> = spec.edges_from(CONFIRM_GATE).collect();
        assert_eq!(gate_edges.len(), 2);
        assert_eq!(
            gate_edges[0].condition.as_deref(),
            Some("plan_confirmed == true")
        );
        assert_eq!(gate_edges[1].condition.as_deref(), Some("default"));
    }

    #[test]
    fn fan_out_declares_matching_wait_for() {
        let spec = fan_out_join(
            "research",
            &[("web", "searcher"), ("docs", "reader")],
            "findings",
            "append_list",
        );
        let join = spec.node("gather").unwrap();
        assert_eq!(join.config["wait_for"], json!(["web", "docs"]));
        // One parallel edge and one join edge per worker, plus entry and
        // exit.
        assert_eq!(spec.edges.len(), 2 + 2 * 2);
    }
}
