//! Tool definitions as presented to the model.
//!
//! A [`ToolDefinition`] is the schema-bearing description of a callable
//! tool: what function-calling providers receive so the model can decide
//! when and how to call it. The executable side lives in
//! [`crate::tool`]; this type is the wire-facing half.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of a callable tool, sent to the model with each request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name; the model refers to it in tool calls.
    pub name: String,
    /// What the tool does; the model uses this to decide when to call it.
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
    /// Declared purity. Within one loop iteration, calls are executed
    /// concurrently only when every requested tool is side-effect free.
    #[serde(default)]
    pub side_effect_free: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            side_effect_free: false,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn side_effect_free(mut self, pure: bool) -> Self {
        self.side_effect_free = pure;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_defaults() {
        let def = ToolDefinition::new("search", "Search the web");
        assert_eq!(def.parameters["type"], "object");
        assert!(!def.side_effect_free);
    }

    #[test]
    fn serde_shape() {
        let def = ToolDefinition::new("calc", "Arithmetic")
            .with_parameters(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}},
                "required": ["a"]
            }))
            .side_effect_free(true);
        let encoded = serde_json::to_value(&def).unwrap();
        assert_eq!(encoded["side_effect_free"], true);
        assert_eq!(encoded["parameters"]["required"][0], "a");
    }
}
