//! Tool abstractions: the [`Tool`] trait, the process-wide registry, and
//! the validating invoker.
//!
//! Tools are the engine's extension point: new capabilities arrive as new
//! tool implementations, never as new node kinds. A tool declares a JSON
//! Schema for its arguments; the invoker validates every call against it
//! and executes under a deadline.
//!
//! # Failure model
//!
//! Tool failures are *data*, not control flow: [`ToolError`] is formatted
//! into a structured tool-result message and handed back to the model,
//! which can observe the failure and recover within the same loop. A tool
//! failure never aborts the node by itself.
//!
//! # Registry
//!
//! The registry is process-wide and append-once: build a [`ToolRegistry`]
//! at startup, then [`ToolRegistry::install`] it. After installation the
//! global is read-only; request handlers can only resolve.
//!
//! ```rust
//! use orchid_core::tool::{Tool, ToolRegistry};
//! # use async_trait::async_trait;
//! # use serde_json::{json, Value};
//! # struct Echo;
//! # #[async_trait]
//! # impl Tool for Echo {
//! #     fn name(&self) -> &str { "echo" }
//! #     fn description(&self) -> &str { "Echoes its input" }
//! #     async fn execute(&self, args: Value) -> Result<Value, orchid_core::tool::ToolError> {
//! #         Ok(args)
//! #     }
//! # }
//! let mut registry = ToolRegistry::new();
//! registry.register(Echo).unwrap();
//! let binding = registry.resolve("echo").unwrap();
//! assert_eq!(binding.definition().name, "echo");
//! ```

use crate::llm::tools::ToolDefinition;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Categorised tool failure, surfaced to the agent as a structured tool
/// result.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Arguments did not validate against the tool's JSON Schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The call exceeded its deadline.
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    /// The tool is not registered or its backing service is down.
    #[error("tool unavailable: {0}")]
    Unavailable(String),

    /// The tool ran and reported a failure.
    #[error("tool failed: {0}")]
    Failed(String),
}

impl ToolError {
    /// Stable kind discriminant for events and tool-result payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidArguments(_) => "INVALID_ARGUMENTS",
            ToolError::Timeout(_) => "TOOL_TIMEOUT",
            ToolError::Unavailable(_) => "TOOL_UNAVAILABLE",
            ToolError::Failed(_) => "TOOL_FAILED",
        }
    }

    /// The structured payload appended to the transcript as this call's
    /// result, shaped so the model can read what went wrong.
    pub fn to_result_value(&self) -> Value {
        json!({
            "status": "error",
            "kind": self.kind(),
            "detail": self.to_string(),
        })
    }
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// An executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name; the model calls the tool by this name.
    fn name(&self) -> &str;

    /// What the tool does; shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    /// Declared purity: `true` permits concurrent execution with other
    /// pure calls in the same loop iteration.
    fn side_effect_free(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> ToolResult<Value>;
}

/// A resolved tool: schema compiled, ready to invoke.
#[derive(Clone)]
pub struct ToolBinding {
    definition: ToolDefinition,
    tool: Arc<dyn Tool>,
    schema: Arc<JSONSchema>,
}

impl ToolBinding {
    /// Bind a tool, compiling its parameter schema. Fails if the tool
    /// declares an invalid schema.
    pub fn new(tool: Arc<dyn Tool>) -> ToolResult<Self> {
        let parameters = tool.parameters();
        let schema = JSONSchema::compile(&parameters).map_err(|e| {
            ToolError::Unavailable(format!("tool '{}' has an invalid schema: {e}", tool.name()))
        })?;
        let definition = ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters,
            side_effect_free: tool.side_effect_free(),
        };
        Ok(Self {
            definition,
            tool,
            schema: Arc::new(schema),
        })
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn side_effect_free(&self) -> bool {
        self.definition.side_effect_free
    }

    /// Validate arguments against the tool's schema without executing.
    pub fn validate(&self, args: &Value) -> ToolResult<()> {
        let result = self.schema.validate(args);
        if let Err(errors) = result {
            let detail = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ToolError::InvalidArguments(detail));
        }
        Ok(())
    }

    /// Validate, then execute under `deadline`.
    pub async fn invoke(&self, args: Value, deadline: Duration) -> ToolResult<Value> {
        self.validate(&args)?;
        tracing::debug!(tool = %self.definition.name, "invoking tool");
        match tokio::time::timeout(deadline, self.tool.execute(args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(deadline)),
        }
    }
}

impl std::fmt::Debug for ToolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBinding")
            .field("name", &self.definition.name)
            .field("side_effect_free", &self.definition.side_effect_free)
            .finish()
    }
}

/// A set of named tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolBinding>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails on duplicate names or invalid schemas.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> ToolResult<()> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> ToolResult<()> {
        let binding = ToolBinding::new(tool)?;
        let name = binding.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Failed(format!(
                "tool '{name}' is already registered"
            )));
        }
        self.tools.insert(name, binding);
        Ok(())
    }

    /// Resolve a tool by name.
    pub fn resolve(&self, tool_id: &str) -> ToolResult<ToolBinding> {
        self.tools
            .get(tool_id)
            .cloned()
            .ok_or_else(|| ToolError::Unavailable(format!("no tool named '{tool_id}'")))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Install this registry as the process-wide registry. May be called
    /// once, at startup; the installed registry is read-only afterwards.
    pub fn install(self) -> ToolResult<()> {
        let slot = global_slot();
        let mut guard = slot.write();
        if guard.is_some() {
            return Err(ToolError::Failed(
                "global tool registry is already installed".into(),
            ));
        }
        tracing::info!(tools = self.len(), "tool registry installed");
        *guard = Some(Arc::new(self));
        Ok(())
    }

    /// Resolve from the installed process-wide registry.
    pub fn global_resolve(tool_id: &str) -> ToolResult<ToolBinding> {
        let slot = global_slot();
        let guard = slot.read();
        match guard.as_ref() {
            Some(registry) => registry.resolve(tool_id),
            None => Err(ToolError::Unavailable(
                "no global tool registry installed".into(),
            )),
        }
    }
}

fn global_slot() -> &'static RwLock<Option<Arc<ToolRegistry>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<ToolRegistry>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Adder;

    #[async_trait]
    impl Tool for Adder {
        fn name(&self) -> &str {
            "adder"
        }

        fn description(&self) -> &str {
            "Adds two numbers"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number"}
                },
                "required": ["a", "b"]
            })
        }

        fn side_effect_free(&self) -> bool {
            true
        }

        async fn execute(&self, args: Value) -> ToolResult<Value> {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!({"sum": a + b}))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Tool for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn description(&self) -> &str {
            "Sleeps forever"
        }

        async fn execute(&self, _args: Value) -> ToolResult<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn invoke_validates_and_executes() {
        let mut registry = ToolRegistry::new();
        registry.register(Adder).unwrap();
        let binding = registry.resolve("adder").unwrap();

        let result = binding
            .invoke(json!({"a": 2, "b": 3}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["sum"], 5.0);
    }

    #[tokio::test]
    async fn invalid_arguments_categorised() {
        let mut registry = ToolRegistry::new();
        registry.register(Adder).unwrap();
        let binding = registry.resolve("adder").unwrap();

        let err = binding
            .invoke(json!({"a": "two"}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert_eq!(err.to_result_value()["kind"], "INVALID_ARGUMENTS");
    }

    #[tokio::test]
    async fn timeout_categorised() {
        let mut registry = ToolRegistry::new();
        registry.register(Sleeper).unwrap();
        let binding = registry.resolve("sleeper").unwrap();

        let err = binding
            .invoke(json!({}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn unknown_tool_unavailable() {
        let registry = ToolRegistry::new();
        let err = registry.resolve("nope").unwrap_err();
        assert!(matches!(err, ToolError::Unavailable(_)));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Adder).unwrap();
        assert!(registry.register(Adder).is_err());
    }
}
