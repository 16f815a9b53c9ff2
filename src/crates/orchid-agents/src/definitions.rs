//! Agent definitions and the in-memory catalog resolver.
//!
//! An [`AgentDefinition`] is the serializable record describing an agent:
//! its instructions, model configuration, the tool ids it may call, and
//! an optional structured-output schema. In a deployed service these rows
//! live in a database; the [`CatalogResolver`] keeps them in memory and
//! implements the compiler's [`Resolver`] seam over them, binding each
//! definition to a registered provider handle and resolved tools at
//! compile time.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use orchid_core::compiler::{AgentBinding, Resolver};
use orchid_core::llm::{ChatModel, ModelConfig};
use orchid_core::tool::{Tool, ToolBinding, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A declarative agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Identifier referenced by AGENT node configs.
    pub id: String,
    pub name: String,
    /// System prompt for the tool loop.
    pub system_prompt: String,
    pub model: ModelConfig,
    /// Tools bound to this agent, by registry id.
    #[serde(default)]
    pub tool_ids: Vec<String>,
    /// When set, responses must validate against this schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Definition-level iteration cap (node config may override).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>, model: ModelConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            system_prompt: system_prompt.into(),
            model,
            tool_ids: Vec::new(),
            output_schema: None,
            max_iterations: None,
        }
    }

    pub fn with_tools<I, S>(mut self, tool_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_ids = tool_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }
}

/// In-memory catalog of agents, providers, and tools, implementing the
/// compile-time [`Resolver`] contract.
///
/// Build it once at startup, then hand it to
/// [`compile`](orchid_core::compiler::compile):
///
/// ```rust,ignore
/// let catalog = CatalogResolver::new()
///     .with_provider("anthropic", anthropic_client)
///     .with_tool(SearchTool::new(api_key))?
///     .with_agent(AgentDefinition::new(
///         "researcher",
///         "You research questions with the search tool.",
///         ModelConfig::new("anthropic", "claude-sonnet-4-5"),
///     ).with_tools(["search"]))?;
///
/// let graph = compile(&spec, &catalog, &CompileOptions::default()).await?;
/// ```
#[derive(Default)]
pub struct CatalogResolver {
    agents: HashMap<String, AgentDefinition>,
    providers: HashMap<String, Arc<dyn ChatModel>>,
    tools: ToolRegistry,
}

impl CatalogResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent definition.
    pub fn with_agent(mut self, definition: AgentDefinition) -> Result<Self> {
        if self.agents.contains_key(&definition.id) {
            return Err(AgentError::DuplicateAgent(definition.id));
        }
        self.agents.insert(definition.id.clone(), definition);
        Ok(self)
    }

    /// Register the model handle for a provider key.
    pub fn with_provider(mut self, provider: impl Into<String>, model: Arc<dyn ChatModel>) -> Self {
        self.providers.insert(provider.into(), model);
        self
    }

    /// Register a catalog-local tool. Tools not found here fall back to
    /// the process-wide registry.
    pub fn with_tool<T: Tool + 'static>(mut self, tool: T) -> Result<Self> {
        let name = tool.name().to_string();
        self.tools
            .register(tool)
            .map_err(|e| AgentError::MissingTool {
                agent_id: "<catalog>".into(),
                tool_id: name,
                detail: e.to_string(),
            })?;
        Ok(self)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.agents.get(agent_id)
    }

    fn bind(&self, definition: &AgentDefinition) -> Result<AgentBinding> {
        let model = self
            .providers
            .get(&definition.model.provider)
            .cloned()
            .ok_or_else(|| AgentError::UnknownProvider(definition.model.provider.clone()))?;

        let mut tools: Vec<ToolBinding> = Vec::with_capacity(definition.tool_ids.len());
        for tool_id in &definition.tool_ids {
            let binding = self
                .tools
                .resolve(tool_id)
                .or_else(|_| ToolRegistry::global_resolve(tool_id))
                .map_err(|e| AgentError::MissingTool {
                    agent_id: definition.id.clone(),
                    tool_id: tool_id.clone(),
                    detail: e.to_string(),
                })?;
            tools.push(binding);
        }

        Ok(AgentBinding {
            agent_id: definition.id.clone(),
            system_prompt: definition.system_prompt.clone(),
            model,
            model_config: definition.model.clone(),
            tools,
            output_schema: definition.output_schema.clone(),
            max_iterations: definition.max_iterations,
        })
    }
}

#[async_trait]
impl Resolver for CatalogResolver {
    async fn resolve_agent(&self, agent_id: &str) -> std::result::Result<AgentBinding, String> {
        let definition = self
            .agents
            .get(agent_id)
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()).to_string())?;
        self.bind(definition).map_err(|e| e.to_string())
    }

    async fn resolve_tool(&self, tool_id: &str) -> std::result::Result<ToolBinding, String> {
        self.tools
            .resolve(tool_id)
            .or_else(|_| ToolRegistry::global_resolve(tool_id))
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use orchid_core::messages::Message;

    fn definition(id: &str) -> AgentDefinition {
        AgentDefinition::new(id, "prompt", ModelConfig::new("mock", "m1"))
    }

    #[tokio::test]
    async fn resolves_registered_agent() {
        let catalog = CatalogResolver::new()
            .with_provider("mock", Arc::new(ScriptedModel::new(vec![Message::assistant("hi")])))
            .with_agent(definition("helper"))
            .unwrap();

        let binding = catalog.resolve_agent("helper").await.unwrap();
        assert_eq!(binding.agent_id, "helper");
        assert!(binding.tools.is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_and_provider_fail() {
        let catalog = CatalogResolver::new();
        assert!(catalog.resolve_agent("ghost").await.is_err());

        let catalog = CatalogResolver::new().with_agent(definition("helper")).unwrap();
        let err = catalog.resolve_agent("helper").await.unwrap_err();
        assert!(err.contains("provider"));
    }

    #[tokio::test]
    async fn missing_tool_reported() {
        let catalog = CatalogResolver::new()
            .with_provider("mock", Arc::new(ScriptedModel::new(vec![Message::assistant("hi")])))
            .with_agent(definition("helper").with_tools(["does_not_exist"]))
            .unwrap();
        let err = catalog.resolve_agent("helper").await.unwrap_err();
        assert!(err.contains("does_not_exist"));
    }

    #[test]
    fn duplicate_agent_rejected() {
        let result = CatalogResolver::new()
            .with_agent(definition("a"))
            .unwrap()
            .with_agent(definition("a"));
        assert!(matches!(result, Err(AgentError::DuplicateAgent(_))));
    }
}
