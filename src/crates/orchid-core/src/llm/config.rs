//! Model configuration and the request/response types for [`ChatModel`].
//!
//! [`ModelConfig`] is part of an agent definition: it names the provider
//! and model and carries generation parameters. [`ChatRequest`] bundles a
//! transcript with that config, the bound tools' definitions, and an
//! optional structured-output schema.

use crate::llm::tools::ToolDefinition;
use crate::messages::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::ChatModel;

/// Provider and generation parameters for an agent's model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider key (e.g. `"openai"`, `"anthropic"`, `"ollama"`); used by
    /// the resolver to pick a [`ChatModel`] handle.
    pub provider: String,
    /// Provider-specific model name.
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A single call to a chat model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: ModelConfig,
    /// Definitions of the tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// When set, the provider's native structured-output facility is
    /// requested and the returned content must conform to this schema.
    pub output_schema: Option<Value>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, model: ModelConfig) -> Self {
        Self {
            messages,
            model,
            tools: Vec::new(),
            output_schema: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// A complete model response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The assistant message; `tool_calls` non-empty when the model wants
    /// tools executed.
    pub message: Message,
    pub usage: Option<UsageMetadata>,
}

impl ChatResponse {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: UsageMetadata) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Enable cloning for boxed model handles.
impl Clone for Box<dyn ChatModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_config_builder() {
        let config = ModelConfig::new("anthropic", "claude-sonnet-4-5")
            .with_max_tokens(2048)
            .with_temperature(0.2);
        assert_eq!(config.max_tokens, Some(2048));
        assert_eq!(config.temperature, Some(0.2));
    }

    #[test]
    fn model_config_serde_omits_unset() {
        let config = ModelConfig::new("ollama", "llama3");
        let encoded = serde_json::to_value(&config).unwrap();
        assert!(encoded.get("max_tokens").is_none());
        assert!(encoded.get("temperature").is_none());
    }
}
