//! Test doubles for driving workflows without a live provider.
//!
//! [`ScriptedModel`] replays a fixed sequence of assistant messages and
//! records what it was asked, which is enough to exercise every engine
//! path: tool calls, structured output, budget exhaustion, pause/resume
//! call counting.

use async_trait::async_trait;
use orchid_core::error::{GraphError, Result};
use orchid_core::llm::{ChatModel, ChatRequest, ChatResponse};
use orchid_core::messages::Message;
use orchid_core::tool::{Tool, ToolError, ToolResult};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays a script of assistant messages; repeats the last entry once
/// the script is exhausted.
#[derive(Clone)]
pub struct ScriptedModel {
    script: Arc<Vec<Message>>,
    calls: Arc<AtomicUsize>,
    seen_inputs: Arc<Mutex<Vec<Value>>>,
    fail_with: Option<(String, bool)>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Message>) -> Self {
        assert!(!script.is_empty(), "script must have at least one message");
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
            seen_inputs: Arc::new(Mutex::new(Vec::new())),
            fail_with: None,
        }
    }

    /// A model that always fails with a provider error.
    pub fn failing(detail: impl Into<String>, retryable: bool) -> Self {
        Self {
            script: Arc::new(vec![Message::assistant("unreachable")]),
            calls: Arc::new(AtomicUsize::new(0)),
            seen_inputs: Arc::new(Mutex::new(Vec::new())),
            fail_with: Some((detail.into(), retryable)),
        }
    }

    /// Number of chat calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The user-message payloads observed, in call order.
    pub fn seen_inputs(&self) -> Vec<Value> {
        self.seen_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(user) = request
            .messages
            .iter()
            .find(|m| m.role == orchid_core::messages::MessageRole::User)
        {
            self.seen_inputs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(user.content.to_value());
        }
        if let Some((detail, retryable)) = &self.fail_with {
            return Err(GraphError::Provider {
                detail: detail.clone(),
                retryable: *retryable,
            });
        }
        let message = self
            .script
            .get(index.min(self.script.len() - 1))
            .cloned()
            .unwrap_or_else(|| Message::assistant("script exhausted"));
        Ok(ChatResponse::new(message))
    }

    fn clone_box(&self) -> Box<dyn ChatModel> {
        Box::new(self.clone())
    }
}

/// Pure tool that returns its arguments unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns its arguments unchanged"
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> ToolResult<Value> {
        Ok(args)
    }
}

/// Tool that never completes within any reasonable deadline.
pub struct HangingTool {
    name: String,
}

impl HangingTool {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for HangingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Hangs until the deadline fires"
    }

    async fn execute(&self, _args: Value) -> ToolResult<Value> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

/// Tool that always reports failure.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn execute(&self, _args: Value) -> ToolResult<Value> {
        Err(ToolError::Failed("flaky tool fell over".into()))
    }
}
