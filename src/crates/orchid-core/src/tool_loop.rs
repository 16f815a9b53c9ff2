//! The bounded agent tool loop.
//!
//! Drives a [`ChatModel`] through tool-call iterations until it produces a
//! terminal response, a hard iteration cap is hit (default
//! [`DEFAULT_MAX_ITERATIONS`]), or cancellation fires. This is the engine
//! primitive behind AGENT nodes.
//!
//! Per iteration:
//!
//! 1. Call the model with the transcript and the bound tools' schemas.
//! 2. No tool calls in the response → the loop returns its content.
//! 3. Otherwise every requested call is executed (concurrently when all
//!    requested tools are declared side-effect free, sequentially in the
//!    model's emission order otherwise) and the results are appended to
//!    the transcript.
//!
//! Tool failures (including schema-invalid arguments) become structured
//! tool results the model can observe and recover from; they never abort
//! the loop. Hitting the cap yields
//! [`GraphError::ToolLoopBudgetExhausted`] carrying the full transcript.
//!
//! In structured-output mode the final content is validated against the
//! agent's `output_schema`; one validation failure is appended to the
//! transcript (costing an iteration) and the loop retries once before
//! surfacing [`GraphError::SchemaValidation`].
//!
//! Retryable provider failures are retried with exponential backoff;
//! only the model call itself, which is idempotent because tools execute
//! after it returns.

use crate::error::{GraphError, Result};
use crate::event::NodeEvents;
use crate::execution::CancelToken;
use crate::llm::{ChatModel, ChatRequest, ChatResponse, ModelConfig, ToolDefinition};
use crate::messages::{Message, ToolCall};
use crate::retry::RetryPolicy;
use crate::tool::{ToolBinding, ToolError};
use chrono::Utc;
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Default iteration cap.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Budgets for one loop run.
#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub max_iterations: usize,
    pub tool_timeout: Duration,
    /// Budget for one think/act iteration (model call plus tool batch).
    pub iteration_timeout: Option<Duration>,
    pub provider_retry: RetryPolicy,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout: Duration::from_secs(60),
            iteration_timeout: None,
            provider_retry: RetryPolicy::default(),
        }
    }
}

/// Result of a completed loop.
#[derive(Debug, Clone)]
pub struct LoopOutput {
    /// The model's final content (text as a JSON string, or the validated
    /// structured value).
    pub response: Value,
    /// Full ordered transcript.
    pub transcript: Vec<Message>,
    /// Iterations consumed.
    pub iterations: usize,
    /// Model calls made (equals iterations; kept separate for tests that
    /// assert no replay across resume).
    pub model_calls: usize,
}

/// A bound, runnable agent loop.
pub struct ToolLoop {
    model: Arc<dyn ChatModel>,
    model_config: ModelConfig,
    system_prompt: String,
    tools: Vec<ToolBinding>,
    output_schema: Option<(Value, Arc<JSONSchema>)>,
    config: ToolLoopConfig,
}

impl ToolLoop {
    pub fn new(
        model: Arc<dyn ChatModel>,
        model_config: ModelConfig,
        system_prompt: impl Into<String>,
        tools: Vec<ToolBinding>,
    ) -> Self {
        Self {
            model,
            model_config,
            system_prompt: system_prompt.into(),
            tools,
            output_schema: None,
            config: ToolLoopConfig::default(),
        }
    }

    /// Enable structured-output mode. Fails on an invalid schema.
    pub fn with_output_schema(mut self, schema: Value) -> Result<Self> {
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| GraphError::SchemaValidation(format!("invalid output_schema: {e}")))?;
        self.output_schema = Some((schema, Arc::new(compiled)));
        Ok(self)
    }

    pub fn with_config(mut self, config: ToolLoopConfig) -> Self {
        self.config = config;
        self
    }

    fn binding(&self, name: &str) -> Option<&ToolBinding> {
        self.tools.iter().find(|b| b.name() == name)
    }

    /// Run the loop to completion.
    pub async fn run(
        &self,
        input_bundle: Value,
        cancel: &CancelToken,
        events: &NodeEvents,
    ) -> Result<LoopOutput> {
        let mut messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(input_bundle),
        ];
        let tool_defs: Vec<ToolDefinition> =
            self.tools.iter().map(|b| b.definition().clone()).collect();

        let mut model_calls = 0usize;
        let mut schema_retried = false;

        for iteration in 1..=self.config.max_iterations {
            cancel.check()?;

            let step = async {
                let response = self.call_model(&messages, &tool_defs, cancel).await?;
                model_calls += 1;
                let assistant = response.message;
                messages.push(assistant.clone());

                if assistant.has_tool_calls() {
                    let calls = assistant.tool_calls().to_vec();
                    let results = self.execute_tool_calls(&calls, cancel, events).await?;
                    // Transcript order follows the model's emission order
                    // even when the calls themselves ran concurrently.
                    for (call, result) in results {
                        messages.push(Message::tool(result, call.id));
                    }
                    Ok::<Option<Value>, GraphError>(None)
                } else {
                    Ok(Some(assistant.content.to_value()))
                }
            };

            let outcome = match self.config.iteration_timeout {
                Some(budget) => match tokio::time::timeout(budget, step).await {
                    Ok(outcome) => outcome?,
                    Err(_) => {
                        return Err(GraphError::NodeTimeout {
                            node: events.node_id().to_string(),
                        })
                    }
                },
                None => step.await?,
            };

            if let Some(content) = outcome {
                if let Some((_, schema)) = &self.output_schema {
                    if let Err(detail) = validate_against(schema, &content) {
                        if !schema_retried {
                            schema_retried = true;
                            tracing::debug!(%detail, "structured output invalid, retrying once");
                            messages.push(Message::user(json!({
                                "error": "output_schema_validation_failed",
                                "detail": detail,
                            })));
                            continue;
                        }
                        return Err(GraphError::SchemaValidation(detail));
                    }
                }
                tracing::debug!(iterations = iteration, "tool loop complete");
                return Ok(LoopOutput {
                    response: content,
                    transcript: messages,
                    iterations: iteration,
                    model_calls,
                });
            }
        }

        Err(GraphError::ToolLoopBudgetExhausted {
            iterations: self.config.max_iterations,
            transcript: messages,
        })
    }

    /// One model call, retried with backoff on retryable provider errors.
    async fn call_model(
        &self,
        messages: &[Message],
        tool_defs: &[ToolDefinition],
        cancel: &CancelToken,
    ) -> Result<ChatResponse> {
        let mut attempts = 0usize;
        loop {
            cancel.check()?;
            let mut request = ChatRequest::new(messages.to_vec(), self.model_config.clone())
                .with_tools(tool_defs.to_vec());
            if let Some((schema, _)) = &self.output_schema {
                request = request.with_output_schema(schema.clone());
            }

            match self.model.chat(request).await {
                Ok(response) => return Ok(response),
                Err(err @ GraphError::Provider { retryable: true, .. }) => {
                    attempts += 1;
                    if !self.config.provider_retry.should_retry(attempts) {
                        return Err(err);
                    }
                    let delay = self.config.provider_retry.calculate_delay(attempts - 1);
                    tracing::warn!(attempt = attempts, ?delay, "provider error, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(GraphError::Cancelled),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Execute one iteration's tool calls. Returns `(call, result payload)`
    /// pairs in the model's emission order.
    async fn execute_tool_calls(
        &self,
        calls: &[ToolCall],
        cancel: &CancelToken,
        events: &NodeEvents,
    ) -> Result<Vec<(ToolCall, Value)>> {
        let all_pure = calls.iter().all(|call| {
            self.binding(&call.name)
                .map(|b| b.side_effect_free())
                .unwrap_or(false)
        });

        if all_pure && calls.len() > 1 {
            cancel.check()?;
            let futures: Vec<_> = calls.iter().map(|call| self.run_one(call, events)).collect();
            let results = futures::future::join_all(futures).await;
            Ok(calls.iter().cloned().zip(results).collect())
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                // Cancellation is observed at least between tool calls.
                cancel.check()?;
                let result = self.run_one(call, events).await;
                results.push((call.clone(), result));
            }
            Ok(results)
        }
    }

    /// Run one tool call; failures become structured results, not errors.
    async fn run_one(&self, call: &ToolCall, events: &NodeEvents) -> Value {
        let started_at = Utc::now();
        events.tool_call(&call.name, &call.args);

        let outcome = match self.binding(&call.name) {
            Some(binding) => {
                binding
                    .invoke(call.args.clone(), self.config.tool_timeout)
                    .await
            }
            None => Err(ToolError::Unavailable(format!(
                "no tool named '{}'",
                call.name
            ))),
        };

        events.tool_result(&call.name, &call.args, started_at, &outcome);
        match outcome {
            Ok(value) => value,
            Err(err) => err.to_result_value(),
        }
    }
}

fn validate_against(schema: &JSONSchema, value: &Value) -> std::result::Result<(), String> {
    match schema.validate(value) {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")),
    }
}
