//! The [`ChatModel`] trait: the engine's only expectation of a provider.
//!
//! Implementations handle message conversion, transport, authentication,
//! and rate limiting for their provider. The engine handles everything
//! else: retries on retryable failures, iteration caps, tool execution,
//! cancellation, and transcript ordering.
//!
//! # Error mapping
//!
//! Adapters should return
//! [`GraphError::Provider`](crate::error::GraphError::Provider) with
//! `retryable: true` for transient failures (timeouts, 429s, 5xx) and
//! `retryable: false` for permanent ones (auth, invalid model). The tool
//! loop retries only retryable failures, with exponential backoff, and
//! only for the model call itself.

use crate::error::Result;
use crate::llm::config::{ChatRequest, ChatResponse};
use async_trait::async_trait;

/// Provider-agnostic chat interface.
///
/// Implementations must be `Send + Sync`; share them as
/// `Arc<dyn ChatModel>` across nodes and executions. Calls must be
/// idempotent from the engine's perspective; the engine may retry a
/// failed call.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate one complete response for the request.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Whether the backing service is reachable. Defaults to `true`;
    /// local-model adapters should override.
    async fn is_available(&self) -> bool {
        true
    }

    /// Clone into a boxed trait object.
    fn clone_box(&self) -> Box<dyn ChatModel>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::config::ModelConfig;
    use crate::messages::Message;
    use std::sync::Arc;

    #[derive(Clone)]
    struct FixedModel {
        reply: String,
    }

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse::new(Message::assistant(self.reply.clone())))
        }

        fn clone_box(&self) -> Box<dyn ChatModel> {
            Box::new(self.clone())
        }
    }

    #[tokio::test]
    async fn trait_object_usage() {
        let model: Arc<dyn ChatModel> = Arc::new(FixedModel {
            reply: "hello".into(),
        });
        let request = ChatRequest::new(
            vec![Message::user("hi")],
            ModelConfig::new("mock", "fixed"),
        );
        let response = model.chat(request).await.unwrap();
        assert_eq!(response.message.text(), Some("hello"));
        assert!(model.is_available().await);
    }
}
