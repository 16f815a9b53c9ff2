//! LLM integration traits and types.
//!
//! orchid is an orchestration engine, not an LLM client library. The core
//! defines a minimal provider-agnostic seam, [`ChatModel`], and the
//! request/response types crossing it; provider adapters (HTTP clients,
//! local runtimes) live outside the engine and implement the trait.
//!
//! The agent tool loop drives a `ChatModel` with the transcript, the bound
//! tools' JSON Schemas, and the agent's [`ModelConfig`]; the adapter
//! converts to its wire format and back.
//!
//! ```rust,ignore
//! use orchid_core::llm::{ChatModel, ChatRequest, ChatResponse};
//! use orchid_core::Message;
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyProvider { /* http client, auth */ }
//!
//! #[async_trait]
//! impl ChatModel for MyProvider {
//!     async fn chat(&self, request: ChatRequest) -> orchid_core::Result<ChatResponse> {
//!         // convert request.messages + request.tools, call the API,
//!         // map the response back into a Message
//!         todo!()
//!     }
//!
//!     fn clone_box(&self) -> Box<dyn ChatModel> {
//!         Box::new(self.clone())
//!     }
//! }
//! ```

pub mod config;
pub mod tools;
pub mod traits;

pub use config::{ChatRequest, ChatResponse, ModelConfig, UsageMetadata};
pub use tools::ToolDefinition;
pub use traits::ChatModel;
