//! # orchid-agents: agent catalog and prebuilt workflow patterns
//!
//! The pieces that sit between a deployment and the
//! [`orchid-core`](orchid_core) engine:
//!
//! - [`AgentDefinition`]: the serializable record describing an agent
//!   (instructions, model config, tool ids, output schema).
//! - [`CatalogResolver`]: an in-memory implementation of the compiler's
//!   [`Resolver`](orchid_core::compiler::Resolver) seam: definitions plus
//!   per-provider [`ChatModel`](orchid_core::llm::ChatModel) handles and
//!   a tool registry.
//! - [`patterns`]: prebuilt [`GraphSpec`](orchid_core::GraphSpec)
//!   builders: linear chains, the plan-confirmation wizard, and parallel
//!   fan-out/join.
//! - [`testing`]: scripted models and tools for exercising workflows
//!   without a live provider.
//!
//! ```rust,ignore
//! use orchid_agents::{AgentDefinition, CatalogResolver, patterns};
//! use orchid_core::{compile, CompileOptions, ExecutionRequest, GraphRuntime, ModelConfig};
//! use orchid_checkpoint::MemoryCheckpointer;
//! use std::sync::Arc;
//!
//! let catalog = CatalogResolver::new()
//!     .with_provider("anthropic", client)
//!     .with_agent(AgentDefinition::new(
//!         "planner",
//!         "Break the request into steps.",
//!         ModelConfig::new("anthropic", "claude-sonnet-4-5"),
//!     ))?;
//!
//! let spec = patterns::confirmation_wizard("travel", "planner", "booker");
//! let graph = compile(&spec, &catalog, &CompileOptions::default()).await?;
//! let runtime = GraphRuntime::new(graph, Arc::new(MemoryCheckpointer::new()));
//! ```

pub mod definitions;
pub mod error;
pub mod patterns;
pub mod testing;

pub use definitions::{AgentDefinition, CatalogResolver};
pub use error::{AgentError, Result};
