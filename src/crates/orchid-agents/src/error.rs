//! Error types for the agent catalog.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no agent definition for '{0}'")]
    UnknownAgent(String),

    #[error("no model provider registered for '{0}'")]
    UnknownProvider(String),

    #[error("tool '{tool_id}' required by agent '{agent_id}' is not available: {detail}")]
    MissingTool {
        agent_id: String,
        tool_id: String,
        detail: String,
    },

    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
