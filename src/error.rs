//! Parley error types

use thiserror::Error;

use crate::types::{AgentId, ToolId};

/// Errors that can occur while running a group chat
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Transcript misuse (concurrent or out-of-order append)
    #[error("Transcript ordering violated: {0}")]
    Ordering(String),

    /// Next speaker could not be determined from the routing input
    #[error("Invalid routing: {0}")]
    InvalidRouting(String),

    /// Agent turn failed (completion error, timeout, malformed output)
    #[error("Agent {agent} failed: {reason}")]
    AgentFailure { agent: AgentId, reason: String },

    /// Tool not registered
    #[error("Unknown tool: {0}")]
    UnknownTool(ToolId),

    /// Tool ran and failed, or timed out
    #[error("Tool {tool} failed: {reason}")]
    ToolExecution { tool: ToolId, reason: String },

    /// Tool registry can no longer service invocations
    #[error("Tool registry unavailable")]
    RegistryUnavailable,

    /// Agent not found in the roster
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Spawned session task panicked or was aborted
    #[error("Session task aborted: {0}")]
    SessionAborted(String),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ParleyError {
    /// Build an agent failure
    pub fn agent_failure(agent: &AgentId, reason: impl Into<String>) -> Self {
        Self::AgentFailure {
            agent: agent.clone(),
            reason: reason.into(),
        }
    }

    /// Build a tool execution failure
    pub fn tool_execution(tool: &ToolId, reason: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the session can continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidRouting(_)
                | Self::AgentFailure { .. }
                | Self::UnknownTool(_)
                | Self::ToolExecution { .. }
        )
    }
}
