//! Boundary to the language-model completion service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{AgentRole, Turn, ToolOutcome};

/// One transcript entry as the completion service sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub speaker: String,
    pub role: AgentRole,
    pub content: String,
}

impl ContextMessage {
    /// Render a turn, including any tool results it carries
    pub fn from_turn(turn: &Turn) -> Self {
        let mut content = turn.content.clone();

        if !turn.tool_invocations.is_empty() {
            content.push_str("\n\nTool results:");
            for inv in &turn.tool_invocations {
                let rendered = match &inv.outcome {
                    ToolOutcome::Ok { result } => result.to_string(),
                    ToolOutcome::Err { error } => format!("error: {error}"),
                };
                content.push_str(&format!("\n- {}: {}", inv.tool_id, rendered));
            }
        }

        if !turn.tool_requests.is_empty() {
            content.push_str("\n\nRequested tool calls:");
            for call in &turn.tool_requests {
                content.push_str(&format!("\n- {}({})", call.tool, call.arguments));
            }
        }

        Self {
            speaker: turn.speaker.to_string(),
            role: turn.role,
            content,
        }
    }
}

/// Opaque, possibly remote text completion.
///
/// Any error (transport, quota, malformed response) becomes an agent failure
/// for the turn that called it.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        system_instruction: &str,
        context: &[ContextMessage],
    ) -> anyhow::Result<String>;
}
