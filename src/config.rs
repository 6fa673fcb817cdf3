//! Group chat settings
//!
//! Reading the settings file is left to the caller; this module only defines
//! the typed value and checks it before a session starts.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentSpec;
use crate::error::ParleyError;
use crate::router::RoutingPolicy;
use crate::types::AgentRole;

/// Active completion service selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSettings {
    pub service_name: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            service_name: "OpenAI".into(),
            model: "gpt-4o".into(),
            base_url: None,
        }
    }
}

/// System instructions for the standard roster
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePrompts {
    pub planner: String,
    pub user_proxy: String,
    pub coder: String,
    pub executor: String,
    pub validator: String,
    pub tool_calling_validator: String,
    pub tool_runner: String,
}

/// Settings consumed by one group chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Rounds before the session ends as budget exhausted
    pub round_budget: u32,
    /// Consecutive failed turns tolerated before the session fails
    pub max_consecutive_failures: u32,
    pub routing: RoutingPolicy,
    pub turn_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    /// Roles whose turns do not consume a round
    pub non_advancing_roles: Vec<AgentRole>,
    /// Prefix the task with an introduction of every agent
    pub send_introductions: bool,
    pub completion: CompletionSettings,
    pub agents: Vec<AgentSpec>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            round_budget: 50,
            max_consecutive_failures: 3,
            routing: RoutingPolicy::RoundRobin,
            turn_timeout_ms: 120_000,
            tool_timeout_ms: 60_000,
            non_advancing_roles: vec![AgentRole::ToolRunner],
            send_introductions: false,
            completion: CompletionSettings::default(),
            agents: Vec::new(),
        }
    }
}

impl ChatConfig {
    /// Parse settings from JSON text
    pub fn from_json(text: &str) -> Result<Self, ParleyError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_agents(mut self, agents: Vec<AgentSpec>) -> Self {
        self.agents = agents;
        self
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn advances_round(&self, role: AgentRole) -> bool {
        !self.non_advancing_roles.contains(&role)
    }

    /// Upper bound on transcript turns, independent of round accounting
    pub fn turn_limit(&self) -> usize {
        self.round_budget as usize * (self.agents.len() + 2)
    }

    /// Reject settings a session cannot run with
    pub fn validate(&self) -> Result<(), ParleyError> {
        if self.round_budget == 0 {
            return Err(ParleyError::ConfigError("round_budget must be at least 1".into()));
        }
        if self.agents.is_empty() {
            return Err(ParleyError::ConfigError("no agents configured".into()));
        }
        if self.turn_timeout_ms == 0 || self.tool_timeout_ms == 0 {
            return Err(ParleyError::ConfigError("timeouts must be non-zero".into()));
        }

        let mut seen = HashSet::new();
        for spec in &self.agents {
            if !seen.insert(spec.id.clone()) {
                return Err(ParleyError::ConfigError(format!(
                    "duplicate agent id: {}",
                    spec.id
                )));
            }
        }

        if self.agents.iter().all(|spec| !self.advances_round(spec.role)) {
            return Err(ParleyError::ConfigError(
                "at least one agent must advance rounds".into(),
            ));
        }

        let has = |role: AgentRole| self.agents.iter().any(|spec| spec.role == role);
        if self.routing == RoutingPolicy::PlannerDirected && !has(AgentRole::Planner) {
            return Err(ParleyError::ConfigError(
                "planner-directed routing needs a planner agent".into(),
            ));
        }
        if has(AgentRole::ToolCallingValidator) && !has(AgentRole::ToolRunner) {
            return Err(ParleyError::ConfigError(
                "tool-calling validator needs a tool runner".into(),
            ));
        }

        Ok(())
    }
}
