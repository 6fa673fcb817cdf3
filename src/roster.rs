//! Session roster - the ordered set of agents taking part in a chat

use std::collections::{HashMap, HashSet};

use crate::agent::{Agent, AgentSpec};
use crate::error::ParleyError;
use crate::types::{AgentId, AgentRole};

/// Agents in speaking order, plus those retired by a termination signal
pub struct Roster {
    agents: Vec<Agent>,
    index: HashMap<AgentId, usize>,
    retired: HashSet<AgentId>,
}

impl Roster {
    pub fn new(specs: Vec<AgentSpec>) -> Result<Self, ParleyError> {
        let mut agents = Vec::with_capacity(specs.len());
        let mut index = HashMap::new();

        for spec in specs {
            if index.insert(spec.id.clone(), agents.len()).is_some() {
                return Err(ParleyError::ConfigError(format!(
                    "duplicate agent id: {}",
                    spec.id
                )));
            }
            agents.push(Agent::new(spec));
        }

        Ok(Self {
            agents,
            index,
            retired: HashSet::new(),
        })
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.index.get(id).map(|&i| &self.agents[i])
    }

    pub fn position(&self, id: &AgentId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn agent_at(&self, position: usize) -> &Agent {
        &self.agents[position]
    }

    /// First agent with the given role
    pub fn by_role(&self, role: AgentRole) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.role() == role)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    /// Mark an agent as done for the session
    pub fn retire(&mut self, id: &AgentId) -> bool {
        self.index.contains_key(id) && self.retired.insert(id.clone())
    }

    pub fn is_retired(&self, id: &AgentId) -> bool {
        self.retired.contains(id)
    }

    /// Known and not retired
    pub fn is_eligible(&self, id: &AgentId) -> bool {
        self.index.contains_key(id) && !self.is_retired(id)
    }

    pub fn eligible_count(&self) -> usize {
        self.agents.len() - self.retired.len()
    }

    /// One line per agent, used to open the chat when introductions are on
    pub fn introductions(&self) -> String {
        let mut out = String::from("Participants:");
        for agent in &self.agents {
            out.push_str(&format!("\n- {} ({})", agent.id(), agent.role()));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
