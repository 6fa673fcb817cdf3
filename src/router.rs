//! Turn router - picks the next speaker

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ParleyError;
use crate::roster::Roster;
use crate::types::{AgentId, AgentRole, Turn, TurnKind, TurnPayload};

/// Speaker selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Fixed roster order, skipping retired agents
    #[default]
    RoundRobin,
    /// The planner's latest payload names the next speaker; everyone else
    /// hands back to the planner
    PlannerDirected,
    /// Next role follows from the last speaker's role and output
    RoleTransitions,
}

/// Result of routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub speaker: AgentId,
    /// Why the policy was abandoned for round-robin, if it was
    pub fallback: Option<String>,
}

pub struct TurnRouter {
    policy: RoutingPolicy,
}

/// Most recent turn produced by a speaker (agent output or failure)
fn last_spoken(transcript: &[Arc<Turn>]) -> Option<&Turn> {
    transcript
        .iter()
        .rev()
        .find(|turn| turn.is_spoken())
        .map(|turn| turn.as_ref())
}

/// Whether a gate rejection follows the last spoken turn
fn gate_rejected_last(transcript: &[Arc<Turn>]) -> bool {
    transcript
        .iter()
        .rev()
        .take_while(|turn| !turn.is_spoken())
        .filter(|turn| turn.kind == TurnKind::Gate)
        .find_map(|turn| turn.validation())
        .map(|result| !result.passed)
        .unwrap_or(false)
}

impl TurnRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Select the next speaker. Fails only when nobody is eligible.
    pub fn next_speaker(
        &self,
        transcript: &[Arc<Turn>],
        roster: &Roster,
    ) -> Result<RouteDecision, ParleyError> {
        let directed = match self.policy {
            RoutingPolicy::RoundRobin => None,
            RoutingPolicy::PlannerDirected => Some(Self::planner_directed(transcript, roster)),
            RoutingPolicy::RoleTransitions => Some(Self::role_transition(transcript, roster)),
        };

        let fallback = match directed {
            Some(Ok(speaker)) => {
                return Ok(RouteDecision {
                    speaker,
                    fallback: None,
                })
            }
            Some(Err(e)) => {
                warn!(policy = ?self.policy, error = %e, "Falling back to round-robin");
                Some(e.to_string())
            }
            None => None,
        };

        let speaker = Self::round_robin(transcript, roster)
            .ok_or_else(|| ParleyError::InvalidRouting("no eligible speaker".into()))?;
        Ok(RouteDecision { speaker, fallback })
    }

    /// Next eligible agent in roster order after the most recent speaker
    pub fn round_robin(transcript: &[Arc<Turn>], roster: &Roster) -> Option<AgentId> {
        if roster.is_empty() {
            return None;
        }

        let start = last_spoken(transcript)
            .and_then(|turn| roster.position(&turn.speaker))
            .map(|pos| pos + 1)
            .unwrap_or(0);

        (0..roster.len())
            .map(|offset| roster.agent_at((start + offset) % roster.len()))
            .find(|agent| !roster.is_retired(agent.id()))
            .map(|agent| agent.id().clone())
    }

    fn planner_directed(transcript: &[Arc<Turn>], roster: &Roster) -> Result<AgentId, ParleyError> {
        let planner = roster
            .by_role(AgentRole::Planner)
            .ok_or_else(|| ParleyError::InvalidRouting("no planner in roster".into()))?;

        let Some(last) = last_spoken(transcript).filter(|turn| &turn.speaker == planner.id()) else {
            if roster.is_eligible(planner.id()) {
                return Ok(planner.id().clone());
            }
            return Err(ParleyError::InvalidRouting("planner has retired".into()));
        };

        let named = match &last.payload {
            Some(TurnPayload::Plan(plan)) => plan.next_speaker.as_deref(),
            _ => None,
        }
        .ok_or_else(|| ParleyError::InvalidRouting("planner named no next speaker".into()))?;

        let next = AgentId::from(named);
        if roster.get(&next).is_none() {
            return Err(ParleyError::InvalidRouting(format!("unknown speaker `{named}`")));
        }
        if next == last.speaker {
            return Err(ParleyError::InvalidRouting(format!(
                "`{named}` cannot speak twice in a row"
            )));
        }
        if roster.is_retired(&next) {
            return Err(ParleyError::InvalidRouting(format!("`{named}` has retired")));
        }
        Ok(next)
    }

    fn role_transition(transcript: &[Arc<Turn>], roster: &Roster) -> Result<AgentId, ParleyError> {
        let validators = [AgentRole::Validator, AgentRole::ToolCallingValidator];

        let targets: &[AgentRole] = match last_spoken(transcript) {
            None => &[AgentRole::Planner],
            Some(last) if last.kind == TurnKind::Failure => {
                return Err(ParleyError::InvalidRouting(format!(
                    "{} failed its last turn",
                    last.speaker
                )))
            }
            Some(last) => match last.role {
                AgentRole::Planner => &[AgentRole::Coder],
                AgentRole::UserProxy => &[AgentRole::Planner],
                AgentRole::Coder if last.code().is_some() => &[AgentRole::Executor],
                AgentRole::Coder if gate_rejected_last(transcript) => &[AgentRole::Planner],
                AgentRole::Coder => &[AgentRole::UserProxy],
                AgentRole::Executor => match &last.payload {
                    Some(TurnPayload::Execution(out)) if out.error.is_some() => &[AgentRole::Coder],
                    _ => &validators,
                },
                AgentRole::Validator => match &last.payload {
                    Some(TurnPayload::Verdict(verdict)) if !verdict.passed => &[AgentRole::Planner],
                    _ => &[AgentRole::UserProxy],
                },
                AgentRole::ToolCallingValidator if !last.tool_requests.is_empty() => {
                    &[AgentRole::ToolRunner]
                }
                AgentRole::ToolCallingValidator if gate_rejected_last(transcript) => {
                    &[AgentRole::Planner]
                }
                AgentRole::ToolCallingValidator => &[AgentRole::UserProxy],
                AgentRole::ToolRunner => &validators,
            },
        };

        roster
            .agents()
            .find(|agent| targets.contains(&agent.role()) && !roster.is_retired(agent.id()))
            .map(|agent| agent.id().clone())
            .ok_or_else(|| {
                ParleyError::InvalidRouting(format!("no eligible agent for roles {targets:?}"))
            })
    }
}
