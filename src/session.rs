//! Session state for one translation chat

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ParleyError;
use crate::transcript::{Snapshot, Transcript};
use crate::types::{AgentId, AgentRole, SessionId, Turn, TurnKind, TurnPayload};

/// Why a session ended in failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// More consecutive failed turns than the configured limit
    ConsecutiveFailures { count: u32 },
    /// Tool registry closed under the session
    RegistryUnavailable,
    /// The user proxy emitted its termination signal
    TerminationSignal { agent: AgentId },
    /// Every agent has retired
    NoEligibleSpeaker,
}

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Running,
    Succeeded,
    Failed(FailureReason),
    BudgetExhausted,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Initializing | SessionState::Running)
    }
}

/// Final report of a finished session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub state: SessionState,
    /// Accepted target data, present only on success
    pub output: Option<Value>,
    pub transcript: Snapshot,
    pub rounds: u32,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == SessionState::Succeeded
    }
}

/// Mutable bookkeeping of a running chat.
///
/// Owned by exactly one task; the transcript it holds can be shared for
/// reading through [`Session::transcript`].
pub struct Session {
    pub id: SessionId,
    transcript: Arc<Transcript>,
    state: SessionState,
    round: u32,
    budget: u32,
    max_failures: u32,
    consecutive_failures: u32,
    output: Option<Value>,
}

impl Session {
    pub fn new(budget: u32, max_failures: u32) -> Self {
        let id = SessionId::new();
        debug!(session_id = %id, budget, "Creating session");

        Self {
            id,
            transcript: Arc::new(Transcript::new()),
            state: SessionState::Initializing,
            round: 0,
            budget,
            max_failures,
            consecutive_failures: 0,
            output: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn transcript(&self) -> Arc<Transcript> {
        Arc::clone(&self.transcript)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.transcript.snapshot()
    }

    pub fn turn_count(&self) -> usize {
        self.transcript.len()
    }

    pub fn start(&mut self) {
        if self.state == SessionState::Initializing {
            self.state = SessionState::Running;
            info!(session_id = %self.id, "Session running");
        }
    }

    /// Fresh turn stamped with the next sequence number
    pub fn next_turn(
        &self,
        speaker: AgentId,
        role: AgentRole,
        kind: TurnKind,
        content: impl Into<String>,
        payload: Option<TurnPayload>,
    ) -> Turn {
        Turn {
            seq: self.transcript.len(),
            speaker,
            role,
            kind,
            content: content.into(),
            payload,
            tool_invocations: Vec::new(),
            tool_requests: Vec::new(),
            advances_round: false,
            timestamp: Utc::now(),
        }
    }

    /// Append a turn; advancing agent turns consume one round
    pub fn append(&mut self, mut turn: Turn) -> Result<Arc<Turn>, ParleyError> {
        if self.state.is_terminal() {
            return Err(ParleyError::Ordering(format!(
                "append after session ended as {:?}",
                self.state
            )));
        }
        if turn.kind != TurnKind::Agent {
            turn.advances_round = false;
        }

        let advances = turn.advances_round;
        self.transcript.append(turn)?;
        if advances {
            self.round += 1;
        }

        self.transcript
            .last()
            .ok_or_else(|| ParleyError::Ordering("transcript empty after append".into()))
    }

    /// Count a failed turn. Returns true once the limit is exceeded.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures > self.max_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn budget_exhausted(&self) -> bool {
        self.round >= self.budget
    }

    /// Move to a terminal state. Terminal states are final.
    pub fn finish(&mut self, state: SessionState, output: Option<Value>) {
        if self.state.is_terminal() {
            warn!(session_id = %self.id, current = ?self.state, ignored = ?state, "Session already finished");
            return;
        }

        info!(session_id = %self.id, state = ?state, rounds = self.round, "Session finished");
        self.output = if state == SessionState::Succeeded { output } else { None };
        self.state = state;
    }

    pub fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            session_id: self.id,
            state: self.state.clone(),
            output: self.output.clone(),
            transcript: self.snapshot(),
            rounds: self.round,
        }
    }
}
