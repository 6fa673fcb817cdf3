//! Main orchestrator - runs group chats to a terminal state

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{Agent, TurnContext, TurnDraft};
use crate::channel::{ChatChannel, ChatEvent, EventSender};
use crate::completion::CompletionService;
use crate::config::ChatConfig;
use crate::error::ParleyError;
use crate::roster::Roster;
use crate::router::TurnRouter;
use crate::session::{FailureReason, Session, SessionOutcome, SessionState};
use crate::tools::ToolRegistry;
use crate::transcript::Transcript;
use crate::types::{AgentId, AgentRole, SessionId, TranslationInputs, Turn, TurnKind, TurnPayload};
use crate::validation::ValidationGate;

/// Speaker recorded on gate turns when no validator takes part
const GATE_SPEAKER: &str = "validation_gate";

/// One translation session: routes turns between agents, gates candidates
/// and decides when to stop.
///
/// Exactly one task drives a `GroupChat`, so every append is serialized.
/// Other tasks may read the live transcript through [`GroupChat::transcript`].
pub struct GroupChat {
    config: ChatConfig,
    roster: Roster,
    router: TurnRouter,
    registry: Arc<ToolRegistry>,
    completion: Arc<dyn CompletionService>,
    inputs: TranslationInputs,
    gate: ValidationGate,
    session: Session,
    cancel: CancellationToken,
    events: EventSender,
}

impl GroupChat {
    pub fn new(
        config: ChatConfig,
        registry: Arc<ToolRegistry>,
        completion: Arc<dyn CompletionService>,
        inputs: TranslationInputs,
    ) -> Result<Self, ParleyError> {
        config.validate()?;
        let roster = Roster::new(config.agents.clone())?;
        let router = TurnRouter::new(config.routing);
        let gate = ValidationGate::from_inputs(&inputs);
        let session = Session::new(config.round_budget, config.max_consecutive_failures);

        Ok(Self {
            config,
            roster,
            router,
            registry,
            completion,
            inputs,
            gate,
            session,
            cancel: CancellationToken::new(),
            events: EventSender::default(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn transcript(&self) -> Arc<Transcript> {
        self.session.transcript()
    }

    /// Drive the chat until it reaches a terminal state.
    ///
    /// Only transcript misuse is returned as an error; every other way a
    /// session can end is reported in the outcome.
    #[instrument(skip(self, task), fields(session_id = %self.session.id))]
    pub async fn run(mut self, task: &str) -> Result<SessionOutcome, ParleyError> {
        self.session.start();
        info!(
            policy = ?self.router.policy(),
            agents = self.roster.len(),
            service = %self.config.completion.service_name,
            model = %self.config.completion.model,
            tool_timeout = ?self.registry.timeout(),
            "Group chat started"
        );
        self.events.emit(ChatEvent::SessionStarted {
            session_id: self.session.id,
            agents: self.roster.agents().map(|agent| agent.id().clone()).collect(),
        });

        self.post_task(task)?;
        while !self.session.state().is_terminal() {
            self.step().await?;
        }

        let outcome = self.session.outcome();
        self.events.emit(ChatEvent::SessionFinished {
            session_id: outcome.session_id,
            state: outcome.state.clone(),
            rounds: outcome.rounds,
        });
        Ok(outcome)
    }

    fn post_task(&mut self, task: &str) -> Result<(), ParleyError> {
        let speaker = self
            .roster
            .by_role(AgentRole::UserProxy)
            .map(|agent| agent.id().clone())
            .unwrap_or_else(|| AgentId::from("user"));

        let content = if self.config.send_introductions {
            format!("{}\n\n{}", self.roster.introductions(), task)
        } else {
            task.to_string()
        };

        let turn = self
            .session
            .next_turn(speaker, AgentRole::UserProxy, TurnKind::Task, content, None);
        self.append(turn)?;
        Ok(())
    }

    async fn step(&mut self) -> Result<(), ParleyError> {
        if self.cancel.is_cancelled() {
            self.session.finish(SessionState::Cancelled, None);
            return Ok(());
        }
        if self.session.turn_count() >= self.config.turn_limit() {
            warn!(turns = self.session.turn_count(), "Turn limit reached");
            self.session.finish(SessionState::BudgetExhausted, None);
            return Ok(());
        }

        let snapshot = self.session.snapshot();
        let decision = match self.router.next_speaker(&snapshot, &self.roster) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "No speaker available");
                self.session
                    .finish(SessionState::Failed(FailureReason::NoEligibleSpeaker), None);
                return Ok(());
            }
        };

        if let Some(reason) = &decision.fallback {
            self.events.emit(ChatEvent::RoutingFallback {
                session_id: self.session.id,
                speaker: decision.speaker.clone(),
                reason: reason.clone(),
            });
        }

        let agent = self
            .roster
            .get(&decision.speaker)
            .cloned()
            .ok_or_else(|| ParleyError::AgentNotFound(decision.speaker.clone()))?;
        debug!(speaker = %agent.id(), round = self.session.round(), "Selected speaker");

        // In-flight turns run to completion; a cancelled session drops the result
        let result = self.produce(&agent, &snapshot).await;
        if self.cancel.is_cancelled() {
            debug!(speaker = %agent.id(), "Discarding turn finished after cancellation");
            self.session.finish(SessionState::Cancelled, None);
            return Ok(());
        }

        match result {
            Ok(draft) => self.accept(&agent, draft).await?,
            Err(ParleyError::RegistryUnavailable) => {
                error!(speaker = %agent.id(), "Tool registry unavailable");
                self.session
                    .finish(SessionState::Failed(FailureReason::RegistryUnavailable), None);
            }
            Err(e) if e.is_recoverable() => {
                self.record_failure(agent.id().clone(), agent.role(), &e)?;
            }
            Err(e) => return Err(e),
        }

        // Success is settled before the budget is checked
        if !self.session.state().is_terminal() && self.session.budget_exhausted() {
            info!(rounds = self.session.round(), "Round budget exhausted");
            self.session.finish(SessionState::BudgetExhausted, None);
        }
        Ok(())
    }

    async fn produce(&self, agent: &Agent, snapshot: &[Arc<Turn>]) -> Result<TurnDraft, ParleyError> {
        let ctx = TurnContext {
            registry: self.registry.as_ref(),
            completion: self.completion.as_ref(),
            inputs: &self.inputs,
        };

        tokio::time::timeout(self.config.turn_timeout(), agent.produce_turn(snapshot, &ctx))
            .await
            .unwrap_or_else(|_| {
                Err(ParleyError::agent_failure(
                    agent.id(),
                    format!("turn timed out after {}ms", self.config.turn_timeout_ms),
                ))
            })
    }

    async fn accept(&mut self, agent: &Agent, draft: TurnDraft) -> Result<(), ParleyError> {
        let failed_tool = draft.has_failed_invocation();
        let fired = agent.termination_fired(&draft.content);

        let mut turn = self.session.next_turn(
            agent.id().clone(),
            agent.role(),
            TurnKind::Agent,
            draft.content,
            draft.payload,
        );
        turn.tool_invocations = draft.tool_invocations;
        turn.tool_requests = draft.tool_requests;
        turn.advances_round = self.config.advances_round(agent.role());
        let turn = self.append(turn)?;

        if fired {
            info!(agent = %agent.id(), "Termination signal received");
            self.roster.retire(agent.id());
            if agent.role() == AgentRole::UserProxy {
                let reason = FailureReason::TerminationSignal {
                    agent: agent.id().clone(),
                };
                self.session.finish(SessionState::Failed(reason), None);
                return Ok(());
            }
            if self.roster.eligible_count() == 0 {
                warn!("Every agent has retired");
                self.session
                    .finish(SessionState::Failed(FailureReason::NoEligibleSpeaker), None);
                return Ok(());
            }
        }

        if failed_tool {
            warn!(agent = %agent.id(), "Tool invocation failed during turn");
            if self.session.record_failure() {
                self.fail_consecutive();
                return Ok(());
            }
        }

        // A turn carrying a candidate is clean only once the gate has run
        if turn.candidate().is_some() {
            self.run_gate(!failed_tool).await?;
        } else if !failed_tool {
            self.session.record_success();
        }
        Ok(())
    }

    async fn run_gate(&mut self, clean: bool) -> Result<(), ParleyError> {
        let snapshot = self.session.snapshot();
        let Some(candidate) = ValidationGate::latest_candidate(&snapshot).cloned() else {
            return Ok(());
        };
        let (speaker, role) = self.gate_speaker();

        match self.gate.evaluate(&candidate, &self.registry).await {
            Ok(result) => {
                if clean {
                    self.session.record_success();
                }
                let passed = result.passed;
                info!(passed, errors = result.errors.len(), "Gate evaluated candidate");
                let turn = self.session.next_turn(
                    speaker,
                    role,
                    TurnKind::Gate,
                    result.summary(),
                    Some(TurnPayload::Validation(result)),
                );
                self.append(turn)?;
                if passed {
                    self.session.finish(SessionState::Succeeded, Some(candidate));
                }
            }
            Err(ParleyError::RegistryUnavailable) => {
                error!("Tool registry unavailable during validation");
                self.session
                    .finish(SessionState::Failed(FailureReason::RegistryUnavailable), None);
            }
            Err(e) if e.is_recoverable() => self.record_failure(speaker, role, &e)?,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn gate_speaker(&self) -> (AgentId, AgentRole) {
        self.roster
            .by_role(AgentRole::ToolCallingValidator)
            .or_else(|| self.roster.by_role(AgentRole::Validator))
            .map(|agent| (agent.id().clone(), agent.role()))
            .unwrap_or_else(|| (AgentId::from(GATE_SPEAKER), AgentRole::Validator))
    }

    fn record_failure(
        &mut self,
        speaker: AgentId,
        role: AgentRole,
        error: &ParleyError,
    ) -> Result<(), ParleyError> {
        warn!(agent = %speaker, error = %error, "Turn failed");
        let reason = error.to_string();
        let turn = self.session.next_turn(
            speaker,
            role,
            TurnKind::Failure,
            reason.clone(),
            Some(TurnPayload::Failure { reason }),
        );
        self.append(turn)?;

        if self.session.record_failure() {
            self.fail_consecutive();
        }
        Ok(())
    }

    fn fail_consecutive(&mut self) {
        let count = self.session.consecutive_failures();
        error!(count, "Too many consecutive failures");
        self.session.finish(
            SessionState::Failed(FailureReason::ConsecutiveFailures { count }),
            None,
        );
    }

    fn append(&mut self, turn: Turn) -> Result<Arc<Turn>, ParleyError> {
        let turn = self.session.append(turn)?;
        if self.events.is_connected() {
            self.events.emit(ChatEvent::TurnAppended {
                session_id: self.session.id,
                turn: turn.as_ref().clone(),
            });
        }
        Ok(turn)
    }
}

/// Handle to a spawned session
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
    join: JoinHandle<Result<SessionOutcome, ParleyError>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Request cancellation; the session ends as cancelled at its next check
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<SessionOutcome, ParleyError> {
        self.join
            .await
            .map_err(|e| ParleyError::SessionAborted(e.to_string()))?
    }
}

/// The main orchestrator
///
/// Starts independent sessions, each with its own roster, transcript and
/// registry fork. Tool implementations and the completion service are shared.
pub struct Orchestrator {
    config: ChatConfig,
    registry: ToolRegistry,
    completion: Arc<dyn CompletionService>,
    /// Cancellation tokens of running sessions
    sessions: Arc<RwLock<HashMap<SessionId, CancellationToken>>>,
    events: EventSender,
}

impl Orchestrator {
    pub fn new(
        config: ChatConfig,
        registry: ToolRegistry,
        completion: Arc<dyn CompletionService>,
    ) -> Result<Self, ParleyError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            completion,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events: EventSender::default(),
        })
    }

    /// Create an orchestrator and return a channel receiving its events
    pub fn with_channel(
        config: ChatConfig,
        registry: ToolRegistry,
        completion: Arc<dyn CompletionService>,
    ) -> Result<(Self, ChatChannel), ParleyError> {
        let (channel, events) = ChatChannel::new();
        let mut orchestrator = Self::new(config, registry, completion)?;
        orchestrator.events = events;
        Ok((orchestrator, channel))
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Template registry; sessions run against forks of it
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Spawn a session on the runtime. The session's registry fork bounds
    /// each invocation by the configured tool timeout.
    #[instrument(skip_all)]
    pub fn start_session(
        &self,
        task: impl Into<String>,
        inputs: TranslationInputs,
    ) -> Result<SessionHandle, ParleyError> {
        let registry = Arc::new(self.registry.fork_with_timeout(self.config.tool_timeout()));
        let cancel = CancellationToken::new();
        let chat = GroupChat::new(
            self.config.clone(),
            Arc::clone(&registry),
            Arc::clone(&self.completion),
            inputs,
        )?
        .with_cancellation(cancel.clone())
        .with_events(self.events.clone());

        let session_id = chat.session_id();
        self.sessions.write().insert(session_id, cancel.clone());

        let sessions = Arc::clone(&self.sessions);
        let task = task.into();
        let join = tokio::spawn(async move {
            let result = chat.run(&task).await;
            registry.close();
            sessions.write().remove(&session_id);
            result
        });

        info!(session_id = %session_id, "Started session");
        Ok(SessionHandle {
            id: session_id,
            cancel,
            join,
        })
    }

    /// Start a session and wait for its outcome
    pub async fn run_session(
        &self,
        task: impl Into<String>,
        inputs: TranslationInputs,
    ) -> Result<SessionOutcome, ParleyError> {
        self.start_session(task, inputs)?.wait().await
    }

    /// Cancel a running session by id
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.sessions.read().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running session
    pub fn cancel_all(&self) {
        for token in self.sessions.read().values() {
            token.cancel();
        }
    }

    /// Ids of sessions still running
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }
}
