//! # Parley
//!
//! Multi-agent group chat for translating data between schemas and
//! ontologies.
//!
//! A fixed roster of role-bound agents takes turns on a shared, append-only
//! transcript. A router picks each speaker; every candidate translation an
//! agent proposes is checked against the target schema and ontology by a
//! deterministic validation gate, and only a passing gate ends the session
//! successfully.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           ORCHESTRATOR                           │
//! │   start_session() ──► fork registry ──► spawn GroupChat task     │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ one task per session
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            GROUP CHAT                            │
//! │  ┌────────────┐   ┌──────────┐   ┌──────────┐   ┌─────────────┐  │
//! │  │ TurnRouter │──►│  Agent   │──►│ Session  │──►│ Validation  │  │
//! │  │ (policy)   │   │ (role)   │   │ append   │   │    Gate     │  │
//! │  └────────────┘   └────┬─────┘   └────┬─────┘   └──────┬──────┘  │
//! └────────────────────────┼──────────────┼────────────────┼─────────┘
//!                          ▼              ▼                ▼
//!                 ┌────────────────┐ ┌──────────┐ ┌───────────────────┐
//!                 │ Completion /   │ │Transcript│ │   ToolRegistry    │
//!                 │ ToolRegistry   │ │ (append- │ │ schema_validate   │
//!                 └────────────────┘ │   only)  │ │ ontology_validate │
//!                                    └──────────┘ └───────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: a participant bound to one role (planner, coder, executor,
//!   validator, ...) with its own permitted tools
//! - **Transcript**: ordered, append-only log of turns; snapshots are prefixes
//! - **Round**: one advancing agent turn; the session budget counts rounds
//! - **Gate**: schema then ontology validation of the latest candidate, then a
//!   diff against the reference record when one is supplied

pub mod agent;
pub mod channel;
pub mod completion;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod roster;
pub mod router;
pub mod sandbox;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod types;
pub mod validation;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentSpec, TerminationSignal, TurnDraft};
pub use channel::{ChatChannel, ChatEvent, EventSender};
pub use completion::{CompletionService, ContextMessage};
pub use config::{ChatConfig, CompletionSettings, RolePrompts};
pub use error::ParleyError;
pub use orchestrator::{GroupChat, Orchestrator, SessionHandle};
pub use roster::Roster;
pub use router::{RouteDecision, RoutingPolicy, TurnRouter};
pub use sandbox::{CodeRequest, CodeSandbox, ProcessSandbox};
pub use session::{FailureReason, SessionOutcome, SessionState};
pub use tools::{Tool, ToolRegistry};
pub use transcript::{Snapshot, Transcript};
pub use types::{
    AgentId, AgentRole, FieldError, Ontology, SessionId, ToolCall, ToolId, TranslationInputs,
    Triple, Turn, TurnKind, TurnPayload, ValidationResult, ValidationTarget,
};
pub use validation::{
    compare_with_reference, validate_against_ontology, validate_against_schema, ValidationGate,
};
