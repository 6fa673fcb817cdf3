//! Protocol types shared by the transcript, agents, tools and the validation gate

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Agent identifier (the agent's name in the group chat)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Tool identifier in a [`ToolRegistry`](crate::tools::ToolRegistry)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(String);

impl ToolId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ToolId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ToolId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of agent roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Breaks the translation task into a task graph and may direct the next speaker
    Planner,
    /// Stands in for the human admin; opens the chat with the task
    UserProxy,
    /// Writes translation code or proposes candidate target data
    Coder,
    /// Runs the latest code through the sandbox
    Executor,
    /// Judges the last output and returns a verdict
    Validator,
    /// Requests schema/ontology validation tool calls
    ToolCallingValidator,
    /// Executes tool calls requested by agents without execution rights
    ToolRunner,
}

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::Planner,
        AgentRole::UserProxy,
        AgentRole::Coder,
        AgentRole::Executor,
        AgentRole::Validator,
        AgentRole::ToolCallingValidator,
        AgentRole::ToolRunner,
    ];

    /// Roles whose completion output may carry tool calls the agent runs itself
    pub fn calls_tools(&self) -> bool {
        matches!(
            self,
            AgentRole::Coder | AgentRole::ToolCallingValidator | AgentRole::ToolRunner
        )
    }

    /// Roles that consult the completion service
    pub fn uses_completion(&self) -> bool {
        !matches!(self, AgentRole::Executor | AgentRole::ToolRunner)
    }

    pub fn is_validator(&self) -> bool {
        matches!(self, AgentRole::Validator | AgentRole::ToolCallingValidator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::UserProxy => "user_proxy",
            AgentRole::Coder => "coder",
            AgentRole::Executor => "executor",
            AgentRole::Validator => "validator",
            AgentRole::ToolCallingValidator => "tool_calling_validator",
            AgentRole::ToolRunner => "tool_runner",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Opening task prompt
    Task,
    /// Output of an agent
    Agent,
    /// Combined schema/ontology result from the validation gate
    Gate,
    /// Recorded agent failure
    Failure,
}

/// One immutable entry of the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Position in the transcript
    pub seq: usize,
    pub speaker: AgentId,
    pub role: AgentRole,
    pub kind: TurnKind,
    pub content: String,
    pub payload: Option<TurnPayload>,
    /// Tool calls the speaker ran during its turn
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    /// Tool calls the speaker asked for but is not permitted to run
    #[serde(default)]
    pub tool_requests: Vec<ToolCall>,
    pub advances_round: bool,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Candidate target data carried by this turn, if any
    pub fn candidate(&self) -> Option<&Value> {
        match &self.payload {
            Some(TurnPayload::Code(code)) => code.candidate.as_ref(),
            Some(TurnPayload::Execution(out)) if out.error.is_none() => out.result.as_ref(),
            _ => None,
        }
    }

    /// Gate result carried by this turn, if any
    pub fn validation(&self) -> Option<&ValidationResult> {
        match &self.payload {
            Some(TurnPayload::Validation(result)) => Some(result),
            _ => None,
        }
    }

    /// Code emitted by a coder turn
    pub fn code(&self) -> Option<&str> {
        match &self.payload {
            Some(TurnPayload::Code(code)) => code.code.as_deref(),
            _ => None,
        }
    }

    pub fn has_failed_invocation(&self) -> bool {
        self.tool_invocations.iter().any(|inv| !inv.outcome.is_ok())
    }

    /// Turn produced by a speaker (agent output or recorded failure)
    pub fn is_spoken(&self) -> bool {
        matches!(self.kind, TurnKind::Agent | TurnKind::Failure)
    }
}

/// Structured payload attached to a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnPayload {
    Plan(PlanPayload),
    Code(CodePayload),
    Execution(ExecutionOutput),
    Verdict(ValidatorVerdict),
    ToolCalls(ToolCallPayload),
    Validation(ValidationResult),
    Failure { reason: String },
}

/// Planner output: task graph plus an optional routing hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanPayload {
    pub task_graph: Vec<PlanTask>,
    #[serde(default)]
    pub next_speaker: Option<String>,
}

/// One node of the planner's task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanTask {
    pub id: u32,
    pub task: String,
    /// Tasks that must be answered first
    #[serde(default)]
    pub subtasks: Vec<u32>,
}

/// Coder output
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodePayload {
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    /// Proposed target data
    #[serde(default)]
    pub candidate: Option<Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// Result of running code in the sandbox
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// LLM validator opinion; advisory, never terminates the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorVerdict {
    pub passed: bool,
    pub errors: Vec<FieldError>,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// Tool-calling validator output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCallPayload {
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// A requested tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCall {
    pub tool: ToolId,
    #[serde(default)]
    pub arguments: Value,
}

/// A tool call that went through the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: ToolId,
    pub arguments: Value,
    pub outcome: ToolOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok { result: Value },
    Err { error: String },
}

impl ToolOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok { .. })
    }
}

/// What a validation ran against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTarget {
    Schema,
    Ontology,
    /// Known-good target record for the same source
    Reference,
}

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Outcome of checking a candidate against schema and/or ontology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub errors: Vec<FieldError>,
    pub validated_against: Vec<ValidationTarget>,
}

impl ValidationResult {
    pub fn from_errors(target: ValidationTarget, errors: Vec<FieldError>) -> Self {
        Self {
            passed: errors.is_empty(),
            errors,
            validated_against: vec![target],
        }
    }

    /// Combine two results; passes only if both pass, errors keep `self` first
    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.passed = self.passed && other.passed;
        self.errors.extend(other.errors);
        self.validated_against.extend(other.validated_against);
        self
    }

    /// Feedback text written into the transcript
    pub fn summary(&self) -> String {
        if self.passed {
            return "VALID".to_string();
        }
        let mut out = String::from("INVALID");
        for err in &self.errors {
            out.push_str(&format!("\n- {}: {}", err.field, err.message));
        }
        out
    }
}

/// RDF-style statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

/// Already-parsed ontology graph
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ontology {
    pub triples: Vec<Triple>,
}

impl Ontology {
    pub fn new(triples: Vec<Triple>) -> Self {
        Self { triples }
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

/// Source/target example pair shown to the agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePair {
    pub source: Value,
    pub target: Value,
}

/// Everything one translation job works from, already ingested
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TranslationInputs {
    pub source_data: Value,
    pub source_schema: Value,
    pub target_schema: Value,
    #[serde(default)]
    pub source_ontology: Ontology,
    #[serde(default)]
    pub target_ontology: Ontology,
    #[serde(default)]
    pub samples: Vec<SamplePair>,
    /// Expected translation of `source_data`, when one is known
    #[serde(default)]
    pub reference_target: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(payload: TurnPayload) -> Turn {
        Turn {
            seq: 0,
            speaker: AgentId::from("Coder"),
            role: AgentRole::Coder,
            kind: TurnKind::Agent,
            content: String::new(),
            payload: Some(payload),
            tool_invocations: vec![],
            tool_requests: vec![],
            advances_round: true,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_candidate_from_code_and_execution() {
        let code = turn(TurnPayload::Code(CodePayload {
            candidate: Some(json!({"Name_notes": "x"})),
            ..Default::default()
        }));
        assert_eq!(code.candidate(), Some(&json!({"Name_notes": "x"})));

        let failed = turn(TurnPayload::Execution(ExecutionOutput {
            stdout: String::new(),
            result: Some(json!({})),
            error: Some("exitcode: 1".into()),
        }));
        assert!(failed.candidate().is_none());
    }

    #[test]
    fn test_merge_keeps_order() {
        let schema = ValidationResult::from_errors(
            ValidationTarget::Schema,
            vec![FieldError::new("a", "missing")],
        );
        let onto = ValidationResult::from_errors(
            ValidationTarget::Ontology,
            vec![FieldError::new("b", "unknown")],
        );
        let merged = schema.merge(onto);
        assert!(!merged.passed);
        assert_eq!(merged.errors[0].field, "a");
        assert_eq!(merged.errors[1].field, "b");
        assert_eq!(
            merged.validated_against,
            vec![ValidationTarget::Schema, ValidationTarget::Ontology]
        );
    }

    #[test]
    fn test_plan_payload_rejects_unknown_fields() {
        let bad = json!({"task_graph": [], "next": "Coder"});
        assert!(serde_json::from_value::<PlanPayload>(bad).is_err());
    }

    #[test]
    fn test_payload_tagging() {
        let payload = TurnPayload::Failure { reason: "timeout".into() };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"kind": "failure", "reason": "timeout"}));
    }
}
