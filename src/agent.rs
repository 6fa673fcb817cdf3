//! Agents - role-bound participants of the group chat

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::completion::{CompletionService, ContextMessage};
use crate::config::RolePrompts;
use crate::error::ParleyError;
use crate::tools::{ToolRegistry, EXECUTE_CODE, ONTOLOGY_VALIDATE, SCHEMA_VALIDATE};
use crate::types::{
    AgentId, AgentRole, CodePayload, ExecutionOutput, PlanPayload, ToolCall, ToolCallPayload,
    ToolId, ToolInvocation, ToolOutcome, TranslationInputs, Turn, TurnKind, TurnPayload,
    ValidatorVerdict,
};

/// Predicate over an agent's own content that retires it for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationSignal {
    Contains(String),
    Equals(String),
}

impl TerminationSignal {
    pub fn fires(&self, content: &str) -> bool {
        match self {
            TerminationSignal::Contains(marker) => content.contains(marker.as_str()),
            TerminationSignal::Equals(marker) => content.trim() == marker,
        }
    }
}

/// Static definition of an agent, immutable for the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub role: AgentRole,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub allowed_tools: BTreeSet<ToolId>,
    #[serde(default)]
    pub termination_signal: Option<TerminationSignal>,
}

impl AgentSpec {
    pub fn new(id: impl Into<AgentId>, role: AgentRole, system_instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            system_instruction: system_instruction.into(),
            allowed_tools: BTreeSet::new(),
            termination_signal: None,
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools.extend(tools.iter().map(|t| ToolId::from(*t)));
        self
    }

    pub fn with_termination(mut self, signal: TerminationSignal) -> Self {
        self.termination_signal = Some(signal);
        self
    }

    pub fn may_call(&self, tool: &ToolId) -> bool {
        self.allowed_tools.contains(tool)
    }

    /// The translation team: admin, coder, validator, executor and planner,
    /// plus a tool runner when validation goes through tools
    pub fn standard_roster(prompts: &RolePrompts, validation_by_tool: bool) -> Vec<AgentSpec> {
        let validator = if validation_by_tool {
            AgentSpec::new(
                "Validator",
                AgentRole::ToolCallingValidator,
                &prompts.tool_calling_validator,
            )
        } else {
            AgentSpec::new("Validator", AgentRole::Validator, &prompts.validator)
        };

        let mut roster = vec![
            AgentSpec::new("Admin", AgentRole::UserProxy, &prompts.user_proxy)
                .with_termination(TerminationSignal::Contains("TERMINATE".into())),
            AgentSpec::new("Coder", AgentRole::Coder, &prompts.coder),
            validator,
            AgentSpec::new("Executor", AgentRole::Executor, &prompts.executor)
                .with_tools(&[EXECUTE_CODE]),
            AgentSpec::new("Planner", AgentRole::Planner, &prompts.planner),
        ];

        if validation_by_tool {
            roster.push(
                AgentSpec::new(
                    "function_executor_agent",
                    AgentRole::ToolRunner,
                    &prompts.tool_runner,
                )
                .with_tools(&[SCHEMA_VALIDATE, ONTOLOGY_VALIDATE]),
            );
        }

        roster
    }
}

/// What an agent proposes; only the orchestrator turns it into a [`Turn`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnDraft {
    pub content: String,
    pub payload: Option<TurnPayload>,
    pub tool_invocations: Vec<ToolInvocation>,
    pub tool_requests: Vec<ToolCall>,
}

impl TurnDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn has_failed_invocation(&self) -> bool {
        self.tool_invocations.iter().any(|inv| !inv.outcome.is_ok())
    }
}

/// Everything an agent may use besides the transcript
pub struct TurnContext<'a> {
    pub registry: &'a ToolRegistry,
    pub completion: &'a dyn CompletionService,
    pub inputs: &'a TranslationInputs,
}

/// A group chat participant
#[derive(Debug, Clone)]
pub struct Agent {
    spec: AgentSpec,
}

impl Agent {
    pub fn new(spec: AgentSpec) -> Self {
        Self { spec }
    }

    pub fn id(&self) -> &AgentId {
        &self.spec.id
    }

    pub fn role(&self) -> AgentRole {
        self.spec.role
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn termination_fired(&self, content: &str) -> bool {
        self.spec
            .termination_signal
            .as_ref()
            .map(|signal| signal.fires(content))
            .unwrap_or(false)
    }

    fn failure(&self, reason: impl Into<String>) -> ParleyError {
        ParleyError::agent_failure(&self.spec.id, reason)
    }

    /// Produce this agent's next turn from a read-only transcript snapshot
    #[instrument(skip_all, fields(agent = %self.spec.id, role = %self.spec.role))]
    pub async fn produce_turn(
        &self,
        transcript: &[Arc<Turn>],
        ctx: &TurnContext<'_>,
    ) -> Result<TurnDraft, ParleyError> {
        match self.spec.role {
            AgentRole::Executor => self.execute_latest_code(transcript, ctx).await,
            AgentRole::ToolRunner => self.run_pending_tool_calls(transcript, ctx).await,
            AgentRole::UserProxy => {
                let text = self.complete(transcript, ctx).await?;
                Ok(TurnDraft::text(text))
            }
            AgentRole::Planner => {
                let text = self.complete(transcript, ctx).await?;
                let plan: PlanPayload = self.parse(&text)?;
                Ok(TurnDraft {
                    content: text,
                    payload: Some(TurnPayload::Plan(plan)),
                    ..Default::default()
                })
            }
            AgentRole::Validator => {
                let text = self.complete(transcript, ctx).await?;
                let verdict: ValidatorVerdict = self.parse(&text)?;
                Ok(TurnDraft {
                    content: text,
                    payload: Some(TurnPayload::Verdict(verdict)),
                    ..Default::default()
                })
            }
            AgentRole::Coder => {
                let text = self.complete(transcript, ctx).await?;
                let mut code: CodePayload = self.parse(&text)?;
                let calls = std::mem::take(&mut code.tool_calls);
                let mut draft = TurnDraft {
                    content: text,
                    ..Default::default()
                };
                self.dispatch_tool_calls(calls, ctx, &mut draft).await?;
                draft.payload = Some(TurnPayload::Code(code));
                Ok(draft)
            }
            AgentRole::ToolCallingValidator => {
                let text = self.complete(transcript, ctx).await?;
                let payload: ToolCallPayload = self.parse(&text)?;
                let mut draft = TurnDraft {
                    content: text,
                    ..Default::default()
                };
                self.dispatch_tool_calls(payload.tool_calls.clone(), ctx, &mut draft)
                    .await?;
                draft.payload = Some(TurnPayload::ToolCalls(payload));
                Ok(draft)
            }
        }
    }

    async fn complete(
        &self,
        transcript: &[Arc<Turn>],
        ctx: &TurnContext<'_>,
    ) -> Result<String, ParleyError> {
        let context: Vec<ContextMessage> = transcript
            .iter()
            .map(|turn| ContextMessage::from_turn(turn))
            .collect();

        ctx.completion
            .complete(&self.spec.system_instruction, &context)
            .await
            .map_err(|e| self.failure(format!("completion failed: {e:#}")))
    }

    fn parse<T: DeserializeOwned>(&self, text: &str) -> Result<T, ParleyError> {
        let value = extract_json(text)
            .ok_or_else(|| self.failure("no structured output block in response"))?;
        serde_json::from_value(value).map_err(|e| {
            self.failure(format!("malformed {} output: {e}", self.spec.role))
        })
    }

    /// Run permitted calls now; leave the rest for a tool runner
    async fn dispatch_tool_calls(
        &self,
        calls: Vec<ToolCall>,
        ctx: &TurnContext<'_>,
        draft: &mut TurnDraft,
    ) -> Result<(), ParleyError> {
        for call in calls {
            if self.spec.role.calls_tools() && self.spec.may_call(&call.tool) {
                let invocation = ctx.registry.invoke_call(&call).await?;
                draft.tool_invocations.push(invocation);
            } else {
                debug!(tool = %call.tool, "Deferring tool call");
                draft.tool_requests.push(call);
            }
        }
        Ok(())
    }

    async fn execute_latest_code(
        &self,
        transcript: &[Arc<Turn>],
        ctx: &TurnContext<'_>,
    ) -> Result<TurnDraft, ParleyError> {
        let Some(turn) = transcript.iter().rev().find(|turn| turn.code().is_some()) else {
            return Ok(TurnDraft::text("No code to execute."));
        };

        let tool = ToolId::from(EXECUTE_CODE);
        if !self.spec.may_call(&tool) {
            return Err(self.failure("not permitted to execute code"));
        }

        let language = match &turn.payload {
            Some(TurnPayload::Code(code)) => code.language.clone(),
            _ => None,
        };
        let call = ToolCall {
            tool,
            arguments: json!({
                "code": turn.code().unwrap_or_default(),
                "language": language,
                "inputs": ctx.inputs.source_data,
            }),
        };

        let invocation = ctx.registry.invoke_call(&call).await?;
        let output = match &invocation.outcome {
            ToolOutcome::Ok { result } => serde_json::from_value::<ExecutionOutput>(result.clone())
                .map_err(|e| self.failure(format!("malformed execution output: {e}")))?,
            ToolOutcome::Err { error } => ExecutionOutput {
                stdout: String::new(),
                result: None,
                error: Some(error.clone()),
            },
        };

        let content = match &output.error {
            Some(error) => format!("exitcode: 1 (execution failed)\n{error}"),
            None => format!("exitcode: 0 (execution succeeded)\nCode output: {}", output.stdout),
        };

        Ok(TurnDraft {
            content,
            payload: Some(TurnPayload::Execution(output)),
            tool_invocations: vec![invocation],
            tool_requests: Vec::new(),
        })
    }

    async fn run_pending_tool_calls(
        &self,
        transcript: &[Arc<Turn>],
        ctx: &TurnContext<'_>,
    ) -> Result<TurnDraft, ParleyError> {
        let pending = transcript
            .iter()
            .rev()
            .find(|turn| turn.kind == TurnKind::Agent)
            .filter(|turn| turn.role != AgentRole::ToolRunner)
            .map(|turn| turn.tool_requests.clone())
            .unwrap_or_default();

        if pending.is_empty() {
            return Ok(TurnDraft::text("No pending tool calls."));
        }

        let mut draft = TurnDraft::default();
        let mut lines = Vec::new();
        for call in pending {
            let invocation = if self.spec.may_call(&call.tool) {
                ctx.registry.invoke_call(&call).await?
            } else {
                warn!(tool = %call.tool, "Tool runner lacks permission");
                ToolInvocation {
                    tool_id: call.tool.clone(),
                    arguments: call.arguments.clone(),
                    outcome: ToolOutcome::Err {
                        error: format!("{} may not run {}", self.spec.id, call.tool),
                    },
                }
            };
            lines.push(match &invocation.outcome {
                ToolOutcome::Ok { .. } => format!("{}: ok", invocation.tool_id),
                ToolOutcome::Err { error } => format!("{}: {error}", invocation.tool_id),
            });
            draft.tool_invocations.push(invocation);
        }

        draft.content = format!("Executed tool calls:\n{}", lines.join("\n"));
        Ok(draft)
    }
}

/// Pull the machine-readable block out of a completion.
///
/// Accepts a bare JSON document, a fenced ```json block, or the outermost
/// `{...}` span of free text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent_turn, Reply, ScriptedCompletion};
    use crate::tools::{ExecuteCodeTool, Tool};
    use crate::sandbox::{CodeRequest, CodeSandbox};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct EchoSandbox;

    #[async_trait]
    impl CodeSandbox for EchoSandbox {
        async fn run(&self, request: CodeRequest) -> anyhow::Result<ExecutionOutput> {
            if request.code.contains("raise") {
                return Ok(ExecutionOutput {
                    stdout: String::new(),
                    result: None,
                    error: Some("Traceback: boom".into()),
                });
            }
            Ok(ExecutionOutput {
                stdout: request.inputs.to_string(),
                result: Some(request.inputs),
                error: None,
            })
        }
    }

    fn registry() -> ToolRegistry {
        let registry = ToolRegistry::with_validators(Duration::from_secs(1));
        let exec: Arc<dyn Tool> = Arc::new(ExecuteCodeTool::new(Arc::new(EchoSandbox)));
        registry.register(EXECUTE_CODE, exec);
        registry
    }

    fn inputs() -> TranslationInputs {
        TranslationInputs {
            source_data: json!({"Category": "CV-CV-Abutment-G-P"}),
            ..Default::default()
        }
    }

    fn code_turn(seq: usize, code: &str) -> Arc<Turn> {
        let mut turn = agent_turn(seq, "Coder", AgentRole::Coder);
        turn.payload = Some(TurnPayload::Code(CodePayload {
            code: Some(code.into()),
            language: Some("python".into()),
            ..Default::default()
        }));
        Arc::new(turn)
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 2}\n```\nthanks"),
            Some(json!({"a": 2}))
        );
        assert_eq!(extract_json("result {\"a\": 3} end"), Some(json!({"a": 3})));
        assert_eq!(extract_json("no structure here"), None);
    }

    #[test]
    fn test_termination_signal() {
        let agent = Agent::new(
            AgentSpec::new("Admin", AgentRole::UserProxy, "")
                .with_termination(TerminationSignal::Contains("TERMINATE".into())),
        );
        assert!(agent.termination_fired("All good. TERMINATE"));
        assert!(!agent.termination_fired("keep going"));
        assert!(TerminationSignal::Equals("DONE".into()).fires("  DONE\n"));
    }

    #[test]
    fn test_standard_roster() {
        let plain = AgentSpec::standard_roster(&RolePrompts::default(), false);
        let names: Vec<&str> = plain.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(names, vec!["Admin", "Coder", "Validator", "Executor", "Planner"]);
        assert_eq!(plain[2].role, AgentRole::Validator);

        let tooled = AgentSpec::standard_roster(&RolePrompts::default(), true);
        assert_eq!(tooled.len(), 6);
        assert_eq!(tooled[2].role, AgentRole::ToolCallingValidator);
        assert!(tooled[2].allowed_tools.is_empty());
        assert!(tooled[5].may_call(&ToolId::from(SCHEMA_VALIDATE)));
    }

    #[tokio::test]
    async fn test_planner_parses_plan() {
        let completion = ScriptedCompletion::new().script(
            "plan",
            vec![Reply::json(json!({
                "task_graph": [{"id": 1, "task": "map Category", "subtasks": []}],
                "next_speaker": "Coder"
            }))],
        );
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(AgentSpec::new("Planner", AgentRole::Planner, "plan"));

        let draft = agent.produce_turn(&[], &ctx).await.unwrap();
        match draft.payload {
            Some(TurnPayload::Plan(plan)) => {
                assert_eq!(plan.task_graph.len(), 1);
                assert_eq!(plan.next_speaker.as_deref(), Some("Coder"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_validator_output_is_failure() {
        let completion = ScriptedCompletion::new()
            .script("judge", vec![Reply::json(json!({"code_status": "VALID"}))]);
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(AgentSpec::new("Validator", AgentRole::Validator, "judge"));

        let err = agent.produce_turn(&[], &ctx).await.unwrap_err();
        assert!(matches!(err, ParleyError::AgentFailure { .. }));
    }

    #[tokio::test]
    async fn test_completion_error_is_failure() {
        let completion = ScriptedCompletion::new().script("x", vec![Reply::Fail("quota".into())]);
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(AgentSpec::new("Admin", AgentRole::UserProxy, "x"));

        let err = agent.produce_turn(&[], &ctx).await.unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[tokio::test]
    async fn test_context_passed_to_completion() {
        let completion = ScriptedCompletion::new().script("x", vec![Reply::Text("ok".into())]);
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(AgentSpec::new("Admin", AgentRole::UserProxy, "x"));

        let transcript = vec![
            Arc::new(agent_turn(0, "Planner", AgentRole::Planner)),
            Arc::new(agent_turn(1, "Coder", AgentRole::Coder)),
        ];
        agent.produce_turn(&transcript, &ctx).await.unwrap();
        assert_eq!(completion.calls(), vec![("x".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_coder_runs_permitted_and_defers_others() {
        let completion = ScriptedCompletion::new().script(
            "code",
            vec![Reply::Text(format!(
                "```json\n{}\n```",
                json!({
                    "candidate": {"Name_notes": "x"},
                    "tool_calls": [
                        {"tool": "schema_validate", "arguments": {"data": {}, "schema": {"required": ["a"]}}},
                        {"tool": "ontology_validate", "arguments": {}}
                    ]
                })
            ))],
        );
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(
            AgentSpec::new("Coder", AgentRole::Coder, "code").with_tools(&[SCHEMA_VALIDATE]),
        );

        let draft = agent.produce_turn(&[], &ctx).await.unwrap();
        assert_eq!(draft.tool_invocations.len(), 1);
        assert!(draft.tool_invocations[0].outcome.is_ok());
        assert_eq!(draft.tool_requests.len(), 1);
        assert_eq!(draft.tool_requests[0].tool.as_str(), ONTOLOGY_VALIDATE);
        match draft.payload {
            Some(TurnPayload::Code(code)) => assert!(code.tool_calls.is_empty()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_executor_runs_latest_code() {
        let completion = ScriptedCompletion::new();
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(
            AgentSpec::new("Executor", AgentRole::Executor, "").with_tools(&[EXECUTE_CODE]),
        );

        let transcript = vec![code_turn(0, "raise"), code_turn(1, "print(x)")];
        let draft = agent.produce_turn(&transcript, &ctx).await.unwrap();
        assert!(draft.content.starts_with("exitcode: 0"));
        match draft.payload {
            Some(TurnPayload::Execution(out)) => {
                assert_eq!(out.result, Some(json!({"Category": "CV-CV-Abutment-G-P"})));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        // Executor never consults the completion service
        assert!(completion.calls().is_empty());
    }

    #[tokio::test]
    async fn test_executor_reports_program_error() {
        let completion = ScriptedCompletion::new();
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(
            AgentSpec::new("Executor", AgentRole::Executor, "").with_tools(&[EXECUTE_CODE]),
        );

        let draft = agent.produce_turn(&[code_turn(0, "raise")], &ctx).await.unwrap();
        assert!(draft.content.starts_with("exitcode: 1"));
        assert!(!draft.has_failed_invocation());
    }

    #[tokio::test]
    async fn test_executor_without_permission_fails() {
        let completion = ScriptedCompletion::new();
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(AgentSpec::new("Executor", AgentRole::Executor, ""));

        let err = agent.produce_turn(&[code_turn(0, "x")], &ctx).await.unwrap_err();
        assert!(matches!(err, ParleyError::AgentFailure { .. }));
    }

    #[tokio::test]
    async fn test_tool_runner_executes_requests() {
        let completion = ScriptedCompletion::new();
        let registry = registry();
        let inputs = inputs();
        let ctx = TurnContext { registry: &registry, completion: &completion, inputs: &inputs };
        let agent = Agent::new(
            AgentSpec::new("function_executor_agent", AgentRole::ToolRunner, "")
                .with_tools(&[SCHEMA_VALIDATE]),
        );

        let mut request_turn = agent_turn(0, "Validator", AgentRole::ToolCallingValidator);
        request_turn.tool_requests = vec![
            ToolCall {
                tool: ToolId::from(SCHEMA_VALIDATE),
                arguments: json!({"data": {"a": 1}, "schema": {"type": "object"}}),
            },
            ToolCall {
                tool: ToolId::from(EXECUTE_CODE),
                arguments: json!({"code": "rm -rf /"}),
            },
        ];

        let draft = agent.produce_turn(&[Arc::new(request_turn)], &ctx).await.unwrap();
        assert_eq!(draft.tool_invocations.len(), 2);
        assert!(draft.tool_invocations[0].outcome.is_ok());
        assert!(!draft.tool_invocations[1].outcome.is_ok());
        assert!(draft.has_failed_invocation());

        let idle = agent
            .produce_turn(&[Arc::new(agent_turn(0, "Coder", AgentRole::Coder))], &ctx)
            .await
            .unwrap();
        assert_eq!(idle.content, "No pending tool calls.");
    }
}
