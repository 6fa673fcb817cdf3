//! Tool registry - the only path from agent output to real computation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ParleyError;
use crate::sandbox::{CodeRequest, CodeSandbox};
use crate::types::{Ontology, ToolCall, ToolId, ToolInvocation, ToolOutcome};
use crate::validation::{compare_with_reference, validate_against_ontology, validate_against_schema};

pub const SCHEMA_VALIDATE: &str = "schema_validate";
pub const ONTOLOGY_VALIDATE: &str = "ontology_validate";
pub const EXECUTE_CODE: &str = "execute_code";
pub const COMPARE_TARGET: &str = "compare_target";

/// A registered capability
#[async_trait]
pub trait Tool: Send + Sync {
    fn description(&self) -> &str;

    /// Invocations may not overlap within one registry
    fn exclusive(&self) -> bool {
        false
    }

    async fn execute(&self, arguments: Value) -> anyhow::Result<Value>;
}

pub type BoxedTool = Arc<dyn Tool>;

/// Maps tool ids to implementations for one session.
///
/// Implementations are shared between forks; the exclusive-execution lock and
/// the open/closed flag are per registry.
pub struct ToolRegistry {
    tools: RwLock<HashMap<ToolId, BoxedTool>>,
    exclusive: Mutex<()>,
    closed: AtomicBool,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            exclusive: Mutex::new(()),
            closed: AtomicBool::new(false),
            timeout,
        }
    }

    /// Registry with the schema, ontology and reference validators installed
    pub fn with_validators(timeout: Duration) -> Self {
        let registry = Self::new(timeout);
        registry.register(SCHEMA_VALIDATE, Arc::new(SchemaValidateTool));
        registry.register(ONTOLOGY_VALIDATE, Arc::new(OntologyValidateTool));
        registry.register(COMPARE_TARGET, Arc::new(CompareTargetTool));
        registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn register(&self, tool_id: impl Into<ToolId>, tool: BoxedTool) {
        let tool_id = tool_id.into();
        debug!(tool = %tool_id, "Registered tool");
        self.tools.write().insert(tool_id, tool);
    }

    pub fn contains(&self, tool_id: &ToolId) -> bool {
        self.tools.read().contains_key(tool_id)
    }

    pub fn tool_ids(&self) -> Vec<ToolId> {
        let mut ids: Vec<ToolId> = self.tools.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// New registry for another session sharing the same implementations
    pub fn fork(&self) -> Self {
        self.fork_with_timeout(self.timeout)
    }

    /// Fork that bounds every invocation by `timeout` instead
    pub fn fork_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(self.tools.read().clone()),
            exclusive: Mutex::new(()),
            closed: AtomicBool::new(false),
            timeout,
        }
    }

    /// Stop servicing invocations
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run a tool with the registry timeout
    pub async fn invoke(&self, tool_id: &ToolId, arguments: Value) -> Result<Value, ParleyError> {
        if self.is_closed() {
            return Err(ParleyError::RegistryUnavailable);
        }

        let tool = self
            .tools
            .read()
            .get(tool_id)
            .cloned()
            .ok_or_else(|| ParleyError::UnknownTool(tool_id.clone()))?;

        let _guard = if tool.exclusive() {
            Some(self.exclusive.lock().await)
        } else {
            None
        };

        match tokio::time::timeout(self.timeout, tool.execute(arguments)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(tool = %tool_id, error = %e, "Tool failed");
                Err(ParleyError::tool_execution(tool_id, format!("{e:#}")))
            }
            Err(_) => {
                warn!(tool = %tool_id, timeout = ?self.timeout, "Tool timed out");
                Err(ParleyError::tool_execution(
                    tool_id,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        }
    }

    /// Run a requested call, recording recoverable failures in the invocation
    pub async fn invoke_call(&self, call: &ToolCall) -> Result<ToolInvocation, ParleyError> {
        let outcome = match self.invoke(&call.tool, call.arguments.clone()).await {
            Ok(result) => ToolOutcome::Ok { result },
            Err(ParleyError::RegistryUnavailable) => return Err(ParleyError::RegistryUnavailable),
            Err(e) => ToolOutcome::Err { error: e.to_string() },
        };

        Ok(ToolInvocation {
            tool_id: call.tool.clone(),
            arguments: call.arguments.clone(),
            outcome,
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

fn required_arg<'a>(arguments: &'a Value, name: &str) -> anyhow::Result<&'a Value> {
    arguments
        .get(name)
        .ok_or_else(|| anyhow!("missing argument `{name}`"))
}

/// `schema_validate(data, schema)`
pub struct SchemaValidateTool;

#[async_trait]
impl Tool for SchemaValidateTool {
    fn description(&self) -> &str {
        "Validate data against a JSON schema"
    }

    async fn execute(&self, arguments: Value) -> anyhow::Result<Value> {
        let data = required_arg(&arguments, "data")?;
        let schema = required_arg(&arguments, "schema")?;
        let result = validate_against_schema(data, schema);
        Ok(serde_json::to_value(result)?)
    }
}

/// `ontology_validate(data, ontology)`
pub struct OntologyValidateTool;

#[async_trait]
impl Tool for OntologyValidateTool {
    fn description(&self) -> &str {
        "Validate data against an ontology graph"
    }

    async fn execute(&self, arguments: Value) -> anyhow::Result<Value> {
        let data = required_arg(&arguments, "data")?;
        let ontology: Ontology = serde_json::from_value(required_arg(&arguments, "ontology")?.clone())
            .context("ontology argument is not a triple graph")?;
        let result = validate_against_ontology(data, &ontology);
        Ok(serde_json::to_value(result)?)
    }
}

/// `compare_target(data, reference)`: structural diff against known-good output
pub struct CompareTargetTool;

#[async_trait]
impl Tool for CompareTargetTool {
    fn description(&self) -> &str {
        "Compare data with the reference target record"
    }

    async fn execute(&self, arguments: Value) -> anyhow::Result<Value> {
        let data = required_arg(&arguments, "data")?;
        let reference = required_arg(&arguments, "reference")?;
        let result = compare_with_reference(data, reference);
        Ok(serde_json::to_value(result)?)
    }
}

/// `execute_code(code, inputs)` through a sandbox
pub struct ExecuteCodeTool {
    sandbox: Arc<dyn CodeSandbox>,
}

impl ExecuteCodeTool {
    pub fn new(sandbox: Arc<dyn CodeSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn description(&self) -> &str {
        "Run code in the sandbox and capture its output"
    }

    fn exclusive(&self) -> bool {
        true
    }

    async fn execute(&self, arguments: Value) -> anyhow::Result<Value> {
        let request: CodeRequest =
            serde_json::from_value(arguments).context("invalid execute_code arguments")?;
        let output = self.sandbox.run(request).await?;
        Ok(serde_json::to_value(output)?)
    }
}
