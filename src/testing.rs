//! Shared fixtures for unit tests

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::completion::{CompletionService, ContextMessage};
use crate::types::{
    AgentId, AgentRole, CodePayload, Ontology, Triple, Turn, TurnKind, TurnPayload,
};

pub fn agent_turn(seq: usize, speaker: &str, role: AgentRole) -> Turn {
    Turn {
        seq,
        speaker: AgentId::from(speaker),
        role,
        kind: TurnKind::Agent,
        content: format!("{speaker} speaking"),
        payload: None,
        tool_invocations: Vec::new(),
        tool_requests: Vec::new(),
        advances_round: true,
        timestamp: Utc::now(),
    }
}

pub fn candidate_turn(seq: usize, candidate: Value) -> Turn {
    let mut turn = agent_turn(seq, "Coder", AgentRole::Coder);
    turn.payload = Some(TurnPayload::Code(CodePayload {
        candidate: Some(candidate),
        ..Default::default()
    }));
    turn
}

pub fn asset_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "Name_notes": {"type": "string"},
            "Asset_Code": {"type": "string"}
        },
        "required": ["Name_notes", "Asset_Code"],
        "additionalProperties": false
    })
}

pub fn asset_ontology() -> Ontology {
    Ontology::new(vec![
        Triple::new("ex:Asset", "rdf:type", "owl:Class"),
        Triple::new("ex:Name_notes", "rdf:type", "owl:DatatypeProperty"),
        Triple::new("ex:Name_notes", "rdfs:range", "xsd:string"),
        Triple::new("ex:Asset_Code", "a", "owl:DatatypeProperty"),
        Triple::new("ex:Asset_Code", "rdfs:range", "xsd:string"),
    ])
}

/// One scripted completion reply
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never answers within any sane timeout
    Hang,
}

impl Reply {
    pub fn json(value: Value) -> Self {
        Reply::Text(value.to_string())
    }
}

/// Completion service answering from per-instruction queues
#[derive(Default)]
pub struct ScriptedCompletion {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, instruction: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .entry(instruction.to_string())
            .or_default()
            .extend(replies);
        self
    }

    /// (instruction, context length) for each call, in order
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        system_instruction: &str,
        context: &[ContextMessage],
    ) -> anyhow::Result<String> {
        self.calls
            .lock()
            .push((system_instruction.to_string(), context.len()));

        let reply = self
            .scripts
            .lock()
            .get_mut(system_instruction)
            .and_then(|queue| queue.pop_front());

        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(reason)) => Err(anyhow::anyhow!(reason)),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow::anyhow!("hung"))
            }
            None => Err(anyhow::anyhow!("no scripted reply for `{system_instruction}`")),
        }
    }
}
