//! Event channel from running sessions to observers

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::session::SessionState;
use crate::types::{AgentId, SessionId, Turn};

/// Progress notifications emitted by group chats
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    SessionStarted {
        session_id: SessionId,
        agents: Vec<AgentId>,
    },
    TurnAppended {
        session_id: SessionId,
        turn: Turn,
    },
    /// Routing policy could not name a speaker; round-robin was used
    RoutingFallback {
        session_id: SessionId,
        speaker: AgentId,
        reason: String,
    },
    SessionFinished {
        session_id: SessionId,
        state: SessionState,
        rounds: u32,
    },
}

/// Session-side sender. A default sender is disconnected and drops events.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<ChatEvent>>,
}

impl EventSender {
    pub fn emit(&self, event: ChatEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}

/// Client-side receiver of chat events
#[derive(Clone)]
pub struct ChatChannel {
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<ChatEvent>>>,
}

impl ChatChannel {
    /// Create a connected receiver/sender pair
    pub fn new() -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            event_rx: Arc::new(Mutex::new(rx)),
        };
        (channel, EventSender { tx: Some(tx) })
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<ChatEvent> {
        self.event_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for the next event; `None` once every sender is gone
    pub async fn recv(&self) -> Option<ChatEvent> {
        self.event_rx.lock().await.recv().await
    }
}
