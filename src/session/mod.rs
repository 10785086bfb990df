//! Session store
//!
//! Keeps per-session conversation history and the coordinator's stage
//! pointer. Sessions live until they are ended or expired explicitly;
//! nothing is evicted behind the caller's back.

use crate::error::OrchestrationError;
use crate::models::{SessionId, WorkflowStage};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod message;

pub use message::{ConversationMessage, MessageRole};

/// Per-session state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_stage: WorkflowStage,
    messages: Vec<ConversationMessage>,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            updated_at: now,
            next_stage: WorkflowStage::Research,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// History only grows; there is no way to edit or drop a message.
    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }
}

/// Trait for session persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the session, creating an empty one if it does not exist.
    async fn get_or_create(&self, session_id: &SessionId) -> Result<SessionState>;

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionState>>;

    /// Start a new turn: create the session if needed and reset its stage
    /// pointer to research. This is the only backward stage move.
    async fn begin_turn(&self, session_id: &SessionId) -> Result<SessionState>;

    async fn append(&self, session_id: &SessionId, message: ConversationMessage) -> Result<()>;

    /// Move the stage pointer forward. Anything else is `InvalidTransition`.
    async fn set_next_stage(&self, session_id: &SessionId, stage: WorkflowStage) -> Result<()>;

    /// Drop the session. Returns whether it existed.
    async fn end_session(&self, session_id: &SessionId) -> Result<bool>;

    /// Remove sessions idle for longer than `max_idle`, returning how many went.
    async fn expire_idle(&self, max_idle: chrono::Duration) -> Result<usize>;

    async fn session_count(&self) -> usize;
}

/// In-memory session store
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionState>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, session_id: &SessionId) -> Result<SessionState> {
        {
            let sessions = self.sessions.read().await;
            if let Some(state) = sessions.get(session_id) {
                return Ok(state.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        let state = sessions.entry(session_id.clone()).or_insert_with(|| {
            debug!(session_id = %session_id, "Session created");
            SessionState::new(session_id.clone())
        });
        Ok(state.clone())
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionState>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn begin_turn(&self, session_id: &SessionId) -> Result<SessionState> {
        let mut sessions = self.sessions.write().await;
        let state = sessions.entry(session_id.clone()).or_insert_with(|| {
            debug!(session_id = %session_id, "Session created");
            SessionState::new(session_id.clone())
        });
        state.next_stage = WorkflowStage::Research;
        state.updated_at = Utc::now();
        Ok(state.clone())
    }

    async fn append(&self, session_id: &SessionId, message: ConversationMessage) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.to_string()))?;
        state.push(message);
        Ok(())
    }

    async fn set_next_stage(&self, session_id: &SessionId, stage: WorkflowStage) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.to_string()))?;
        state.next_stage = state.next_stage.advance(stage)?;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let existed = sessions.remove(session_id).is_some();
        if existed {
            debug!(session_id = %session_id, "Session ended");
        }
        Ok(existed)
    }

    async fn expire_idle(&self, max_idle: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_idle;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, state| state.updated_at >= cutoff);
        let removed = before - sessions.len();

        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Expired idle sessions");
        }
        Ok(removed)
    }

    async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
