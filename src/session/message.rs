//! Conversation messages
//!
//! Messages are immutable once built; a session only ever pushes new ones.

use crate::models::WorkflowStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A single message in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    /// Stage that authored an assistant message
    pub stage: Option<WorkflowStage>,
    /// Set when the message records a failed stage or an abandoned turn
    pub error: Option<String>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            stage: None,
            error: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn assistant(stage: WorkflowStage, content: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(MessageRole::Assistant, content)
        }
    }

    /// Assistant message recording an error instead of stage output.
    pub fn failure(
        stage: WorkflowStage,
        content: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::assistant(stage, content)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
