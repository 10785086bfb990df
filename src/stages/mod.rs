//! Pipeline stages
//!
//! A stage takes the conversation so far and produces one assistant
//! message. Stages never touch the session store; the coordinator owns
//! sequencing and persistence.

use crate::error::OrchestrationError;
use crate::llm::ChatMessage;
use crate::models::WorkflowStage;
use crate::session::{ConversationMessage, MessageRole};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod calculation;
pub mod research;

pub use calculation::CalculationStage;
pub use research::ResearchStage;

/// What a stage hands back to the coordinator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub content: String,
    /// Step-by-step notes for the turn's reasoning trace
    pub trace: Vec<String>,
}

impl StageOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            trace: Vec::new(),
        }
    }
}

/// One step of the pipeline (LLM backed in production)
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> WorkflowStage;

    async fn invoke(&self, history: &[ConversationMessage]) -> Result<StageOutput>;
}

/// Convert stored conversation into model chat messages.
pub fn to_chat_history(history: &[ConversationMessage]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|message| match message.role {
            MessageRole::User => ChatMessage::user(message.content.clone()),
            MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
            MessageRole::System => ChatMessage::system(message.content.clone()),
        })
        .collect()
}

/// Most recent user message, which is the query the turn is answering.
pub fn latest_user_query(history: &[ConversationMessage]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
}

/// Research answer of the current turn: the last research message after
/// the most recent user message.
pub fn current_research_output(history: &[ConversationMessage]) -> Option<&str> {
    let turn_start = history
        .iter()
        .rposition(|m| m.role == MessageRole::User)
        .map_or(0, |i| i + 1);

    history[turn_start..]
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant && m.stage == Some(WorkflowStage::Research))
        .map(|m| m.content.as_str())
}

/// Stage with canned output for development & testing
pub struct ScriptedStage {
    kind: WorkflowStage,
    reply: std::result::Result<String, String>,
    delay: Option<Duration>,
}

impl ScriptedStage {
    pub fn replying(kind: WorkflowStage, reply: impl Into<String>) -> Self {
        Self {
            kind,
            reply: Ok(reply.into()),
            delay: None,
        }
    }

    pub fn failing(kind: WorkflowStage, message: impl Into<String>) -> Self {
        Self {
            kind,
            reply: Err(message.into()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn kind(&self) -> WorkflowStage {
        self.kind
    }

    async fn invoke(&self, _history: &[ConversationMessage]) -> Result<StageOutput> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.reply {
            Ok(text) => Ok(StageOutput::new(text.clone())),
            Err(message) => Err(OrchestrationError::StageError(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;

    #[test]
    fn test_history_conversion() {
        let history = vec![
            ConversationMessage::user("q1"),
            ConversationMessage::assistant(WorkflowStage::Research, "a1"),
            ConversationMessage::user("q2"),
        ];

        let chat = to_chat_history(&history);
        let roles: Vec<ChatRole> = chat.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::User, ChatRole::Assistant, ChatRole::User]);
        assert_eq!(latest_user_query(&history), Some("q2"));
        assert_eq!(latest_user_query(&[]), None);
    }

    #[test]
    fn test_current_research_output_stays_in_turn() {
        let mut history = vec![
            ConversationMessage::user("q1"),
            ConversationMessage::assistant(WorkflowStage::Research, "r1"),
            ConversationMessage::assistant(WorkflowStage::Calculation, "c1"),
            ConversationMessage::user("q2"),
        ];
        assert_eq!(current_research_output(&history), None);

        history.push(ConversationMessage::assistant(WorkflowStage::Research, "r2"));
        assert_eq!(current_research_output(&history), Some("r2"));
    }

    #[tokio::test]
    async fn test_scripted_stage() {
        let ok = ScriptedStage::replying(WorkflowStage::Research, "done");
        assert_eq!(ok.invoke(&[]).await.unwrap().content, "done");

        let failing = ScriptedStage::failing(WorkflowStage::Calculation, "boom");
        assert!(matches!(
            failing.invoke(&[]).await,
            Err(OrchestrationError::StageError(_))
        ));
    }
}
