//! Research stage
//!
//! Looks up the closest dataset record for the user's question and asks the
//! model to extract the exact figures. When arithmetic is needed the model
//! ends its reply with the hand-off phrase and the expression to compute.

use super::{latest_user_query, to_chat_history, Stage, StageOutput};
use crate::error::OrchestrationError;
use crate::llm::{ChatModel, ChatRequest};
use crate::models::WorkflowStage;
use crate::retrieval::{render_for_prompt, ContextRetriever};
use crate::session::ConversationMessage;
use crate::workflow::routing::TRIGGER_PHRASE;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ResearchStage {
    model: Arc<dyn ChatModel>,
    retriever: Arc<ContextRetriever>,
}

impl ResearchStage {
    pub fn new(model: Arc<dyn ChatModel>, retriever: Arc<ContextRetriever>) -> Self {
        Self { model, retriever }
    }
}

fn system_prompt(context_block: &str) -> String {
    format!(
        r#"You are a specialized financial research expert. You answer questions about company financials using ONLY the retrieved context below.

Steps:
1. Identify the financial metric and the years the question asks about.
2. Find those values in the table, pre-text or post-text. Never assume or invent numbers.
3. The reference calculation belongs to a similar dataset question. Treat it as a hint for the kind of calculation, and adapt it to the exact values you extracted.
4. If the answer needs arithmetic, do NOT compute it yourself. State the values you extracted, then end your reply with a single line:
   {trigger}: <expression>
   For a percentage change from OLD to NEW use ((NEW - OLD) / OLD) * 100.
5. If no arithmetic is needed, answer directly and do not use that phrase.
6. If the context does not contain the data, say so clearly.

{context}"#,
        trigger = TRIGGER_PHRASE,
        context = context_block,
    )
}

#[async_trait]
impl Stage for ResearchStage {
    fn kind(&self) -> WorkflowStage {
        WorkflowStage::Research
    }

    async fn invoke(&self, history: &[ConversationMessage]) -> Result<StageOutput> {
        let query = latest_user_query(history).ok_or_else(|| {
            OrchestrationError::StageError("research stage needs a user question".to_string())
        })?;

        let context = self.retriever.lookup(query);
        if context.fallback {
            warn!(query = %query, "Research running on fallback context");
        }

        let mut trace = vec![format!(
            "context lookup matched \"{}\" (similarity {:.3}{})",
            context.matched_question,
            context.similarity_score,
            if context.fallback { ", fallback" } else { "" }
        )];

        let request = ChatRequest {
            system: Some(system_prompt(&render_for_prompt(&context, query))),
            messages: to_chat_history(history),
            tools: Vec::new(),
        };

        let response = self.model.complete(request).await?;
        info!(chars = response.text.len(), "Research stage completed");
        trace.push("research answer drafted".to_string());

        Ok(StageOutput {
            content: response.text,
            trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::retrieval::DocumentIndex;

    fn stage(model: Arc<ScriptedModel>) -> ResearchStage {
        ResearchStage::new(model, Arc::new(ContextRetriever::new(DocumentIndex::builtin())))
    }

    #[tokio::test]
    async fn test_prompt_carries_context_and_trigger() {
        let model = Arc::new(ScriptedModel::replies(&["values found"]));
        let research = stage(model.clone());

        let history = vec![ConversationMessage::user(
            "what was the percentage change in net cash from operating activities",
        )];
        let output = research.invoke(&history).await.unwrap();
        assert_eq!(output.content, "values found");
        assert_eq!(output.trace.len(), 2);

        let requests = model.requests();
        let system = requests[0].system.clone().unwrap();
        assert!(system.contains("financial research expert"));
        assert!(system.contains(TRIGGER_PHRASE));
        assert!(system.contains("REFERENCE ANSWER: 14.1%"));
        assert!(!system.contains("math expert"));
        assert_eq!(requests[0].messages.len(), 1);
        assert!(requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_requires_user_question() {
        let research = stage(Arc::new(ScriptedModel::replies(&["unused"])));
        assert!(matches!(
            research.invoke(&[]).await,
            Err(OrchestrationError::StageError(_))
        ));
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let research = stage(Arc::new(ScriptedModel::new(vec![Err(
            OrchestrationError::LlmError("down".to_string()),
        )])));
        let history = vec![ConversationMessage::user("q")];
        assert!(matches!(
            research.invoke(&history).await,
            Err(OrchestrationError::LlmError(_))
        ));
    }
}
