//! Workflow coordinator - drives one user turn through the stages
//!
//! RESEARCH → (trigger?) → CALCULATION → DONE
//!
//! The coordinator owns sequencing. Stages only produce text and the
//! routing functions decide what runs next. Messages produced by a turn are
//! committed to the session store once the turn is over.

use crate::config::Config;
use crate::llm::{filter_response, ChatModel, OpenAiClient};
use crate::models::{SessionId, TurnError, TurnResult, WorkflowStage};
use crate::retrieval::ContextRetriever;
use crate::session::{ConversationMessage, MessageRole, SessionStore};
use crate::stages::{CalculationStage, ResearchStage, Stage};
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub mod routing;

pub use routing::{requires_calculation, route, TRIGGER_PHRASE};

/// Research plus at most one calculation per turn.
pub const MAX_STAGE_INVOCATIONS: usize = 2;

/// What a turn produced before it is committed
#[derive(Debug, Default)]
struct TurnDraft {
    messages: Vec<ConversationMessage>,
    stages: Vec<WorkflowStage>,
    trace: Vec<String>,
    error: Option<TurnError>,
}

fn trace_label(stage: WorkflowStage) -> String {
    stage.to_string().to_uppercase()
}

/// Main coordinator that runs a turn end to end
pub struct Coordinator {
    research: Arc<dyn Stage>,
    calculation: Arc<dyn Stage>,
    sessions: Arc<dyn SessionStore>,
    turn_timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(
        research: Arc<dyn Stage>,
        calculation: Arc<dyn Stage>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            research,
            calculation,
            sessions,
            turn_timeout: None,
        }
    }

    /// Wire the production stages against the configured model endpoint.
    pub fn from_config(
        config: &Config,
        retriever: Arc<ContextRetriever>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let model: Arc<dyn ChatModel> = Arc::new(OpenAiClient::from_config(config)?);

        info!(
            model = %config.model,
            base_url = %config.base_url,
            turn_timeout = ?config.turn_timeout,
            "Coordinator configured"
        );

        Ok(Self::new(
            Arc::new(ResearchStage::new(model.clone(), retriever)),
            Arc::new(CalculationStage::new(model)),
            sessions,
        )
        .with_turn_timeout(config.turn_timeout))
    }

    /// Abandon turns that run longer than `timeout`. `None` waits forever.
    pub fn with_turn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    fn stage_for(&self, stage: WorkflowStage) -> Option<&Arc<dyn Stage>> {
        match stage {
            WorkflowStage::Research => Some(&self.research),
            WorkflowStage::Calculation => Some(&self.calculation),
            WorkflowStage::Done => None,
        }
    }

    /// Run one user turn. Never fails: problems come back in
    /// `TurnResult::error` alongside whatever answer could be produced.
    pub async fn run_turn(&self, session_id: &SessionId, input: &str) -> TurnResult {
        let start_time = Instant::now();

        info!(session_id = %session_id, chars = input.len(), "Coordinator: turn started");

        let user_message = ConversationMessage::user(input);

        let mut history = match self.sessions.begin_turn(session_id).await {
            Ok(state) => state.messages().to_vec(),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Session unavailable");
                return TurnResult {
                    session_id: session_id.clone(),
                    answer: format!("Error: {}", e),
                    messages: vec![user_message],
                    stages: Vec::new(),
                    trace: vec![format!("SESSION: unavailable - {}", e)],
                    error: Some(TurnError::SessionUnavailable {
                        message: e.to_string(),
                    }),
                    elapsed_ms: start_time.elapsed().as_millis() as u64,
                };
            }
        };

        history.push(user_message.clone());

        let outcome = match self.turn_timeout {
            Some(limit) => tokio::time::timeout(limit, self.drive(session_id, history))
                .await
                .map_err(|_| limit),
            None => Ok(self.drive(session_id, history).await),
        };

        let mut draft = match outcome {
            Ok(draft) => draft,
            Err(limit) => {
                let turn_error = TurnError::Timeout {
                    seconds: limit.as_secs_f64(),
                };
                warn!(session_id = %session_id, error = %turn_error, "Turn abandoned");

                let notice = ConversationMessage {
                    error: Some(turn_error.to_string()),
                    ..ConversationMessage::new(
                        MessageRole::Assistant,
                        format!("Sorry, this request took too long and was stopped ({}).", turn_error),
                    )
                };

                TurnDraft {
                    messages: vec![notice],
                    stages: Vec::new(),
                    trace: vec![format!("TIMEOUT: {}", turn_error)],
                    error: Some(turn_error),
                }
            }
        };

        draft.messages.insert(0, user_message);

        // === COMMIT ===
        for message in &draft.messages {
            if let Err(e) = self.sessions.append(session_id, message.clone()).await {
                error!(session_id = %session_id, error = %e, "Failed to record message");
            }
        }
        if let Err(e) = self
            .sessions
            .set_next_stage(session_id, WorkflowStage::Done)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Could not mark session done");
        }

        let answer = draft
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        info!(
            session_id = %session_id,
            stages = ?draft.stages,
            degraded = draft.error.is_some(),
            elapsed_ms,
            "Coordinator: turn complete"
        );

        TurnResult {
            session_id: session_id.clone(),
            answer,
            messages: draft.messages,
            stages: draft.stages,
            trace: draft.trace,
            error: draft.error,
            elapsed_ms,
        }
    }

    /// Walk the state machine over `history`, which ends with the user message.
    async fn drive(
        &self,
        session_id: &SessionId,
        mut history: Vec<ConversationMessage>,
    ) -> TurnDraft {
        let mut draft = TurnDraft::default();
        let mut stage = WorkflowStage::Research;

        while draft.stages.len() < MAX_STAGE_INVOCATIONS {
            let Some(runner) = self.stage_for(stage) else {
                break;
            };

            draft.stages.push(stage);
            debug!(stage = %runner.kind(), history = history.len(), "Invoking stage");

            match runner.invoke(&history).await {
                Ok(output) => {
                    let content = filter_response(&output.content);
                    let label = trace_label(stage);
                    draft
                        .trace
                        .extend(output.trace.iter().map(|step| format!("{}: {}", label, step)));

                    let next = route(stage, &content);
                    draft.trace.push(format!("ROUTE: {} -> {}", stage, next));

                    let message = ConversationMessage::assistant(stage, content);
                    history.push(message.clone());
                    draft.messages.push(message);

                    stage = match stage.advance(next) {
                        Ok(next) => next,
                        Err(e) => {
                            warn!(error = %e, "Rejected stage transition");
                            WorkflowStage::Done
                        }
                    };

                    if !stage.is_terminal() {
                        if let Err(e) = self.sessions.set_next_stage(session_id, stage).await {
                            warn!(session_id = %session_id, error = %e, "Could not record session stage");
                        }
                    }
                }
                Err(e) => {
                    let turn_error = TurnError::StageFailure {
                        stage,
                        message: e.to_string(),
                    };
                    warn!(stage = %stage, error = %e, "Stage failed, ending turn");

                    draft.trace.push(format!("{}: failed - {}", trace_label(stage), e));
                    draft.messages.push(ConversationMessage::failure(
                        stage,
                        format!("Sorry, the {} step failed: {}", stage, e),
                        turn_error.to_string(),
                    ));
                    draft.error = Some(turn_error);
                    break;
                }
            }
        }

        draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::session::{InMemorySessionStore, SessionState};
    use crate::stages::ScriptedStage;
    use std::sync::Mutex;

    /// In-memory store that remembers every stage pointer it was given.
    #[derive(Default)]
    struct StageLog {
        inner: InMemorySessionStore,
        stages: Mutex<Vec<WorkflowStage>>,
    }

    #[async_trait::async_trait]
    impl SessionStore for StageLog {
        async fn get_or_create(&self, id: &SessionId) -> Result<SessionState> {
            self.inner.get_or_create(id).await
        }
        async fn get(&self, id: &SessionId) -> Result<Option<SessionState>> {
            self.inner.get(id).await
        }
        async fn begin_turn(&self, id: &SessionId) -> Result<SessionState> {
            self.stages.lock().unwrap().push(WorkflowStage::Research);
            self.inner.begin_turn(id).await
        }
        async fn append(&self, id: &SessionId, message: ConversationMessage) -> Result<()> {
            self.inner.append(id, message).await
        }
        async fn set_next_stage(&self, id: &SessionId, stage: WorkflowStage) -> Result<()> {
            self.inner.set_next_stage(id, stage).await?;
            self.stages.lock().unwrap().push(stage);
            Ok(())
        }
        async fn end_session(&self, id: &SessionId) -> Result<bool> {
            self.inner.end_session(id).await
        }
        async fn expire_idle(&self, max_idle: chrono::Duration) -> Result<usize> {
            self.inner.expire_idle(max_idle).await
        }
        async fn session_count(&self) -> usize {
            self.inner.session_count().await
        }
    }

    /// Store whose backend is gone.
    struct Offline;

    #[async_trait::async_trait]
    impl SessionStore for Offline {
        async fn get_or_create(&self, _: &SessionId) -> Result<SessionState> {
            Err(OrchestrationError::StageError("store offline".to_string()))
        }
        async fn get(&self, _: &SessionId) -> Result<Option<SessionState>> {
            Ok(None)
        }
        async fn begin_turn(&self, _: &SessionId) -> Result<SessionState> {
            Err(OrchestrationError::StageError("store offline".to_string()))
        }
        async fn append(&self, id: &SessionId, _: ConversationMessage) -> Result<()> {
            Err(OrchestrationError::SessionNotFound(id.to_string()))
        }
        async fn set_next_stage(&self, id: &SessionId, _: WorkflowStage) -> Result<()> {
            Err(OrchestrationError::SessionNotFound(id.to_string()))
        }
        async fn end_session(&self, _: &SessionId) -> Result<bool> {
            Ok(false)
        }
        async fn expire_idle(&self, _: chrono::Duration) -> Result<usize> {
            Ok(0)
        }
        async fn session_count(&self) -> usize {
            0
        }
    }

    fn coordinator(research: ScriptedStage, calculation: ScriptedStage) -> Coordinator {
        Coordinator::new(
            Arc::new(research),
            Arc::new(calculation),
            Arc::new(InMemorySessionStore::new()),
        )
    }

    #[tokio::test]
    async fn test_research_only_turn() {
        let coordinator = coordinator(
            ScriptedStage::replying(WorkflowStage::Research, "Revenue in 2009 was 5 million."),
            ScriptedStage::failing(WorkflowStage::Calculation, "must not run"),
        );
        let id = SessionId::new("s1");

        let result = coordinator.run_turn(&id, "What was revenue in 2009?").await;

        assert_eq!(result.stages, vec![WorkflowStage::Research]);
        assert_eq!(result.answer, "Revenue in 2009 was 5 million.");
        assert_eq!(result.messages.len(), 2);
        assert!(!result.is_degraded());

        let state = coordinator.sessions().get(&id).await.unwrap().unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.next_stage, WorkflowStage::Done);
    }

    #[tokio::test]
    async fn test_trigger_routes_to_calculation() {
        let coordinator = coordinator(
            ScriptedStage::replying(
                WorkflowStage::Research,
                "2008: 181001, 2009: 206588\nNEED_MATH_CALCULATION: ((206588 - 181001) / 181001) * 100",
            ),
            ScriptedStage::replying(WorkflowStage::Calculation, "The answer is 14.1%."),
        );

        let result = coordinator.run_turn(&SessionId::new("s1"), "percentage change?").await;

        assert_eq!(
            result.stages,
            vec![WorkflowStage::Research, WorkflowStage::Calculation]
        );
        assert_eq!(result.answer, "The answer is 14.1%.");
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.messages[1].stage, Some(WorkflowStage::Research));
        assert_eq!(result.messages[2].stage, Some(WorkflowStage::Calculation));
        assert!(result.trace.iter().any(|t| t == "ROUTE: research -> calculation"));
        assert!(result.trace.iter().any(|t| t == "ROUTE: calculation -> done"));
    }

    #[tokio::test]
    async fn test_each_stage_runs_at_most_once() {
        let coordinator = coordinator(
            ScriptedStage::replying(WorkflowStage::Research, "NEED_MATH_CALCULATION: 1 + 1"),
            ScriptedStage::replying(WorkflowStage::Calculation, "still NEED_MATH_CALCULATION"),
        );

        let result = coordinator.run_turn(&SessionId::new("s1"), "q").await;
        assert_eq!(result.stages.len(), MAX_STAGE_INVOCATIONS);
        assert_eq!(result.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_stage_failure_ends_turn() {
        let coordinator = coordinator(
            ScriptedStage::replying(WorkflowStage::Research, "NEED_MATH_CALCULATION: 1 / 0"),
            ScriptedStage::failing(WorkflowStage::Calculation, "model unreachable"),
        );
        let id = SessionId::new("s1");

        let result = coordinator.run_turn(&id, "q").await;

        assert_eq!(
            result.stages,
            vec![WorkflowStage::Research, WorkflowStage::Calculation]
        );
        assert!(matches!(
            result.error,
            Some(TurnError::StageFailure {
                stage: WorkflowStage::Calculation,
                ..
            })
        ));
        let last = result.messages.last().unwrap();
        assert!(last.is_error());
        assert_eq!(result.answer, last.content);

        let state = coordinator.sessions().get(&id).await.unwrap().unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state.next_stage, WorkflowStage::Done);
    }

    #[tokio::test]
    async fn test_research_failure_skips_calculation() {
        let coordinator = coordinator(
            ScriptedStage::failing(WorkflowStage::Research, "boom"),
            ScriptedStage::replying(WorkflowStage::Calculation, "unused"),
        );

        let result = coordinator.run_turn(&SessionId::new("s1"), "q").await;
        assert_eq!(result.stages, vec![WorkflowStage::Research]);
        assert!(result.is_degraded());
    }

    #[tokio::test]
    async fn test_timeout_discards_partial_output() {
        let coordinator = coordinator(
            ScriptedStage::replying(WorkflowStage::Research, "too late")
                .with_delay(Duration::from_secs(2)),
            ScriptedStage::replying(WorkflowStage::Calculation, "unused"),
        )
        .with_turn_timeout(Some(Duration::from_millis(50)));
        let id = SessionId::new("s1");

        let result = coordinator.run_turn(&id, "q").await;

        assert!(matches!(result.error, Some(TurnError::Timeout { .. })));
        assert_eq!(result.messages.len(), 2);
        assert!(!result.answer.contains("too late"));

        let state = coordinator.sessions().get(&id).await.unwrap().unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.messages()[0].content, "q");
        assert!(state.messages()[1].is_error());
    }

    #[tokio::test]
    async fn test_history_grows_across_turns() {
        let coordinator = coordinator(
            ScriptedStage::replying(WorkflowStage::Research, "answer"),
            ScriptedStage::replying(WorkflowStage::Calculation, "unused"),
        );
        let id = SessionId::new("s1");

        coordinator.run_turn(&id, "first").await;
        let after_first = coordinator.sessions().get(&id).await.unwrap().unwrap();

        coordinator.run_turn(&id, "second").await;
        let after_second = coordinator.sessions().get(&id).await.unwrap().unwrap();

        assert_eq!(after_first.len(), 2);
        assert_eq!(after_second.len(), 4);
        assert_eq!(&after_second.messages()[..2], after_first.messages());
        assert_eq!(after_second.messages()[2].content, "second");
    }

    #[tokio::test]
    async fn test_trigger_absent_output_short_circuits() {
        let calculation_output = "The percentage change is 14.14%.";
        assert_eq!(
            route(WorkflowStage::Research, calculation_output),
            WorkflowStage::Done
        );

        let coordinator = coordinator(
            ScriptedStage::replying(WorkflowStage::Research, calculation_output),
            ScriptedStage::failing(WorkflowStage::Calculation, "must not run"),
        );
        let result = coordinator.run_turn(&SessionId::new("s1"), calculation_output).await;

        assert_eq!(result.stages, vec![WorkflowStage::Research]);
        assert_eq!(result.answer, calculation_output);
        assert!(!result.is_degraded());
    }

    #[tokio::test]
    async fn test_output_is_filtered_before_storage() {
        let coordinator = coordinator(
            ScriptedStage::replying(
                WorkflowStage::Research,
                "<think>NEED_MATH_CALCULATION maybe?</think>Net income was 3.",
            ),
            ScriptedStage::failing(WorkflowStage::Calculation, "must not run"),
        );

        let result = coordinator.run_turn(&SessionId::new("s1"), "q").await;
        assert_eq!(result.stages, vec![WorkflowStage::Research]);
        assert_eq!(result.answer, "Net income was 3.");
    }

    #[tokio::test]
    async fn test_session_stage_follows_the_turn() {
        let log = Arc::new(StageLog::default());
        let coordinator = Coordinator::new(
            Arc::new(ScriptedStage::replying(
                WorkflowStage::Research,
                "NEED_MATH_CALCULATION: 2 * 3",
            )),
            Arc::new(ScriptedStage::replying(WorkflowStage::Calculation, "The result is 6.")),
            log.clone(),
        );
        let id = SessionId::new("s1");

        coordinator.run_turn(&id, "q1").await;
        assert_eq!(
            *log.stages.lock().unwrap(),
            vec![
                WorkflowStage::Research,
                WorkflowStage::Calculation,
                WorkflowStage::Done
            ]
        );

        // mid-turn the pointer cannot go backwards
        assert!(matches!(
            log.set_next_stage(&id, WorkflowStage::Research).await,
            Err(OrchestrationError::InvalidTransition { .. })
        ));

        // the next turn starts from research again
        let result = coordinator.run_turn(&id, "q2").await;
        assert!(!result.is_degraded());
        assert_eq!(log.stages.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_research_only_turn_skips_calculation_stage() {
        let log = Arc::new(StageLog::default());
        let coordinator = Coordinator::new(
            Arc::new(ScriptedStage::replying(WorkflowStage::Research, "plain")),
            Arc::new(ScriptedStage::failing(WorkflowStage::Calculation, "must not run")),
            log.clone(),
        );

        coordinator.run_turn(&SessionId::new("s1"), "q").await;
        assert_eq!(
            *log.stages.lock().unwrap(),
            vec![WorkflowStage::Research, WorkflowStage::Done]
        );
    }

    #[tokio::test]
    async fn test_session_failure_is_not_a_stage_failure() {
        let coordinator = Coordinator::new(
            Arc::new(ScriptedStage::failing(WorkflowStage::Research, "must not run")),
            Arc::new(ScriptedStage::failing(WorkflowStage::Calculation, "must not run")),
            Arc::new(Offline),
        );

        let result = coordinator.run_turn(&SessionId::new("s1"), "q").await;

        assert!(result.stages.is_empty());
        assert!(matches!(
            result.error,
            Some(TurnError::SessionUnavailable { .. })
        ));
        assert!(result.answer.contains("store offline"));
    }
}
