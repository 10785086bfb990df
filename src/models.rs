//! Core data models for the FinQA orchestrator

use crate::calculator::CalcError;
use crate::error::OrchestrationError;
use crate::session::ConversationMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Workflow Stage =================
//

/// Position of a turn in the research → calculation → done pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStage {
    #[default]
    Research,
    Calculation,
    Done,
}

impl WorkflowStage {
    fn rank(&self) -> u8 {
        match self {
            WorkflowStage::Research => 0,
            WorkflowStage::Calculation => 1,
            WorkflowStage::Done => 2,
        }
    }

    /// Move to `next`, refusing anything that is not strictly forward.
    pub fn advance(self, next: WorkflowStage) -> crate::Result<WorkflowStage> {
        if next.rank() > self.rank() {
            Ok(next)
        } else {
            Err(OrchestrationError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == WorkflowStage::Done
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStage::Research => "research",
            WorkflowStage::Calculation => "calculation",
            WorkflowStage::Done => "done",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Session Identity =================
//

/// Opaque session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//
// ================= Retrieval =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedContext {
    pub matched_question: String,
    pub similarity_score: f64,
    pub pre_text: String,
    pub post_text: String,
    pub table: Vec<Vec<String>>,
    pub example_program: String,
    pub reference_answer: String,
    pub filename: String,
    /// Set when the index was unavailable and the built-in record was used.
    pub fallback: bool,
}

//
// ================= Calculation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculationResult {
    pub expression: String,
    pub value: Option<f64>,
    pub error: Option<CalcError>,
}

impl CalculationResult {
    pub fn from_outcome(expression: &str, outcome: std::result::Result<f64, CalcError>) -> Self {
        match outcome {
            Ok(value) => Self {
                expression: expression.to_string(),
                value: Some(value),
                error: None,
            },
            Err(error) => Self {
                expression: expression.to_string(),
                value: None,
                error: Some(error),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Text handed back to the model as the calculator tool output.
    pub fn render(&self) -> String {
        match (&self.value, &self.error) {
            (_, Some(error)) => format!("Error: {}", error),
            (Some(value), None) => crate::calculator::format_value(*value),
            (None, None) => "Error: no result".to_string(),
        }
    }
}

//
// ================= Turn Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnError {
    StageFailure { stage: WorkflowStage, message: String },
    Timeout { seconds: f64 },
    /// The session store could not provide the conversation; no stage ran.
    SessionUnavailable { message: String },
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::StageFailure { stage, message } => {
                write!(f, "{} stage failed: {}", stage, message)
            }
            TurnError::Timeout { seconds } => write!(f, "turn timed out after {:.1}s", seconds),
            TurnError::SessionUnavailable { message } => {
                write!(f, "session unavailable: {}", message)
            }
        }
    }
}

/// Everything the coordinator reports back for one user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub session_id: SessionId,
    pub answer: String,
    pub messages: Vec<ConversationMessage>,
    pub stages: Vec<WorkflowStage>,
    pub trace: Vec<String>,
    pub error: Option<TurnError>,
    pub elapsed_ms: u64,
}

impl TurnResult {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

//
// ================= Evaluation =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub session_id: SessionId,
    pub question: String,
    pub expected_answer: String,
    pub extracted_answer: Option<f64>,
    pub exact_match: bool,
    pub matches: bool,
    pub response: String,
    pub response_time: f64,
    pub error: Option<String>,
}
