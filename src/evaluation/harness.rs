//! Evaluation harness
//!
//! Samples questions from the dataset, runs each one through the
//! coordinator in a fresh session and scores the answers.

use super::{extract, is_exact_match, parse_expected, validate, Tolerance};
use crate::models::{EvaluationRecord, SessionId};
use crate::retrieval::dataset::{load_records, CANONICAL_ANSWER, CANONICAL_QUESTION};
use crate::workflow::Coordinator;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleQuestion {
    pub question: String,
    pub answer: String,
}

impl SampleQuestion {
    fn canonical() -> Self {
        Self {
            question: CANONICAL_QUESTION.to_string(),
            answer: CANONICAL_ANSWER.to_string(),
        }
    }
}

/// Pick up to `n` questions: the canonical one first when present, the rest
/// spread evenly over the dataset.
pub fn sample_questions(path: impl AsRef<Path>, n: usize) -> Vec<SampleQuestion> {
    let path = path.as_ref();

    let records = match load_records(path) {
        Ok((records, _)) => records,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not load questions, using canonical question");
            return vec![SampleQuestion::canonical()];
        }
    };

    let questions: Vec<SampleQuestion> = records
        .into_iter()
        .filter_map(|record| record.qa)
        .filter(|qa| !qa.question.trim().is_empty() && !qa.answer.trim().is_empty())
        .map(|qa| SampleQuestion {
            question: qa.question,
            answer: qa.answer,
        })
        .collect();

    let mut sampled = Vec::with_capacity(n);
    if n == 0 {
        return sampled;
    }

    let canonical = questions
        .iter()
        .position(|q| q.question.to_lowercase().contains(CANONICAL_QUESTION));
    if let Some(index) = canonical {
        sampled.push(questions[index].clone());
    }

    let remaining_needed = n - sampled.len();
    if remaining_needed > 0 {
        let available: Vec<&SampleQuestion> = questions
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != canonical)
            .map(|(_, q)| q)
            .collect();

        let step = (available.len() / remaining_needed).max(1);
        let end = available.len().min(remaining_needed * step);
        sampled.extend(
            (0..end)
                .step_by(step)
                .take(remaining_needed)
                .map(|i| available[i].clone()),
        );
    }

    info!(requested = n, sampled = sampled.len(), "Evaluation questions sampled");
    sampled
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetadata {
    pub timestamp: DateTime<Utc>,
    pub total_questions: usize,
    pub dataset_fingerprint: String,
    pub tolerance: Tolerance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total_questions: usize,
    pub successful_responses: usize,
    pub exact_matches: usize,
    pub numerical_matches: usize,
    pub accuracy_exact: f64,
    pub accuracy_numerical: f64,
    pub average_response_time: f64,
    pub error_rate: f64,
}

impl EvaluationSummary {
    pub fn from_records(records: &[EvaluationRecord]) -> Self {
        let total = records.len();
        if total == 0 {
            return Self::default();
        }

        let successful = records.iter().filter(|r| r.error.is_none()).count();
        let exact = records.iter().filter(|r| r.exact_match).count();
        let numerical = records.iter().filter(|r| r.matches).count();
        let total_time: f64 = records.iter().map(|r| r.response_time).sum();
        let ratio = |count: usize| count as f64 / total as f64;

        Self {
            total_questions: total,
            successful_responses: successful,
            exact_matches: exact,
            numerical_matches: numerical,
            accuracy_exact: ratio(exact),
            accuracy_numerical: ratio(numerical),
            average_response_time: total_time / total as f64,
            error_rate: ratio(total - successful),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub metadata: EvaluationMetadata,
    pub summary: EvaluationSummary,
    pub detailed_results: Vec<EvaluationRecord>,
}

impl EvaluationReport {
    /// Write the report as pretty JSON, creating parent directories.
    pub async fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;

        info!(path = %path.display(), "Evaluation results saved");
        Ok(())
    }
}

/// Score one answer against the dataset answer.
fn score(
    session_id: SessionId,
    question: &SampleQuestion,
    response: String,
    error: Option<String>,
    response_time: f64,
    tolerance: Tolerance,
) -> EvaluationRecord {
    let extracted = if error.is_none() { extract(&response) } else { None };

    let matches = match (extracted, parse_expected(&question.answer)) {
        (Some(got), Some(want)) => validate(got, want, tolerance),
        _ => false,
    };
    let exact_match = error.is_none() && is_exact_match(&response, &question.answer);

    EvaluationRecord {
        session_id,
        question: question.question.clone(),
        expected_answer: question.answer.clone(),
        extracted_answer: extracted,
        exact_match,
        matches,
        response,
        response_time,
        error,
    }
}

/// Run every question through the coordinator, one fresh session each.
pub async fn run_evaluation(
    coordinator: &Coordinator,
    questions: &[SampleQuestion],
    tolerance: Tolerance,
    dataset_fingerprint: &str,
) -> EvaluationReport {
    let mut records = Vec::with_capacity(questions.len());

    for (i, question) in questions.iter().enumerate() {
        let session_id = SessionId::generate();
        info!(
            item = i + 1,
            total = questions.len(),
            question = %question.question,
            "Evaluating question"
        );

        let turn = coordinator.run_turn(&session_id, &question.question).await;
        let record = score(
            session_id.clone(),
            question,
            turn.answer,
            turn.error.map(|e| e.to_string()),
            turn.elapsed_ms as f64 / 1000.0,
            tolerance,
        );

        info!(
            expected = %record.expected_answer,
            extracted = ?record.extracted_answer,
            matches = record.matches,
            "Question scored"
        );

        if let Err(e) = coordinator.sessions().end_session(&session_id).await {
            warn!(session_id = %session_id, error = %e, "Could not end evaluation session");
        }
        records.push(record);
    }

    let summary = EvaluationSummary::from_records(&records);
    info!(
        total = summary.total_questions,
        numerical_matches = summary.numerical_matches,
        accuracy = summary.accuracy_numerical,
        "Evaluation complete"
    );

    EvaluationReport {
        metadata: EvaluationMetadata {
            timestamp: Utc::now(),
            total_questions: records.len(),
            dataset_fingerprint: dataset_fingerprint.to_string(),
            tolerance,
        },
        summary,
        detailed_results: records,
    }
}
