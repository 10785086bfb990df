//! Context retrieval over the static document index
//!
//! Linear scan scoring every indexed question against the query and
//! returning the best match's table, text and example program.

use crate::models::RetrievedContext;
use std::path::Path;
use tracing::{debug, info};

pub mod dataset;
pub mod similarity;

pub use dataset::{DocumentIndex, IndexEntry};
pub use similarity::sequence_ratio;

/// Pure, stateless lookup over an index built once at startup.
pub struct ContextRetriever {
    index: DocumentIndex,
}

impl ContextRetriever {
    pub fn new(index: DocumentIndex) -> Self {
        Self { index }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::new(DocumentIndex::load(path))
    }

    pub fn index(&self) -> &DocumentIndex {
        &self.index
    }

    /// Best `k` entries by similarity, highest first. Equal scores keep index
    /// order.
    pub fn top_matches(&self, query: &str, k: usize) -> Vec<(f64, &IndexEntry)> {
        let mut scored: Vec<(f64, &IndexEntry)> = self
            .index
            .entries()
            .iter()
            .map(|entry| (sequence_ratio(query, &entry.question), entry))
            .collect();

        // stable sort keeps first-seen order among ties
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(k);
        scored
    }

    /// Retrieve the context for the most similar indexed question.
    pub fn lookup(&self, query: &str) -> RetrievedContext {
        let candidates = self.top_matches(query, 3);

        for (rank, (score, entry)) in candidates.iter().enumerate() {
            debug!(
                rank = rank + 1,
                similarity = format!("{:.3}", score),
                question = %entry.question,
                answer = %entry.answer,
                "Retrieval candidate"
            );
        }

        let Some((score, entry)) = candidates.first() else {
            info!("Index empty, returning fallback context");
            return fallback_context();
        };

        info!(
            similarity = format!("{:.3}", score),
            matched = %entry.question,
            fallback = self.index.is_builtin(),
            "Context retrieved"
        );

        let mut context = context_from_entry(entry, *score);
        context.fallback = self.index.is_builtin();
        context
    }
}

fn context_from_entry(entry: &IndexEntry, score: f64) -> RetrievedContext {
    RetrievedContext {
        matched_question: entry.question.clone(),
        similarity_score: score,
        pre_text: entry.pre_text.clone(),
        post_text: entry.post_text.clone(),
        table: entry.table.clone(),
        example_program: entry.program.clone(),
        reference_answer: entry.answer.clone(),
        filename: entry.filename.clone(),
        fallback: false,
    }
}

/// Fixed, non-empty context used when there is nothing to match against.
pub fn fallback_context() -> RetrievedContext {
    RetrievedContext {
        fallback: true,
        ..context_from_entry(&dataset::sample_entry(), 0.0)
    }
}

fn mentions_year(cell: &str) -> bool {
    cell.split(|c: char| !c.is_ascii_digit())
        .any(|run| run.len() == 4 && (run.starts_with("19") || run.starts_with("20")))
}

/// Render retrieved context into the block the research prompt embeds.
pub fn render_for_prompt(context: &RetrievedContext, query: &str) -> String {
    let mut table = String::new();

    if context.table.is_empty() {
        table.push_str("No table data available.\n");
    } else {
        for (i, row) in context.table.iter().enumerate() {
            match row.split_first() {
                Some((label, values)) if !values.is_empty() => {
                    let label = if label.is_empty() {
                        format!("Row {}", i + 1)
                    } else {
                        label.clone()
                    };
                    let values: Vec<&str> = values
                        .iter()
                        .map(String::as_str)
                        .filter(|v| !v.is_empty())
                        .collect();
                    if !values.is_empty() {
                        table.push_str(&format!("  • {}: {}\n", label, values.join(" | ")));
                    }
                }
                _ => {
                    let cells: Vec<&str> = row
                        .iter()
                        .map(String::as_str)
                        .filter(|v| !v.is_empty())
                        .collect();
                    table.push_str(&format!("  • {}\n", cells.join(" | ")));
                }
            }
        }
    }

    let year_mapping = context
        .table
        .first()
        .filter(|header| header.iter().any(|cell| mentions_year(cell)))
        .map(|header| format!("YEAR MAPPING FROM TABLE HEADERS: {:?}\n", header))
        .unwrap_or_default();

    format!(
        r#"RETRIEVED CONTEXT (similarity {:.3} to: "{}")

REFERENCE ANSWER: {} (from dataset)
REFERENCE CALCULATION: {} (from dataset)

EXACT TABLE DATA TO EXTRACT FROM:
{}{}
EXTRACTION RULES:
1. Find the row containing your target metric
2. Copy the EXACT values from that row
3. DO NOT invent, round, or estimate any numbers
4. The table shows values in columns, typically ordered by year

SUPPORTING CONTEXT:
Pre-text: {}
Post-text: {}

USER QUERY: '{}'"#,
        context.similarity_score,
        context.matched_question,
        context.reference_answer,
        context.example_program,
        table,
        year_mapping,
        context.pre_text,
        context.post_text,
        query,
    )
}
