//! FinQA-style dataset loading
//!
//! Accepts either a JSON array or JSON-lines. A missing, empty or malformed
//! file degrades to a single built-in sample record so retrieval always has
//! something to return.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CANONICAL_QUESTION: &str =
    "what was the percentage change in the net cash from operating activities from 2008 to 2009";
pub const CANONICAL_ANSWER: &str = "14.1%";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QaPair {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub program: String,
}

/// One raw dataset record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetRecord {
    #[serde(default)]
    pub qa: Option<QaPair>,
    #[serde(default)]
    pub pre_text: Vec<String>,
    #[serde(default)]
    pub post_text: Vec<String>,
    #[serde(default)]
    pub table: Vec<Vec<Value>>,
    #[serde(default)]
    pub table_ori: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// A record flattened into the shape retrieval works with.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub question: String,
    pub answer: String,
    pub program: String,
    pub pre_text: String,
    pub post_text: String,
    pub table: Vec<Vec<String>>,
    pub filename: String,
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl DatasetRecord {
    /// Flatten into an index entry. Records without a question are dropped.
    pub fn into_entry(self) -> Option<IndexEntry> {
        let qa = self.qa?;
        if qa.question.trim().is_empty() {
            return None;
        }

        let table = self
            .table_ori
            .filter(|t| !t.is_empty())
            .unwrap_or(self.table)
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();

        Some(IndexEntry {
            question: qa.question,
            answer: qa.answer,
            program: qa.program,
            pre_text: self.pre_text.join(" "),
            post_text: self.post_text.join(" "),
            table,
            filename: self.filename.unwrap_or_else(|| "Unknown".to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexSource {
    File(PathBuf),
    Builtin,
}

/// Static in-memory document index, built once at startup.
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    entries: Vec<IndexEntry>,
    source: IndexSource,
    fingerprint: String,
}

impl DocumentIndex {
    pub fn from_entries(entries: Vec<IndexEntry>) -> Self {
        Self {
            entries,
            source: IndexSource::Builtin,
            fingerprint: "builtin".to_string(),
        }
    }

    /// Load the index from disk, falling back to the built-in sample record.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        match load_records(path) {
            Ok((records, fingerprint)) => {
                let entries: Vec<IndexEntry> = records
                    .into_iter()
                    .filter_map(DatasetRecord::into_entry)
                    .collect();

                if entries.is_empty() {
                    warn!(path = %path.display(), "Dataset has no usable questions, using sample data");
                    return Self::builtin();
                }

                info!(
                    path = %path.display(),
                    entries = entries.len(),
                    fingerprint = %fingerprint,
                    "Document index loaded"
                );

                Self {
                    entries,
                    source: IndexSource::File(path.to_path_buf()),
                    fingerprint,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dataset unavailable, using sample data");
                Self::builtin()
            }
        }
    }

    /// The fallback index: one canonical record.
    pub fn builtin() -> Self {
        Self::from_entries(vec![sample_entry()])
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn source(&self) -> &IndexSource {
        &self.source
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_builtin(&self) -> bool {
        self.source == IndexSource::Builtin
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Built-in sample record used whenever the real index is unavailable.
pub fn sample_entry() -> IndexEntry {
    IndexEntry {
        question: CANONICAL_QUESTION.to_string(),
        answer: CANONICAL_ANSWER.to_string(),
        program: "subtract(206588, 181001), divide(#0, 181001)".to_string(),
        pre_text: "sample pre text".to_string(),
        post_text: "sample post text".to_string(),
        table: vec![vec![
            "sample".to_string(),
            "table".to_string(),
            "data".to_string(),
        ]],
        filename: "sample_file.pdf".to_string(),
    }
}

/// Read and parse raw records, returning them with a SHA-256 fingerprint of
/// the source bytes.
pub fn load_records(path: &Path) -> crate::Result<(Vec<DatasetRecord>, String)> {
    let raw = std::fs::read(path)?;
    let fingerprint = hex::encode(Sha256::digest(&raw));

    let content = String::from_utf8(raw).map_err(|e| {
        crate::error::OrchestrationError::DatasetError(format!("dataset is not UTF-8: {}", e))
    })?;
    let content = content.trim();

    if content.is_empty() {
        return Err(crate::error::OrchestrationError::DatasetError(
            "dataset file is empty".to_string(),
        ));
    }

    let records = if content.starts_with('[') {
        serde_json::from_str::<Vec<DatasetRecord>>(content)?
    } else {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<DatasetRecord>)
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    Ok((records, fingerprint))
}
