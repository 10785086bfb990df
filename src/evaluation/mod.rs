//! Answer extraction and validation
//!
//! Pulls a percentage out of free-form answer text using an ordered list of
//! matchers (first match wins) and compares it to the dataset answer.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod harness;

pub use harness::{run_evaluation, sample_questions, EvaluationReport, EvaluationSummary};

/// One extraction rule
pub struct AnswerMatcher {
    name: &'static str,
    pattern: Regex,
}

impl AnswerMatcher {
    pub fn new(name: &'static str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(&format!("(?i){}", pattern))?,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn capture<'a>(&self, response: &'a str) -> Option<&'a str> {
        self.pattern
            .captures(response)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }
}

const NUMBER: &str = r"(-?\d+(?:\.\d+)?)";

lazy_static! {
    // Most specific form first. Model answers usually quote the source
    // figures as percentages before stating the result, so a bare `N%`
    // matcher tried first would pick up an input figure instead of the
    // labelled answer.
    static ref DEFAULT_MATCHERS: Vec<AnswerMatcher> = [
        ("answer_label", format!(r"answer\s*:\s*{}\s*%", NUMBER)),
        ("result_label", format!(r"result\s*:\s*{}\s*%", NUMBER)),
        ("is_percent", format!(r"\bis\s+{}\s*%", NUMBER)),
        ("percent_change", format!(r"{}\s*%\s*change", NUMBER)),
        ("percent_sign", format!(r"{}\s*%", NUMBER)),
        ("percent_word", format!(r"{}\s*percent", NUMBER)),
    ]
    .iter()
    .map(|(name, pattern)| AnswerMatcher::new(*name, pattern).unwrap())
    .collect();
}

/// The matched number as written in the response, e.g. `"14.1"`.
pub fn extract_text(response: &str) -> Option<&str> {
    DEFAULT_MATCHERS.iter().find_map(|m| m.capture(response))
}

/// First percentage found by the ordered matchers.
pub fn extract(response: &str) -> Option<f64> {
    extract_text(response).and_then(|text| text.parse().ok())
}

/// Numeric value of a dataset answer such as `"14.1%"` or `"$1,234"`.
pub fn parse_expected(expected: &str) -> Option<f64> {
    let cleaned: String = expected
        .trim()
        .chars()
        .filter(|c| !matches!(c, '%' | '$' | ',') && !c.is_whitespace())
        .collect();
    cleaned.parse().ok()
}

/// Case-insensitive string comparison of the extracted `"N%"` with the
/// dataset answer.
pub fn is_exact_match(response: &str, expected: &str) -> bool {
    extract_text(response)
        .map(|text| format!("{}%", text).eq_ignore_ascii_case(expected.trim()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Tolerance {
    /// Maximum difference in percentage points, inclusive
    Absolute(f64),
    /// Maximum difference as a fraction of the expected value
    Relative(f64),
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::Absolute(0.1)
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tolerance::Absolute(points) => write!(f, "±{} points", points),
            Tolerance::Relative(fraction) => write!(f, "±{}%", fraction * 100.0),
        }
    }
}

// absorbs representation error, e.g. 14.2 - 14.1 = 0.09999999999999964
const EPSILON: f64 = 1e-9;

pub fn validate(extracted: f64, expected: f64, tolerance: Tolerance) -> bool {
    if !extracted.is_finite() || !expected.is_finite() {
        return false;
    }

    let diff = (extracted - expected).abs();
    match tolerance {
        Tolerance::Absolute(points) => diff <= points + EPSILON,
        Tolerance::Relative(fraction) => diff <= fraction * expected.abs() + EPSILON,
    }
}
