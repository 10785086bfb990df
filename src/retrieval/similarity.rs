//! Character-level sequence similarity
//!
//! Score is `2 * M / (|a| + |b|)` where M is the length of the longest
//! common subsequence of characters, so it is symmetric and lies in [0, 1].

use similar::TextDiff;

/// Similarity of two strings in [0, 1], compared case-insensitively.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    f64::from(TextDiff::from_chars(a.as_str(), b.as_str()).ratio())
}
