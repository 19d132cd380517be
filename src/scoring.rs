//! Metrics derived locally from a finished completion.
//!
//! Both are word-count heuristics. Clients compare them across requests, so
//! the thresholds must not drift.

use crate::models::Mode;

const HEDGE_WORDS: [&str; 3] = ["uncertain", "might", "possibly"];

/// First two sentences of `content`, or the whole trimmed text when it has at
/// most two.
pub fn summarize(content: &str) -> String {
    let sentences: Vec<&str> = content
        .split('.')
        .filter(|s| !s.trim().is_empty())
        .collect();

    if sentences.len() <= 2 {
        return content.trim().to_string();
    }

    format!("{}.", sentences[..2].join(".").trim())
}

// Tokens of a split on whitespace runs. Leading or trailing whitespace
// contributes one empty token each, and empty content is a single token.
fn word_count(content: &str) -> usize {
    if content.is_empty() {
        return 1;
    }
    let edges = usize::from(content.starts_with(char::is_whitespace))
        + usize::from(content.ends_with(char::is_whitespace));
    content.split_whitespace().count() + edges
}

/// Confidence in `[0, 1]`, in steps of one tenth.
pub fn confidence(content: &str, mode: Mode) -> f64 {
    let words = word_count(content);
    let mut tenths: i32 = 5;

    if words > 50 {
        tenths += 2;
    }
    if words > 100 {
        tenths += 1;
    }
    if HEDGE_WORDS.iter().any(|w| content.contains(w)) {
        tenths -= 2;
    }
    if mode == Mode::Analyze && content.contains("analysis") && content.contains("data") {
        tenths += 1;
    }

    f64::from(tenths.clamp(0, 10)) / 10.0
}
