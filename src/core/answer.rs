//! Final-answer extraction.
//!
//! Benchmark graders expect the answer wrapped in `\boxed{...}`. These
//! functions are pure: the pipeline applies [`extract_final_answer`] as the
//! last deterministic post-processing step, and applying it twice gives the
//! same result as applying it once.

use super::balanced::{Quoting, matching_close};

/// Marker that opens a boxed answer.
pub const BOXED_MARKER: &str = "\\boxed{";

/// Returns the content of the last well-formed `\boxed{...}` in `text`.
///
/// Nested braces inside the box are allowed. An unclosed trailing marker is
/// skipped in favor of an earlier complete one.
#[must_use]
pub fn extract_boxed(text: &str) -> Option<String> {
    let mut upper = text.len();
    while let Some(pos) = text.get(..upper).and_then(|s| s.rfind(BOXED_MARKER)) {
        let open = pos + BOXED_MARKER.len() - 1;
        if let Some(close) = matching_close(text, open, Quoting::Latex) {
            return Some(text[open + 1..close].trim().to_string());
        }
        upper = pos;
    }
    None
}

/// Returns `true` if `text` contains a complete boxed answer.
#[must_use]
pub fn has_boxed(text: &str) -> bool {
    extract_boxed(text).is_some()
}

/// Deterministic answer normalization.
///
/// Unwraps boxed answers until none remain, then trims. Text without a box
/// is returned trimmed.
#[must_use]
pub fn extract_final_answer(text: &str) -> String {
    let mut current = text.trim().to_string();
    while let Some(inner) = extract_boxed(&current) {
        if inner == current {
            break;
        }
        current = inner;
    }
    current
}

/// Best-effort answer from the last assistant text of an unfinished run:
/// boxed content if present, otherwise the trimmed text.
#[must_use]
pub fn best_effort_answer(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(extract_boxed(trimmed).unwrap_or_else(|| trimmed.to_string()))
}
