//! LLM provider implementations.
//!
//! Also hosts the helpers every backend shares: error classification by
//! status and message, `<think>` reasoning separation, and tool-argument
//! parsing.

pub mod anthropic;
pub mod inline;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::error::LlmError;

/// Message fragments that identify a context-window overflow.
const CONTEXT_LIMIT_MARKERS: &[&str] = &[
    "context length",
    "context_length",
    "maximum context",
    "context window",
    "prompt is too long",
    "input is too long",
    "too many tokens",
    "reduce the length",
    "exceeds the model's maximum",
    "request_too_large",
];

/// Message fragments that identify retryable conditions when no HTTP status
/// is available.
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "rate limit",
    "rate_limit",
    "overloaded",
    "server_error",
    "temporarily unavailable",
    "connection",
    "try again",
];

/// Returns `true` if the text describes a context-window overflow.
#[must_use]
pub fn is_context_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONTEXT_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Classifies a provider failure.
///
/// Context-limit markers win over status codes, since providers report them
/// as 400 or 413. Without a status the message decides between
/// [`LlmError::Transient`] and [`LlmError::Fatal`].
#[must_use]
pub fn classify(status: Option<u16>, detail: &str) -> LlmError {
    let message = detail.to_string();
    if status == Some(413) || is_context_limit(detail) {
        return LlmError::ContextLimitExceeded { message };
    }
    match status {
        Some(408 | 409 | 425 | 429 | 529) => LlmError::Transient { message },
        Some(s) if s >= 500 => LlmError::Transient { message },
        Some(_) => LlmError::Fatal { message },
        None => {
            let lower = detail.to_lowercase();
            if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                LlmError::Transient { message }
            } else {
                LlmError::Fatal { message }
            }
        }
    }
}

/// Parses tool-call arguments into a JSON object.
///
/// Empty input means no arguments. A JSON string holding an object is
/// unwrapped, since some servers double-encode.
///
/// # Errors
///
/// Returns [`LlmError::Malformed`] if the text is not a JSON object.
pub fn parse_arguments(tool: &str, raw: &str) -> Result<serde_json::Value, LlmError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| LlmError::Malformed {
            message: format!("invalid arguments for tool {tool}: {e}"),
        })?;
    match value {
        serde_json::Value::Object(_) => Ok(value),
        serde_json::Value::Null => Ok(serde_json::Value::Object(serde_json::Map::new())),
        serde_json::Value::String(inner) => parse_arguments(tool, &inner),
        other => Err(LlmError::Malformed {
            message: format!("arguments for tool {tool} must be a JSON object, got {other}"),
        }),
    }
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Moves `<think>...</think>` spans out of the answer text.
///
/// Servers that strip the opening tag leave a bare `</think>`; everything
/// before it is treated as reasoning. An unterminated `<think>` swallows
/// the rest of the text.
#[must_use]
pub fn split_reasoning(text: &str) -> (String, Option<String>) {
    let mut answer = String::new();
    let mut reasoning: Vec<String> = Vec::new();
    let mut rest = text;

    if let Some(close) = rest.find(THINK_CLOSE)
        && rest.find(THINK_OPEN).is_none_or(|open| open > close)
    {
        reasoning.push(rest[..close].trim().to_string());
        rest = &rest[close + THINK_CLOSE.len()..];
    }

    while let Some(open) = rest.find(THINK_OPEN) {
        answer.push_str(&rest[..open]);
        let after = &rest[open + THINK_OPEN.len()..];
        if let Some(close) = after.find(THINK_CLOSE) {
            reasoning.push(after[..close].trim().to_string());
            rest = &after[close + THINK_CLOSE.len()..];
        } else {
            reasoning.push(after.trim().to_string());
            rest = "";
        }
    }
    answer.push_str(rest);

    reasoning.retain(|r| !r.is_empty());
    let reasoning = if reasoning.is_empty() {
        None
    } else {
        Some(reasoning.join("\n\n"))
    };
    (answer.trim().to_string(), reasoning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Some(400), "This model's maximum context length is 8192 tokens", "context_limit_exceeded"; "openai context")]
    #[test_case(Some(400), "prompt is too long: 210000 tokens > 200000 maximum", "context_limit_exceeded"; "anthropic context")]
    #[test_case(Some(413), "request entity too large", "context_limit_exceeded"; "payload too large")]
    #[test_case(Some(429), "rate limited", "transient"; "rate limit")]
    #[test_case(Some(529), "overloaded_error", "transient"; "anthropic overloaded")]
    #[test_case(Some(503), "service unavailable", "transient"; "server error")]
    #[test_case(Some(401), "invalid x-api-key", "fatal"; "auth")]
    #[test_case(Some(400), "invalid model", "fatal"; "bad request")]
    #[test_case(None, "operation timed out", "transient"; "timeout without status")]
    #[test_case(None, "context_length_exceeded", "context_limit_exceeded"; "code without status")]
    #[test_case(None, "invalid_api_key", "fatal"; "unknown without status")]
    fn test_classify(status: Option<u16>, detail: &str, kind: &str) {
        assert_eq!(classify(status, detail).kind(), kind);
    }

    #[test]
    fn test_parse_arguments_object() {
        let v = parse_arguments("t", r#"{"q": 1}"#).unwrap_or_else(|_| unreachable!());
        assert_eq!(v["q"], 1);
    }

    #[test]
    fn test_parse_arguments_empty_and_null() {
        assert!(parse_arguments("t", "").is_ok_and(|v| v.is_object()));
        assert!(parse_arguments("t", "null").is_ok_and(|v| v.is_object()));
    }

    #[test]
    fn test_parse_arguments_double_encoded() {
        let v = parse_arguments("t", r#""{\"q\": \"x\"}""#).unwrap_or_else(|_| unreachable!());
        assert_eq!(v["q"], "x");
    }

    #[test]
    fn test_parse_arguments_malformed() {
        assert!(matches!(
            parse_arguments("t", "{not json"),
            Err(LlmError::Malformed { .. })
        ));
        assert!(matches!(
            parse_arguments("t", "[1, 2]"),
            Err(LlmError::Malformed { .. })
        ));
    }

    #[test]
    fn test_split_reasoning_tagged() {
        let (answer, reasoning) = split_reasoning("<think>step 1</think>The answer is 4.");
        assert_eq!(answer, "The answer is 4.");
        assert_eq!(reasoning.as_deref(), Some("step 1"));
    }

    #[test]
    fn test_split_reasoning_missing_open_tag() {
        let (answer, reasoning) = split_reasoning("thinking hard</think>\n\\boxed{4}");
        assert_eq!(answer, "\\boxed{4}");
        assert_eq!(reasoning.as_deref(), Some("thinking hard"));
    }

    #[test]
    fn test_split_reasoning_unterminated() {
        let (answer, reasoning) = split_reasoning("Intro <think>never closed");
        assert_eq!(answer, "Intro");
        assert_eq!(reasoning.as_deref(), Some("never closed"));
    }

    #[test]
    fn test_split_reasoning_none() {
        let (answer, reasoning) = split_reasoning("  plain  ");
        assert_eq!(answer, "plain");
        assert!(reasoning.is_none());
    }
}
