//! Error types for delve-rs.
//!
//! Errors are layered: [`LlmError`] classifies provider failures so the
//! gateway can decide whether to retry, [`AgentError`] covers configuration
//! and orchestration, and [`CommandError`] is the CLI-facing wrapper.

use thiserror::Error;

/// Result type alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Agent or orchestration error.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// CLI command error.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classified failure of a single LLM call.
///
/// The classification drives retry behavior: only [`LlmError::Transient`]
/// and [`LlmError::Malformed`] are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Timeouts, 5xx, rate limiting, connection resets.
    #[error("transient provider error: {message}")]
    Transient {
        /// Provider message.
        message: String,
    },

    /// The prompt no longer fits the model's context window.
    #[error("context limit exceeded: {message}")]
    ContextLimitExceeded {
        /// Provider message.
        message: String,
    },

    /// Unparseable response body or tool-call arguments.
    #[error("malformed provider response: {message}")]
    Malformed {
        /// Parse failure detail.
        message: String,
    },

    /// Authentication, bad request, or configuration problems.
    #[error("fatal provider error: {message}")]
    Fatal {
        /// Provider message.
        message: String,
    },

    /// The run was cancelled while the call was in flight.
    #[error("LLM call cancelled")]
    Cancelled,
}

impl LlmError {
    /// Returns `true` when another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Malformed { .. })
    }

    /// Short machine-readable kind, used in traces.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::ContextLimitExceeded { .. } => "context_limit_exceeded",
            Self::Malformed { .. } => "malformed",
            Self::Fatal { .. } => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Agent configuration and orchestration errors.
#[derive(Error, Debug)]
pub enum AgentError {
    /// No API key found for the selected provider.
    #[error("API key missing: set OPENAI_API_KEY, ANTHROPIC_API_KEY or DELVE_API_KEY")]
    ApiKeyMissing,

    /// Provider name not recognized.
    #[error("unsupported provider: {name}")]
    UnsupportedProvider {
        /// Requested provider name.
        name: String,
    },

    /// Invalid configuration value.
    #[error("configuration error: {message}")]
    Config {
        /// Detail.
        message: String,
    },

    /// Agent profile could not be loaded or is inconsistent.
    #[error("profile error: {message}")]
    Profile {
        /// Detail.
        message: String,
    },

    /// Delegation requested beyond the configured nesting depth.
    #[error("delegation depth {depth} exceeds maximum {max}")]
    DelegationDepthExceeded {
        /// Depth of the requesting agent.
        depth: usize,
        /// Configured cap.
        max: usize,
    },

    /// Orchestration failure outside the LLM call itself.
    #[error("orchestration error: {message}")]
    Orchestration {
        /// Detail.
        message: String,
    },

    /// Tool backend could not be started or reached.
    #[error("tool gateway error: {message}")]
    ToolGateway {
        /// Detail.
        message: String,
    },

    /// Classified LLM failure.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// CLI command errors.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Invalid command-line argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Command failed while executing.
    #[error("{0}")]
    ExecutionFailed(String),

    /// Output could not be formatted.
    #[error("output format error: {0}")]
    OutputFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_retryable() {
        assert!(
            LlmError::Transient {
                message: "503".to_string()
            }
            .is_retryable()
        );
        assert!(
            LlmError::Malformed {
                message: "bad json".to_string()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ContextLimitExceeded {
                message: "too long".to_string()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::Fatal {
                message: "401".to_string()
            }
            .is_retryable()
        );
        assert!(!LlmError::Cancelled.is_retryable());
    }

    #[test]
    fn test_agent_error_from_llm() {
        let err: AgentError = LlmError::Fatal {
            message: "bad key".to_string(),
        }
        .into();
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn test_error_display() {
        let err = Error::from(CommandError::InvalidArgument("--max-turns".to_string()));
        assert_eq!(err.to_string(), "invalid argument: --max-turns");
    }
}
