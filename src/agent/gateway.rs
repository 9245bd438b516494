//! LLM gateway: one provider behind timeouts, classified retries and
//! tool-call id repair.
//!
//! The orchestrator only ever talks to [`LlmGateway::complete`]. Providers
//! make a single attempt; this layer decides whether another attempt is
//! worthwhile and guarantees that every returned tool call carries an id
//! unique within the conversation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::AgentConfig;
use super::message::{ChatRequest, ChatResponse, Role};
use super::provider::LlmProvider;
use super::retry::RetryPolicy;
use super::tool::ToolCall;
use crate::error::LlmError;

/// A successful completion plus call accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Normalized response.
    pub response: ChatResponse,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Wall time across all attempts.
    pub latency: Duration,
}

/// A completion that failed after the retry policy gave up.
#[derive(Debug, Clone, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct CompletionError {
    /// Last classified error.
    pub error: LlmError,
    /// Attempts made.
    pub attempts: u32,
}

/// Provider-agnostic completion endpoint shared by every agent of a task.
#[derive(Clone)]
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LlmGateway {
    /// Wraps a provider.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            timeout,
        }
    }

    /// Wraps a provider using the configured policy and timeout.
    #[must_use]
    pub fn from_config(provider: Arc<dyn LlmProvider>, config: &AgentConfig) -> Self {
        Self::new(provider, RetryPolicy::from_config(config), config.timeout)
    }

    /// Name of the wrapped provider.
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Runs one completion with retries.
    ///
    /// Transient and malformed failures are retried with exponential
    /// backoff until their attempt ceiling; context-limit and fatal errors
    /// return after the first attempt. A call exceeding the timeout counts
    /// as transient. Cancelling `cancel` abandons the in-flight attempt or
    /// backoff sleep and returns [`LlmError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError`] with the last classified error.
    pub async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, CompletionError> {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut transient: u32 = 0;
        let mut malformed: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CompletionError {
                    error: LlmError::Cancelled,
                    attempts,
                });
            }
            attempts += 1;
            let attempt = tokio::time::timeout(self.timeout, self.provider.chat(request));
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(attempts, "LLM call abandoned on cancellation");
                    return Err(CompletionError {
                        error: LlmError::Cancelled,
                        attempts,
                    });
                }
                result = attempt => result.unwrap_or_else(|_| {
                    Err(LlmError::Transient {
                        message: format!("LLM call timed out after {}s", self.timeout.as_secs()),
                    })
                }),
            };

            let error = match result {
                Ok(mut response) => {
                    repair_tool_call_ids(request, &mut response.tool_calls);
                    debug!(
                        provider = self.provider.name(),
                        attempts,
                        tool_calls = response.tool_calls.len(),
                        "completion succeeded"
                    );
                    return Ok(Completion {
                        response,
                        attempts,
                        latency: started.elapsed(),
                    });
                }
                Err(error) => error,
            };

            let Some(ceiling) = self.policy.ceiling(&error) else {
                warn!(kind = error.kind(), error = %error, "LLM call failed, not retrying");
                return Err(CompletionError { error, attempts });
            };
            let used = match error {
                LlmError::Malformed { .. } => {
                    malformed += 1;
                    malformed
                }
                _ => {
                    transient += 1;
                    transient
                }
            };
            if used >= ceiling {
                warn!(kind = error.kind(), attempts, error = %error, "LLM retries exhausted");
                return Err(CompletionError { error, attempts });
            }

            let delay = self.policy.backoff.delay_for_attempt(attempts - 1);
            warn!(
                kind = error.kind(),
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "LLM call failed, retrying"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(CompletionError {
                        error: LlmError::Cancelled,
                        attempts,
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Gives every call an id unique within the conversation.
///
/// Empty ids become `call_<turn>_<index>`; ids already used earlier in the
/// transcript or earlier in this turn get a numeric suffix.
pub fn repair_tool_call_ids(request: &ChatRequest, calls: &mut [ToolCall]) {
    let mut taken: HashSet<String> = request
        .messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
        .collect();
    let turn = request
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count()
        + 1;

    for (index, call) in calls.iter_mut().enumerate() {
        let base = if call.id.trim().is_empty() {
            format!("call_{turn}_{index}")
        } else {
            call.id.clone()
        };
        let mut candidate = base.clone();
        let mut suffix = 1;
        while taken.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        if candidate != call.id {
            debug!(original = %call.id, repaired = %candidate, "repaired tool call id");
            call.id.clone_from(&candidate);
        }
        taken.insert(candidate);
    }
}
