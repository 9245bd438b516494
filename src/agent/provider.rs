//! Pluggable LLM provider trait.
//!
//! Implementations translate provider-agnostic [`ChatRequest`]/[`ChatResponse`]
//! into provider-specific calls and classify every failure into an
//! [`LlmError`] kind. Retries, timeouts and tool-call id repair live one
//! layer up, in [`LlmGateway`](super::gateway::LlmGateway), so a provider
//! performs exactly one attempt per call.

use async_trait::async_trait;

use super::message::{ChatRequest, ChatResponse};
use crate::error::LlmError;

/// Trait for LLM provider backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., `"openai"`, `"anthropic"`).
    fn name(&self) -> &'static str;

    /// Executes a single chat completion attempt.
    ///
    /// # Errors
    ///
    /// Returns a classified [`LlmError`] on API failures or parse errors.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}
