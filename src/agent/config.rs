//! Agent configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.
//! The resulting [`AgentConfig`] is immutable and threaded through every
//! constructor; nothing else in the crate reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::message::SamplingConfig;
use crate::error::AgentError;

/// Default per-call LLM timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Default per-call tool timeout in seconds.
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;
/// Default attempts for transient LLM failures.
const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default attempts for malformed LLM responses.
const DEFAULT_MAX_MALFORMED_RETRIES: u32 = 2;
/// Default base delay for exponential backoff in milliseconds.
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
/// Default backoff ceiling in milliseconds.
const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
/// Default turn cap for the main agent.
const DEFAULT_MAX_TURNS: usize = 30;
/// Default tool calls executed per assistant turn.
const DEFAULT_MAX_TOOL_CALLS_PER_TURN: usize = 10;
/// Default delegation nesting (main agent may delegate, sub-agents may not).
const DEFAULT_MAX_DELEGATION_DEPTH: usize = 1;
/// Default final-summary prompts before accepting an unboxed answer.
const DEFAULT_MAX_FINAL_ANSWER_PROMPTS: usize = 1;
/// Default concurrent tasks in batch mode.
const DEFAULT_MAX_CONCURRENCY: usize = 4;
/// Default trace channel capacity.
const DEFAULT_TRACE_CAPACITY: usize = 1_024;
/// Default max tokens per completion.
const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// Default `OpenAI` model.
const DEFAULT_OPENAI_MODEL: &str = "gpt-5.2-2025-12-11";
/// Default Anthropic model.
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

/// How tool calls are exchanged with the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallEncoding {
    /// Structured function-calling fields of the provider API.
    #[default]
    Native,
    /// `<tool_call>{...}</tool_call>` tags in plain text.
    Inline,
}

impl ToolCallEncoding {
    /// Parses an encoding name (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] for unknown names.
    pub fn parse(s: &str) -> Result<Self, AgentError> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "inline" | "text" => Ok(Self::Inline),
            other => Err(AgentError::Config {
                message: format!("unknown tool call encoding: {other} (expected native|inline)"),
            }),
        }
    }
}

/// Parses a turn cap: a non-negative integer, `-1` or `unlimited`.
///
/// `None` means unlimited.
///
/// # Errors
///
/// Returns [`AgentError::Config`] for anything else.
pub fn parse_max_turns(s: &str) -> Result<Option<usize>, AgentError> {
    let s = s.trim();
    if s == "-1" || s.eq_ignore_ascii_case("unlimited") || s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    s.parse::<usize>().map(Some).map_err(|_| AgentError::Config {
        message: format!("invalid max_turns: {s} (expected integer, -1 or \"unlimited\")"),
    })
}

/// Configuration for the agent runtime.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// LLM provider name (`openai` or `anthropic`).
    pub provider: String,
    /// API key for the provider.
    pub api_key: String,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Default model for agents whose template names none.
    pub model: String,
    /// Model for input augmentation and answer extraction.
    pub aux_model: String,
    /// Tool-call wire encoding.
    pub tool_call_encoding: ToolCallEncoding,
    /// Sampling defaults, overridden per template.
    pub sampling: SamplingConfig,
    /// Per-call LLM timeout.
    pub timeout: Duration,
    /// Per-call tool timeout.
    pub tool_timeout: Duration,
    /// Maximum attempts per LLM call for transient failures.
    pub max_retries: u32,
    /// Maximum attempts per LLM call for malformed responses.
    pub max_malformed_retries: u32,
    /// Base backoff delay.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Turn cap for agents whose template sets none. `None` is unlimited.
    pub max_turns: Option<usize>,
    /// Tool calls executed per assistant turn; the rest get budget errors.
    pub max_tool_calls_per_turn: usize,
    /// Maximum delegation nesting depth.
    pub max_delegation_depth: usize,
    /// Run multiple delegations of one turn concurrently.
    pub parallel_delegation: bool,
    /// Final-summary prompts before an unboxed answer is accepted.
    pub max_final_answer_prompts: usize,
    /// Wall-clock budget per task, checked between turns.
    pub task_deadline: Option<Duration>,
    /// Concurrent tasks in batch mode.
    pub max_concurrency: usize,
    /// Directory containing prompt template files.
    pub prompt_dir: Option<PathBuf>,
    /// Working language for agent output, if any.
    pub language: Option<String>,
    /// Run the auxiliary input-augmentation call before the main agent.
    pub input_augmentation: bool,
    /// Run the auxiliary answer-extraction call after the main agent.
    pub output_extraction: bool,
    /// Capacity of the trace event channel.
    pub trace_capacity: usize,
}

impl AgentConfig {
    /// Creates a new builder for `AgentConfig`.
    #[must_use]
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ApiKeyMissing`] if no API key is found.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::builder().from_env().build()
    }
}

/// Builder for [`AgentConfig`].
#[derive(Debug, Clone, Default)]
pub struct AgentConfigBuilder {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    aux_model: Option<String>,
    tool_call_encoding: Option<ToolCallEncoding>,
    sampling: Option<SamplingConfig>,
    timeout: Option<Duration>,
    tool_timeout: Option<Duration>,
    max_retries: Option<u32>,
    max_malformed_retries: Option<u32>,
    retry_base_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
    max_turns: Option<Option<usize>>,
    max_tool_calls_per_turn: Option<usize>,
    max_delegation_depth: Option<usize>,
    parallel_delegation: Option<bool>,
    max_final_answer_prompts: Option<usize>,
    task_deadline: Option<Duration>,
    max_concurrency: Option<usize>,
    prompt_dir: Option<PathBuf>,
    language: Option<String>,
    input_augmentation: Option<bool>,
    output_extraction: Option<bool>,
    trace_capacity: Option<usize>,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_var(key).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl AgentConfigBuilder {
    /// Populates unset fields from environment variables.
    ///
    /// The provider is resolved first so the matching API key variable
    /// (`OPENAI_API_KEY` or `ANTHROPIC_API_KEY`) is preferred over
    /// `DELVE_API_KEY`. Unparseable values are ignored.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.provider.is_none() {
            self.provider = env_var("DELVE_PROVIDER");
        }
        let anthropic = self
            .provider
            .as_deref()
            .is_some_and(|p| p.trim().eq_ignore_ascii_case("anthropic"));
        if self.api_key.is_none() {
            let vendor_key = if anthropic {
                "ANTHROPIC_API_KEY"
            } else {
                "OPENAI_API_KEY"
            };
            self.api_key = env_var(vendor_key).or_else(|| env_var("DELVE_API_KEY"));
        }
        if self.base_url.is_none() {
            let vendor_url = if anthropic {
                "ANTHROPIC_BASE_URL"
            } else {
                "OPENAI_BASE_URL"
            };
            self.base_url = env_var(vendor_url).or_else(|| env_var("DELVE_BASE_URL"));
        }
        if self.model.is_none() {
            self.model = env_var("DELVE_MODEL");
        }
        if self.aux_model.is_none() {
            self.aux_model = env_var("DELVE_AUX_MODEL");
        }
        if self.tool_call_encoding.is_none() {
            self.tool_call_encoding = env_var("DELVE_TOOL_CALL_ENCODING")
                .and_then(|v| ToolCallEncoding::parse(&v).ok());
        }
        if self.timeout.is_none() {
            self.timeout = env_parse("DELVE_TIMEOUT_SECS").map(Duration::from_secs);
        }
        if self.tool_timeout.is_none() {
            self.tool_timeout = env_parse("DELVE_TOOL_TIMEOUT_SECS").map(Duration::from_secs);
        }
        if self.max_retries.is_none() {
            self.max_retries = env_parse("DELVE_MAX_RETRIES");
        }
        if self.max_turns.is_none() {
            self.max_turns = env_var("DELVE_MAX_TURNS").and_then(|v| parse_max_turns(&v).ok());
        }
        if self.max_tool_calls_per_turn.is_none() {
            self.max_tool_calls_per_turn = env_parse("DELVE_MAX_TOOL_CALLS_PER_TURN");
        }
        if self.max_delegation_depth.is_none() {
            self.max_delegation_depth = env_parse("DELVE_MAX_DELEGATION_DEPTH");
        }
        if self.parallel_delegation.is_none() {
            self.parallel_delegation = env_flag("DELVE_PARALLEL_DELEGATION");
        }
        if self.task_deadline.is_none() {
            self.task_deadline = env_parse("DELVE_TASK_DEADLINE_SECS").map(Duration::from_secs);
        }
        if self.max_concurrency.is_none() {
            self.max_concurrency = env_parse("DELVE_MAX_CONCURRENCY");
        }
        if self.prompt_dir.is_none() {
            self.prompt_dir = env_var("DELVE_PROMPT_DIR").map(PathBuf::from);
        }
        if self.language.is_none() {
            self.language = env_var("DELVE_LANGUAGE");
        }
        if self.input_augmentation.is_none() {
            self.input_augmentation = env_flag("DELVE_INPUT_AUGMENTATION");
        }
        if self.output_extraction.is_none() {
            self.output_extraction = env_flag("DELVE_OUTPUT_EXTRACTION");
        }
        self
    }

    /// Sets the LLM provider name.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the default model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the auxiliary model.
    #[must_use]
    pub fn aux_model(mut self, model: impl Into<String>) -> Self {
        self.aux_model = Some(model.into());
        self
    }

    /// Sets the tool-call encoding.
    #[must_use]
    pub const fn tool_call_encoding(mut self, encoding: ToolCallEncoding) -> Self {
        self.tool_call_encoding = Some(encoding);
        self
    }

    /// Sets default sampling parameters.
    #[must_use]
    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = Some(sampling);
        self
    }

    /// Sets the per-call LLM timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Sets the per-call tool timeout.
    #[must_use]
    pub const fn tool_timeout(mut self, duration: Duration) -> Self {
        self.tool_timeout = Some(duration);
        self
    }

    /// Sets the attempts for transient failures.
    #[must_use]
    pub const fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Sets the attempts for malformed responses.
    #[must_use]
    pub const fn max_malformed_retries(mut self, n: u32) -> Self {
        self.max_malformed_retries = Some(n);
        self
    }

    /// Sets the backoff base delay and ceiling.
    #[must_use]
    pub const fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = Some(base);
        self.retry_max_delay = Some(max);
        self
    }

    /// Sets the default turn cap. `None` is unlimited.
    #[must_use]
    pub const fn max_turns(mut self, n: Option<usize>) -> Self {
        self.max_turns = Some(n);
        self
    }

    /// Sets the per-turn tool-call budget.
    #[must_use]
    pub const fn max_tool_calls_per_turn(mut self, n: usize) -> Self {
        self.max_tool_calls_per_turn = Some(n);
        self
    }

    /// Sets the maximum delegation depth.
    #[must_use]
    pub const fn max_delegation_depth(mut self, n: usize) -> Self {
        self.max_delegation_depth = Some(n);
        self
    }

    /// Enables or disables concurrent delegation.
    #[must_use]
    pub const fn parallel_delegation(mut self, enabled: bool) -> Self {
        self.parallel_delegation = Some(enabled);
        self
    }

    /// Sets the number of final-summary prompts.
    #[must_use]
    pub const fn max_final_answer_prompts(mut self, n: usize) -> Self {
        self.max_final_answer_prompts = Some(n);
        self
    }

    /// Sets the per-task deadline.
    #[must_use]
    pub const fn task_deadline(mut self, deadline: Duration) -> Self {
        self.task_deadline = Some(deadline);
        self
    }

    /// Sets the batch concurrency.
    #[must_use]
    pub const fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Sets the prompt template directory.
    #[must_use]
    pub fn prompt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompt_dir = Some(dir.into());
        self
    }

    /// Sets the working language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Enables or disables input augmentation.
    #[must_use]
    pub const fn input_augmentation(mut self, enabled: bool) -> Self {
        self.input_augmentation = Some(enabled);
        self
    }

    /// Enables or disables answer extraction.
    #[must_use]
    pub const fn output_extraction(mut self, enabled: bool) -> Self {
        self.output_extraction = Some(enabled);
        self
    }

    /// Sets the trace channel capacity.
    #[must_use]
    pub const fn trace_capacity(mut self, n: usize) -> Self {
        self.trace_capacity = Some(n);
        self
    }

    /// Builds the [`AgentConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ApiKeyMissing`] if no API key was set, or
    /// [`AgentError::Config`] for zero-valued limits that would stall a run.
    pub fn build(self) -> Result<AgentConfig, AgentError> {
        let api_key = self.api_key.ok_or(AgentError::ApiKeyMissing)?;
        let provider = self
            .provider
            .map_or_else(|| "openai".to_string(), |p| p.trim().to_ascii_lowercase());

        let max_tool_calls_per_turn = self
            .max_tool_calls_per_turn
            .unwrap_or(DEFAULT_MAX_TOOL_CALLS_PER_TURN);
        if max_tool_calls_per_turn == 0 {
            return Err(AgentError::Config {
                message: "max_tool_calls_per_turn must be at least 1".to_string(),
            });
        }
        let max_concurrency = self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(AgentError::Config {
                message: "max_concurrency must be at least 1".to_string(),
            });
        }

        let model = self.model.unwrap_or_else(|| {
            if provider == "anthropic" {
                DEFAULT_ANTHROPIC_MODEL.to_string()
            } else {
                DEFAULT_OPENAI_MODEL.to_string()
            }
        });
        let default_sampling = SamplingConfig {
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            ..SamplingConfig::default()
        };

        Ok(AgentConfig {
            provider,
            api_key,
            base_url: self.base_url,
            aux_model: self.aux_model.unwrap_or_else(|| model.clone()),
            model,
            tool_call_encoding: self.tool_call_encoding.unwrap_or_default(),
            sampling: self
                .sampling
                .map_or_else(|| default_sampling.clone(), |s| s.or(&default_sampling)),
            timeout: self
                .timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            tool_timeout: self
                .tool_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS)),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            max_malformed_retries: self
                .max_malformed_retries
                .unwrap_or(DEFAULT_MAX_MALFORMED_RETRIES)
                .max(1),
            retry_base_delay: self
                .retry_base_delay
                .unwrap_or(Duration::from_millis(DEFAULT_RETRY_BASE_MS)),
            retry_max_delay: self
                .retry_max_delay
                .unwrap_or(Duration::from_millis(DEFAULT_RETRY_MAX_MS)),
            max_turns: self.max_turns.unwrap_or(Some(DEFAULT_MAX_TURNS)),
            max_tool_calls_per_turn,
            max_delegation_depth: self
                .max_delegation_depth
                .unwrap_or(DEFAULT_MAX_DELEGATION_DEPTH),
            parallel_delegation: self.parallel_delegation.unwrap_or(true),
            max_final_answer_prompts: self
                .max_final_answer_prompts
                .unwrap_or(DEFAULT_MAX_FINAL_ANSWER_PROMPTS),
            task_deadline: self.task_deadline,
            max_concurrency,
            prompt_dir: self.prompt_dir,
            language: self.language,
            input_augmentation: self.input_augmentation.unwrap_or(false),
            output_extraction: self.output_extraction.unwrap_or(false),
            trace_capacity: self
                .trace_capacity
                .unwrap_or(DEFAULT_TRACE_CAPACITY)
                .max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_builder_defaults() {
        let config = AgentConfig::builder()
            .api_key("test-key")
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.provider, "openai");
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(config.aux_model, config.model);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.max_malformed_retries, DEFAULT_MAX_MALFORMED_RETRIES);
        assert_eq!(config.max_tool_calls_per_turn, 10);
        assert_eq!(config.max_delegation_depth, 1);
        assert_eq!(config.max_final_answer_prompts, 1);
        assert!(config.parallel_delegation);
        assert_eq!(config.max_turns, Some(DEFAULT_MAX_TURNS));
        assert_eq!(config.tool_call_encoding, ToolCallEncoding::Native);
        assert_eq!(config.sampling.max_tokens, Some(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn test_builder_missing_api_key() {
        let result = AgentConfig::builder().build();
        assert!(matches!(result, Err(AgentError::ApiKeyMissing)));
    }

    #[test]
    fn test_builder_custom_values() {
        let config = AgentConfig::builder()
            .api_key("key")
            .provider("anthropic")
            .max_turns(None)
            .max_tool_calls_per_turn(3)
            .parallel_delegation(false)
            .tool_call_encoding(ToolCallEncoding::Inline)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.provider, "anthropic");
        assert_eq!(config.model, DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(config.max_turns, None);
        assert_eq!(config.max_tool_calls_per_turn, 3);
        assert!(!config.parallel_delegation);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test_case("Anthropic"; "title case")]
    #[test_case("ANTHROPIC"; "upper case")]
    #[test_case(" anthropic "; "padded")]
    fn test_provider_name_is_case_insensitive(name: &str) {
        let config = AgentConfig::builder()
            .api_key("key")
            .provider(name)
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.provider, "anthropic");
        assert_eq!(config.model, DEFAULT_ANTHROPIC_MODEL);
    }

    #[test]
    fn test_builder_rejects_zero_budget() {
        let result = AgentConfig::builder()
            .api_key("key")
            .max_tool_calls_per_turn(0)
            .build();
        assert!(matches!(result, Err(AgentError::Config { .. })));
    }

    #[test_case("12", Some(12); "integer")]
    #[test_case("0", Some(0); "zero")]
    #[test_case("-1", None; "minus one")]
    #[test_case("unlimited", None; "keyword")]
    #[test_case(" Unlimited ", None; "keyword mixed case")]
    fn test_parse_max_turns(input: &str, expected: Option<usize>) {
        assert_eq!(
            parse_max_turns(input).unwrap_or_else(|_| unreachable!()),
            expected
        );
    }

    #[test]
    fn test_parse_max_turns_invalid() {
        assert!(parse_max_turns("-5").is_err());
        assert!(parse_max_turns("lots").is_err());
    }

    #[test]
    fn test_tool_call_encoding_parse() {
        assert_eq!(
            ToolCallEncoding::parse("Inline").ok(),
            Some(ToolCallEncoding::Inline)
        );
        assert!(ToolCallEncoding::parse("xml").is_err());
    }
}
