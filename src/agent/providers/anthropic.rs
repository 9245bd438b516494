//! Anthropic Messages API provider over `reqwest`.
//!
//! Tool calls travel as native `tool_use` / `tool_result` content blocks.
//! Consecutive tool results are merged into one user turn because the API
//! requires strictly alternating roles.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{classify, split_reasoning};
use crate::agent::config::AgentConfig;
use crate::agent::message::{ChatMessage, ChatRequest, ChatResponse, Role, StopReason, TokenUsage};
use crate::agent::provider::LlmProvider;
use crate::agent::tool::{ToolCall, ToolDefinition};
use crate::error::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const FALLBACK_MAX_TOKENS: u32 = 4_096;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<RequestBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(default)]
    r#type: String,
}

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// Creates a new provider from agent configuration.
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn endpoint(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/messages", self.base_url)
        } else {
            format!("{}/v1/messages", self.base_url)
        }
    }

    /// Splits off the system prompt and converts the rest into alternating
    /// user/assistant turns.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system: Option<String> = None;
        let mut out: Vec<WireMessage> = Vec::new();

        for msg in messages {
            let (role, blocks) = match msg.role {
                Role::System => {
                    match &mut system {
                        Some(s) => {
                            s.push_str("\n\n");
                            s.push_str(&msg.content);
                        }
                        None => system = Some(msg.content.clone()),
                    }
                    continue;
                }
                Role::User => ("user", vec![RequestBlock::Text {
                    text: msg.content.clone(),
                }]),
                Role::Tool => ("user", vec![RequestBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                    is_error: msg.is_error,
                }]),
                Role::Assistant => {
                    let mut blocks = Vec::with_capacity(msg.tool_calls.len() + 1);
                    if !msg.content.is_empty() {
                        blocks.push(RequestBlock::Text {
                            text: msg.content.clone(),
                        });
                    }
                    blocks.extend(msg.tool_calls.iter().map(|tc| RequestBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.arguments.clone(),
                    }));
                    ("assistant", blocks)
                }
            };
            if blocks.is_empty() {
                continue;
            }
            match out.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => out.push(WireMessage {
                    role,
                    content: blocks,
                }),
            }
        }
        (system, out)
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool<'_>> {
        tools
            .iter()
            .map(|t| WireTool {
                name: &t.name,
                description: &t.description,
                input_schema: &t.parameters,
            })
            .collect()
    }

    fn build_request<'a>(request: &'a ChatRequest) -> MessagesRequest<'a> {
        let sampling = &request.sampling;
        if sampling.min_p.is_some() || sampling.reasoning_effort.is_some() {
            debug!(
                min_p = ?sampling.min_p,
                reasoning_effort = ?sampling.reasoning_effort,
                "dropping sampling knobs unsupported by the Anthropic API"
            );
        }
        let (system, messages) = Self::convert_messages(&request.messages);
        MessagesRequest {
            model: &request.model,
            max_tokens: sampling.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            system,
            messages,
            tools: Self::convert_tools(&request.tools),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
        }
    }

    fn convert_stop_reason(reason: Option<&str>) -> StopReason {
        match reason {
            Some("end_turn") | None => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            Some("stop_sequence") => StopReason::StopSequence,
            Some("refusal") => StopReason::ContentFilter,
            Some(_) => StopReason::Other,
        }
    }

    fn convert_response(body: MessagesResponse) -> ChatResponse {
        let mut text = String::new();
        let mut thinking: Vec<String> = Vec::new();
        let mut tool_calls = Vec::new();

        for block in body.content {
            match block {
                ResponseBlock::Text { text: t } => text.push_str(&t),
                ResponseBlock::ToolUse { id, name, input } => {
                    let arguments = if input.is_null() {
                        Value::Object(serde_json::Map::new())
                    } else {
                        input
                    };
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments,
                    });
                }
                ResponseBlock::Thinking { thinking: t } if !t.trim().is_empty() => {
                    thinking.push(t.trim().to_string());
                }
                ResponseBlock::Thinking { .. } | ResponseBlock::Unknown => {}
            }
        }

        let (content, inline_reasoning) = split_reasoning(&text);
        thinking.extend(inline_reasoning);
        let reasoning = if thinking.is_empty() {
            None
        } else {
            Some(thinking.join("\n\n"))
        };

        let usage = body.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens.saturating_add(u.output_tokens),
        });

        ChatResponse {
            content,
            reasoning,
            stop_reason: if tool_calls.is_empty() {
                Self::convert_stop_reason(body.stop_reason.as_deref())
            } else {
                StopReason::ToolUse
            },
            tool_calls,
            usage,
        }
    }
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = Self::build_request(request);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    LlmError::Transient {
                        message: format!("HTTP request failed: {e}"),
                    }
                } else {
                    classify(e.status().map(|s| s.as_u16()), &e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            let detail = serde_json::from_str::<ApiError>(&error_text).map_or(error_text, |api| {
                format!("{} [{}]", api.error.message, api.error.r#type)
            });
            return Err(classify(Some(status.as_u16()), &detail));
        }

        let body: MessagesResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Transient {
                    message: format!("timed out reading response: {e}"),
                }
            } else {
                LlmError::Malformed {
                    message: format!("failed to parse response: {e}"),
                }
            }
        })?;

        Ok(Self::convert_response(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::{
        SamplingConfig, assistant_tool_calls_message, system_message, tool_message, user_message,
    };
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "search".to_string(),
            arguments: json!({"q": id}),
        }
    }

    #[test]
    fn test_convert_messages_merges_tool_results() {
        let messages = vec![
            system_message("sys"),
            user_message("question"),
            assistant_tool_calls_message("thinking aloud", vec![call("a"), call("b")]),
            tool_message("a", "r1", false),
            tool_message("b", "r2", true),
        ];
        let (system, wire) = AnthropicProvider::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("sys"));
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1].role, "assistant");
        assert_eq!(wire[1].content.len(), 3);
        assert_eq!(wire[2].role, "user");
        assert_eq!(wire[2].content.len(), 2);
        assert_eq!(
            wire[2].content[1],
            RequestBlock::ToolResult {
                tool_use_id: "b".to_string(),
                content: "r2".to_string(),
                is_error: true,
            }
        );
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "claude-test".to_string(),
            messages: vec![system_message("sys"), user_message("hi")],
            tools: vec![ToolDefinition {
                name: "search".to_string(),
                description: "Web search".to_string(),
                parameters: json!({"type": "object"}),
            }],
            sampling: SamplingConfig {
                temperature: Some(0.3),
                top_k: Some(40),
                min_p: Some(0.1),
                ..SamplingConfig::default()
            },
        };
        let body = serde_json::to_value(AnthropicProvider::build_request(&request))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], FALLBACK_MAX_TOKENS);
        assert_eq!(body["top_k"], 40);
        assert!(body.get("min_p").is_none());
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn test_convert_response_with_thinking_and_tools() {
        let raw = json!({
            "content": [
                {"type": "thinking", "thinking": "plan", "signature": "x"},
                {"type": "text", "text": "Searching."},
                {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "rust"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let body: MessagesResponse =
            serde_json::from_value(raw).unwrap_or_else(|_| unreachable!());
        let response = AnthropicProvider::convert_response(body);
        assert_eq!(response.content, "Searching.");
        assert_eq!(response.reasoning.as_deref(), Some("plan"));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "toolu_1");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.total_tokens, 14);
    }

    #[test]
    fn test_unknown_block_is_ignored() {
        let raw = json!({
            "content": [{"type": "server_tool_use", "id": "s"}, {"type": "text", "text": "\\boxed{1}"}],
            "stop_reason": "end_turn"
        });
        let body: MessagesResponse =
            serde_json::from_value(raw).unwrap_or_else(|_| unreachable!());
        let response = AnthropicProvider::convert_response(body);
        assert_eq!(response.content, "\\boxed{1}");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn test_endpoint_handles_v1_suffix() {
        let config = AgentConfig::builder()
            .api_key("k")
            .provider("anthropic")
            .base_url("http://localhost:8080/v1/")
            .build()
            .unwrap_or_else(|_| unreachable!());
        let provider = AnthropicProvider::new(&config);
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/messages");
        let debug = format!("{provider:?}");
        assert!(!debug.contains("\"k\""));
        assert!(debug.contains("REDACTED"));
    }
}
