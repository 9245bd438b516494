//! `OpenAI` provider implementation using the `async-openai` crate.
//!
//! Supports any `OpenAI`-compatible API (`OpenAI`, Azure, vLLM, SGLang,
//! local proxies) via the base URL override in [`AgentConfig`]. With
//! [`ToolCallEncoding::Inline`] the transcript is rewritten by the
//! [`inline`](super::inline) codec and tool calls are parsed from text.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestAssistantMessageContent, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestSystemMessageContent,
    ChatCompletionRequestToolMessage, ChatCompletionRequestToolMessageContent,
    ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageContent, ChatCompletionTool,
    ChatCompletionToolType, CreateChatCompletionRequest, FinishReason, FunctionCall,
    FunctionObject, ReasoningEffort,
};
use async_trait::async_trait;
use tracing::debug;

use super::{classify, inline, parse_arguments, split_reasoning};
use crate::agent::config::{AgentConfig, ToolCallEncoding};
use crate::agent::message::{ChatMessage, ChatRequest, ChatResponse, Role, StopReason, TokenUsage};
use crate::agent::provider::LlmProvider;
use crate::agent::tool::ToolCall;
use crate::error::LlmError;

/// `OpenAI`-compatible LLM provider.
///
/// Wraps the `async-openai` client for chat completions. Compatible
/// with any API that follows the `OpenAI` chat completion spec.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    encoding: ToolCallEncoding,
}

impl OpenAiProvider {
    /// Creates a new provider from agent configuration.
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(&config.api_key);

        if let Some(ref base_url) = config.base_url {
            openai_config = openai_config.with_api_base(base_url);
        }

        let mut client = Client::with_config(openai_config);
        if let Ok(http) = reqwest::Client::builder().timeout(config.timeout).build() {
            client = client.with_http_client(http);
        }

        Self {
            client,
            encoding: config.tool_call_encoding,
        }
    }

    /// Converts our message type to the `OpenAI` SDK type.
    fn convert_message(msg: &ChatMessage) -> ChatCompletionRequestMessage {
        match msg.role {
            Role::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(msg.content.clone()),
                    name: None,
                })
            }
            Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(msg.content.clone()),
                name: None,
            }),
            Role::Assistant => {
                let tool_calls = if msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        msg.tool_calls
                            .iter()
                            .map(|tc| ChatCompletionMessageToolCall {
                                id: tc.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.to_string(),
                                },
                            })
                            .collect(),
                    )
                };

                let content = if msg.content.is_empty() {
                    None
                } else {
                    Some(ChatCompletionRequestAssistantMessageContent::Text(
                        msg.content.clone(),
                    ))
                };

                #[allow(deprecated)]
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content,
                    name: None,
                    tool_calls,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
            Role::Tool => ChatCompletionRequestMessage::Tool(ChatCompletionRequestToolMessage {
                content: ChatCompletionRequestToolMessageContent::Text(msg.content.clone()),
                tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            }),
        }
    }

    /// Builds an `OpenAI` chat completion request from our generic request.
    fn build_request(&self, request: &ChatRequest) -> CreateChatCompletionRequest {
        let (messages, tools) = match self.encoding {
            ToolCallEncoding::Native => {
                let messages: Vec<_> = request.messages.iter().map(Self::convert_message).collect();
                let tools = if request.tools.is_empty() {
                    None
                } else {
                    Some(
                        request
                            .tools
                            .iter()
                            .map(|td| ChatCompletionTool {
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionObject {
                                    name: td.name.clone(),
                                    description: Some(td.description.clone()),
                                    parameters: Some(td.parameters.clone()),
                                    strict: None,
                                },
                            })
                            .collect(),
                    )
                };
                (messages, tools)
            }
            ToolCallEncoding::Inline => {
                let encoded = inline::encode_messages(&request.messages, &request.tools);
                (encoded.iter().map(Self::convert_message).collect(), None)
            }
        };

        let sampling = &request.sampling;
        if sampling.top_k.is_some() || sampling.min_p.is_some() {
            debug!(
                top_k = ?sampling.top_k,
                min_p = ?sampling.min_p,
                "dropping sampling knobs unsupported by the OpenAI API"
            );
        }

        let reasoning_effort = sampling
            .reasoning_effort
            .as_deref()
            .and_then(|e| match e.to_lowercase().as_str() {
                "low" => Some(ReasoningEffort::Low),
                "medium" => Some(ReasoningEffort::Medium),
                "high" => Some(ReasoningEffort::High),
                other => {
                    debug!(effort = other, "ignoring unknown reasoning effort");
                    None
                }
            });

        CreateChatCompletionRequest {
            model: request.model.clone(),
            messages,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_completion_tokens: sampling.max_tokens,
            reasoning_effort,
            tools,
            ..Default::default()
        }
    }

    /// Maps an SDK error to a classified [`LlmError`].
    fn classify_error(err: &OpenAIError) -> LlmError {
        match err {
            OpenAIError::Reqwest(e) => {
                if e.is_timeout() || e.is_connect() {
                    LlmError::Transient {
                        message: e.to_string(),
                    }
                } else {
                    classify(e.status().map(|s| s.as_u16()), &e.to_string())
                }
            }
            OpenAIError::ApiError(api) => {
                let code = api.code.as_ref().map(ToString::to_string).unwrap_or_default();
                let kind = api.r#type.as_ref().map(ToString::to_string).unwrap_or_default();
                classify(None, &format!("{} [{kind}] [{code}]", api.message))
            }
            OpenAIError::JSONDeserialize(e) => LlmError::Malformed {
                message: format!("unparseable response: {e}"),
            },
            OpenAIError::InvalidArgument(msg) => LlmError::Fatal {
                message: msg.clone(),
            },
            other => classify(None, &other.to_string()),
        }
    }

    fn convert_stop_reason(reason: Option<&FinishReason>) -> StopReason {
        match reason {
            Some(FinishReason::Stop) | None => StopReason::EndTurn,
            Some(FinishReason::Length) => StopReason::MaxTokens,
            Some(FinishReason::ToolCalls | FinishReason::FunctionCall) => StopReason::ToolUse,
            Some(FinishReason::ContentFilter) => StopReason::ContentFilter,
        }
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<async-openai::Client>")
            .field("encoding", &self.encoding)
            .finish()
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let openai_request = self.build_request(request);

        let response = self
            .client
            .chat()
            .create(openai_request)
            .await
            .map_err(|e| Self::classify_error(&e))?;

        let choice = response.choices.first().ok_or_else(|| LlmError::Malformed {
            message: "response contained no choices".to_string(),
        })?;

        let raw = choice.message.content.clone().unwrap_or_default();
        let (text, reasoning) = split_reasoning(&raw);

        let mut tool_calls = Vec::new();
        if let Some(native) = &choice.message.tool_calls {
            for tc in native {
                tool_calls.push(ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: parse_arguments(&tc.function.name, &tc.function.arguments)?,
                });
            }
        }

        let content = if self.encoding == ToolCallEncoding::Inline {
            let (rest, parsed) = inline::parse_tool_calls(&text)?;
            tool_calls.extend(parsed);
            rest
        } else {
            text
        };

        let mut stop_reason = Self::convert_stop_reason(choice.finish_reason.as_ref());
        if !tool_calls.is_empty() {
            stop_reason = StopReason::ToolUse;
        }

        let usage = response
            .usage
            .map_or_else(TokenUsage::default, |u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });

        Ok(ChatResponse {
            content,
            reasoning,
            tool_calls,
            stop_reason,
            usage,
        })
    }
}
