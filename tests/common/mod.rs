//! Shared mocks for integration tests.
//!
//! Each test binary uses a different subset.

#![allow(dead_code, clippy::panic)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use delve::agent::config::{AgentConfig, AgentConfigBuilder};
use delve::agent::message::{ChatRequest, ChatResponse, Role, TokenUsage};
use delve::agent::pipeline::{TaskPipeline, ToolGatewayFactory};
use delve::agent::profile::ToolServerConfig;
use delve::agent::prompt::PromptSet;
use delve::agent::provider::LlmProvider;
use delve::agent::tool::{ToolCall, ToolDefinition};
use delve::error::{AgentError, LlmError};
use delve::tools::{ToolGateway, ToolOutput};
use serde_json::{Value, json};

/// Plays back canned responses in order; once exhausted, answers
/// `\boxed{fallback}`.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ChatResponse, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap_or_else(|e| panic!("{e}"))
            .pop_front()
            .unwrap_or_else(|| Ok(text("\\boxed{fallback}")))
    }
}

type Route = dyn Fn(&ChatRequest) -> (Duration, Result<ChatResponse, LlmError>) + Send + Sync;

/// Answers each request with a function of the request, after an optional
/// delay. Records the label of each finished request.
pub struct RoutedProvider {
    route: Box<Route>,
    started: AtomicUsize,
    finished: Mutex<Vec<String>>,
}

impl RoutedProvider {
    pub fn new<F>(route: F) -> Arc<Self>
    where
        F: Fn(&ChatRequest) -> (Duration, Result<ChatResponse, LlmError>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            route: Box::new(route),
            started: AtomicUsize::new(0),
            finished: Mutex::new(Vec::new()),
        })
    }

    /// Requests received, finished or not.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Final user message of every completed request, in completion order.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap_or_else(|e| panic!("{e}")).clone()
    }
}

#[async_trait]
impl LlmProvider for RoutedProvider {
    fn name(&self) -> &'static str {
        "routed"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let (delay, reply) = (self.route)(request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.finished
            .lock()
            .unwrap_or_else(|e| panic!("{e}"))
            .push(last_user_text(request).to_string());
        reply
    }
}

/// Content of the last user message of a request.
pub fn last_user_text(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map_or("", |m| m.content.as_str())
}

/// Whether the request comes from an agent that may delegate.
pub fn can_delegate(request: &ChatRequest) -> bool {
    request.tools.iter().any(|t| t.name.starts_with("agent_"))
}

/// Behavior of [`MockTools::invoke`].
#[derive(Debug, Clone, Copy)]
pub enum ToolMode {
    /// Returns the `text` argument.
    Echo,
    /// Returns an error output.
    Fail,
    /// Panics.
    Panic,
    /// Sleeps, then echoes.
    Slow(Duration),
}

/// Single-tool gateway named `echo`.
pub struct MockTools {
    mode: ToolMode,
    invocations: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl MockTools {
    pub fn new(mode: ToolMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            invocations: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolGateway for MockTools {
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        vec![echo_definition()]
    }

    async fn invoke(&self, _name: &str, arguments: &Value) -> ToolOutput {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let echo = arguments["text"].as_str().unwrap_or_default().to_string();
        match self.mode {
            ToolMode::Echo => ToolOutput::ok(echo),
            ToolMode::Fail => ToolOutput::error("backend unavailable"),
            ToolMode::Panic => panic!("tool backend exploded"),
            ToolMode::Slow(delay) => {
                tokio::time::sleep(delay).await;
                ToolOutput::ok(echo)
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands every task the same gateway.
pub struct StaticToolFactory(pub Arc<MockTools>);

#[async_trait]
impl ToolGatewayFactory for StaticToolFactory {
    async fn open(&self, _servers: &[ToolServerConfig]) -> Result<Arc<dyn ToolGateway>, AgentError> {
        let tools: Arc<dyn ToolGateway> = Arc::clone(&self.0) as Arc<dyn ToolGateway>;
        Ok(tools)
    }
}

pub fn echo_definition() -> ToolDefinition {
    ToolDefinition {
        name: "echo".to_string(),
        description: "Echoes the `text` argument.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }),
    }
}

/// Final text response.
pub fn text(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        usage: TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
        },
        ..ChatResponse::default()
    }
}

/// Response requesting the given calls.
pub fn with_calls(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        tool_calls: calls,
        ..text("")
    }
}

/// `n` echo calls with ids `e0..`.
pub fn echo_calls(n: usize) -> ChatResponse {
    with_calls(
        (0..n)
            .map(|i| ToolCall {
                id: format!("e{i}"),
                name: "echo".to_string(),
                arguments: json!({"text": format!("r{i}")}),
            })
            .collect(),
    )
}

/// A delegation to the built-in `researcher` template.
pub fn delegation(id: &str, task: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: "agent_researcher".to_string(),
        arguments: json!({"task_description": task}),
    }
}

/// Builder with an API key and millisecond backoff.
pub fn builder() -> AgentConfigBuilder {
    AgentConfig::builder()
        .api_key("test-key")
        .retry_delays(Duration::from_millis(1), Duration::from_millis(4))
        .tool_timeout(Duration::from_secs(5))
}

pub fn config() -> AgentConfig {
    build(builder())
}

pub fn build(builder: AgentConfigBuilder) -> AgentConfig {
    builder.build().unwrap_or_else(|e| panic!("{e}"))
}

/// Pipeline over the given provider and tools, with compiled-in prompts.
pub fn pipeline(
    config: AgentConfig,
    provider: Arc<dyn LlmProvider>,
    tools: &Arc<MockTools>,
) -> TaskPipeline {
    TaskPipeline::new(config, provider)
        .with_prompts(PromptSet::defaults())
        .with_tool_factory(Arc::new(StaticToolFactory(Arc::clone(tools))))
}
