//! Per-agent turn loop.
//!
//! An [`AgentOrchestrator`] owns one conversation and drives it to a
//! terminal state: call the model, execute requested tools (delegating to
//! sub-agents where asked), append the results, repeat. Limits, deadlines
//! and cancellation are checked at every turn boundary.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use super::config::AgentConfig;
use super::conversation::Conversation;
use super::delegation::{self, Delegated};
use super::gateway::LlmGateway;
use super::message::{ChatRequest, SamplingConfig, TokenUsage};
use super::profile::{AgentTemplate, AnswerFormat, Profile};
use super::prompt::{PromptSet, build_system_prompt};
use super::tool::{ToolCall, ToolDefinition, ToolResult, ToolSet, delegation_tool, is_delegation};
use super::trace::{TraceKind, Tracer};
use crate::core::answer::{best_effort_answer, extract_boxed};
use crate::error::LlmError;
use crate::tools::ToolGateway;

/// Largest serialized argument object forwarded to a tool backend.
pub const MAX_TOOL_ARGUMENT_BYTES: usize = 256 * 1024;

/// Lifecycle status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still executing.
    Running,
    /// Produced a final answer.
    Completed,
    /// Stopped on an error.
    Failed,
    /// Ran out of turns or time.
    TurnLimitExceeded,
}

impl RunStatus {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TurnLimitExceeded => "turn_limit_exceeded",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The prompt outgrew the model's context window.
    ContextLimitExceeded,
    /// Transient or malformed LLM failures outlasted the retry policy.
    RetriesExhausted,
    /// Unrecoverable provider or runtime error.
    Fatal,
    /// The operator cancelled the run.
    Cancelled,
}

impl FailureReason {
    /// Maps a classified LLM error that ended a run.
    #[must_use]
    pub const fn from_llm(error: &LlmError) -> Self {
        match error {
            LlmError::ContextLimitExceeded { .. } => Self::ContextLimitExceeded,
            LlmError::Fatal { .. } => Self::Fatal,
            LlmError::Cancelled => Self::Cancelled,
            LlmError::Transient { .. } | LlmError::Malformed { .. } => Self::RetriesExhausted,
        }
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ContextLimitExceeded => "context_limit_exceeded",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which limit ended a [`RunStatus::TurnLimitExceeded`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// The turn cap.
    Turns,
    /// The task deadline.
    Deadline,
}

impl LimitKind {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Turns => "turns",
            Self::Deadline => "deadline",
        }
    }
}

/// A sub-agent run, keyed by the tool call that started it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedRun {
    /// Delegation call id in the parent's transcript.
    pub tool_call_id: String,
    /// The child's run.
    pub run: AgentRun,
}

/// Record of one agent's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    /// `main` or the sub-agent template name.
    pub agent_kind: String,
    /// Delegation depth (0 for the main agent).
    pub depth: usize,
    /// LLM calls made.
    pub turn_count: usize,
    /// Terminal status.
    pub status: RunStatus,
    /// Failure reason when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Limit that fired when `status` is `turn_limit_exceeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitKind>,
    /// Error description for non-completed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final (or best-effort) answer.
    #[serde(default)]
    pub final_answer: Option<String>,
    /// Full transcript.
    pub conversation: Conversation,
    /// Token usage summed over every LLM call of this agent.
    pub usage: TokenUsage,
    /// Runs of delegated sub-agents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_runs: Vec<DelegatedRun>,
}

impl AgentRun {
    /// A run that failed before its loop started.
    #[must_use]
    pub fn aborted(agent_kind: &str, reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            agent_kind: agent_kind.to_string(),
            depth: 0,
            turn_count: 0,
            status: RunStatus::Failed,
            failure: Some(reason),
            limit: None,
            error: Some(error.into()),
            final_answer: None,
            conversation: Conversation::default(),
            usage: TokenUsage::default(),
            sub_runs: Vec::new(),
        }
    }

    /// Usage of this run and every nested sub-run.
    #[must_use]
    pub fn total_usage(&self) -> TokenUsage {
        let mut usage = self.usage;
        for sub in &self.sub_runs {
            usage.add(&sub.run.total_usage());
        }
        usage
    }
}

/// Shared handles every agent of one task runs with.
#[derive(Clone)]
pub struct RunContext {
    /// Immutable runtime configuration.
    pub config: Arc<AgentConfig>,
    /// Templates and tool servers.
    pub profile: Arc<Profile>,
    /// Prompt templates.
    pub prompts: Arc<PromptSet>,
    /// LLM access.
    pub llm: LlmGateway,
    /// Tool backend access.
    pub tools: Arc<dyn ToolGateway>,
    /// Every backend tool of the task's session.
    pub backend_tools: Arc<ToolSet>,
    /// Cancelled on operator interrupt.
    pub cancel: CancellationToken,
    /// Task deadline, checked between turns.
    pub deadline: Option<tokio::time::Instant>,
    /// Trace side channel.
    pub tracer: Tracer,
}

impl RunContext {
    /// Creates a context with no deadline, a fresh cancellation token and
    /// tracing disabled.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        profile: Arc<Profile>,
        prompts: Arc<PromptSet>,
        llm: LlmGateway,
        tools: Arc<dyn ToolGateway>,
        backend_tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            config,
            profile,
            prompts,
            llm,
            tools,
            backend_tools: Arc::new(ToolSet::from_definitions(backend_tools)),
            cancel: CancellationToken::new(),
            deadline: None,
            tracer: Tracer::disabled(),
        }
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Option<tokio::time::Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the tracer.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("llm", &self.llm)
            .field("backend_tools", &self.backend_tools.names())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// How a run ended, before it is folded into an [`AgentRun`].
enum Ending {
    Completed(String),
    Failed(FailureReason, String),
    Limit(LimitKind, String),
}

/// A tool call slot, resolved in issue order.
enum Slot {
    Ready(ToolResult),
    Spawned(AbortOnDropHandle<Delegated>, Instant),
    Delegate,
    Backend,
}

/// Turn-loop state machine for one agent.
pub struct AgentOrchestrator {
    ctx: RunContext,
    agent_kind: String,
    depth: usize,
    answer_format: AnswerFormat,
    model: String,
    sampling: SamplingConfig,
    max_turns: Option<usize>,
    tools: ToolSet,
    conversation: Conversation,
    tracer: Tracer,
    turn_count: usize,
    usage: TokenUsage,
    sub_runs: Vec<DelegatedRun>,
}

impl AgentOrchestrator {
    /// Builds an agent from a template.
    ///
    /// The tool set is the backend tools the template allows plus one
    /// `agent_<name>` tool per reachable sub-agent, as long as `depth` is
    /// below the delegation cap.
    #[must_use]
    pub fn new(ctx: RunContext, template: &AgentTemplate, depth: usize, is_main: bool) -> Self {
        let mut tools = ctx.backend_tools.restrict(template.tools.as_deref());
        if depth < ctx.config.max_delegation_depth {
            for sub in ctx.profile.delegates_of(template) {
                tools.push(delegation_tool(&sub.name, &sub.description));
            }
        }

        let base_prompt = template.prompt.as_deref().unwrap_or(if is_main {
            &ctx.prompts.main
        } else {
            &ctx.prompts.sub_agent
        });
        let system_prompt = build_system_prompt(
            base_prompt,
            tools.definitions(),
            ctx.config.language.as_deref(),
        );

        let agent_kind = if is_main {
            "main".to_string()
        } else {
            template.name.clone()
        };

        Self {
            tracer: ctx.tracer.for_agent(&agent_kind, depth),
            agent_kind,
            depth,
            answer_format: template.answer_format(is_main),
            model: template
                .model
                .clone()
                .unwrap_or_else(|| ctx.config.model.clone()),
            sampling: template.sampling.clone().or(&ctx.config.sampling),
            max_turns: template.max_turns.unwrap_or(ctx.config.max_turns),
            tools,
            conversation: Conversation::new(&system_prompt),
            turn_count: 0,
            usage: TokenUsage::default(),
            sub_runs: Vec::new(),
            ctx,
        }
    }

    /// Tool signatures this agent is offered.
    #[must_use]
    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Runs the agent on `instruction` until it reaches a terminal state.
    pub fn run(self, instruction: String) -> BoxFuture<'static, AgentRun> {
        Box::pin(self.run_loop(instruction))
    }

    async fn run_loop(mut self, instruction: String) -> AgentRun {
        self.conversation.push_user(&instruction);
        info!(
            agent = %self.agent_kind,
            depth = self.depth,
            model = %self.model,
            tools = self.tools.len(),
            "agent started"
        );

        let mut summary_prompts = 0;
        let ending = loop {
            if self.ctx.cancel.is_cancelled() {
                break Ending::Failed(FailureReason::Cancelled, "run cancelled".to_string());
            }
            if let Some(deadline) = self.ctx.deadline
                && tokio::time::Instant::now() >= deadline
            {
                break Ending::Limit(LimitKind::Deadline, "task deadline exceeded".to_string());
            }
            if let Some(max) = self.max_turns
                && self.turn_count >= max
            {
                break Ending::Limit(LimitKind::Turns, format!("turn limit of {max} reached"));
            }

            self.turn_count += 1;
            let turn = self.turn_count;
            self.tracer.emit(TraceKind::Turn { turn });

            let request = ChatRequest {
                model: self.model.clone(),
                messages: self.conversation.messages().to_vec(),
                tools: self.tools.definitions().to_vec(),
                sampling: self.sampling.clone(),
            };

            let started = Instant::now();
            let completion = match self.ctx.llm.complete(&request, &self.ctx.cancel).await {
                Ok(completion) => completion,
                Err(e) => {
                    self.tracer.emit(TraceKind::LlmCompletion {
                        turn,
                        latency_ms: millis(started),
                        attempts: e.attempts,
                        tool_calls: 0,
                        usage: TokenUsage::default(),
                        error: Some(e.error.kind().to_string()),
                    });
                    break Ending::Failed(FailureReason::from_llm(&e.error), e.to_string());
                }
            };

            let response = completion.response;
            self.usage.add(&response.usage);
            self.tracer.emit(TraceKind::LlmCompletion {
                turn,
                latency_ms: millis(started),
                attempts: completion.attempts,
                tool_calls: response.tool_calls.len(),
                usage: response.usage,
                error: None,
            });
            debug!(
                agent = %self.agent_kind,
                turn,
                tool_calls = response.tool_calls.len(),
                stop_reason = ?response.stop_reason,
                "model responded"
            );

            if !response.tool_calls.is_empty() {
                self.conversation
                    .push_assistant(&response.content, response.tool_calls.clone());
                let results = self.execute_tools(turn, &response.tool_calls).await;
                self.conversation.push_tool_results(&results);
                continue;
            }

            self.conversation.push_assistant(&response.content, Vec::new());
            let text = response.content.trim();
            match self.answer_format {
                AnswerFormat::FreeText => break Ending::Completed(text.to_string()),
                AnswerFormat::Boxed => {
                    if let Some(answer) = extract_boxed(text) {
                        break Ending::Completed(answer);
                    }
                    if summary_prompts < self.ctx.config.max_final_answer_prompts {
                        summary_prompts += 1;
                        debug!(agent = %self.agent_kind, turn, "no boxed answer, asking for summary");
                        self.conversation.push_user(&self.ctx.prompts.final_summary);
                        continue;
                    }
                    if text.is_empty() {
                        break Ending::Failed(
                            FailureReason::Fatal,
                            "model produced no final answer".to_string(),
                        );
                    }
                    break Ending::Completed(text.to_string());
                }
            }
        };

        self.finish(ending)
    }

    /// Executes one turn's tool calls and returns one result per call, in
    /// call order.
    async fn execute_tools(&mut self, turn: usize, calls: &[ToolCall]) -> Vec<ToolResult> {
        let budget = self.ctx.config.max_tool_calls_per_turn;
        let parallel = self.ctx.config.parallel_delegation;

        let slots: Vec<Slot> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                if index >= budget {
                    Slot::Ready(ToolResult::error(
                        &call.id,
                        format!(
                            "call budget exceeded: at most {budget} tool calls are executed per \
                             turn; this call was skipped"
                        ),
                    ))
                } else if !self.routes_to_delegation(call) {
                    Slot::Backend
                } else if parallel {
                    let handle = delegation::spawn(self.ctx.clone(), self.depth, call.clone());
                    Slot::Spawned(handle, Instant::now())
                } else {
                    Slot::Delegate
                }
            })
            .collect();

        if calls.len() > budget {
            warn!(
                agent = %self.agent_kind,
                turn,
                requested = calls.len(),
                budget,
                "tool call budget exceeded"
            );
        }

        let mut results = Vec::with_capacity(calls.len());
        for (call, slot) in calls.iter().zip(slots) {
            let result = match slot {
                Slot::Ready(result) => result,
                Slot::Backend => self.dispatch_tool(turn, call).await,
                Slot::Spawned(handle, started) => {
                    let delegated = delegation::join(handle, &call.id).await;
                    self.record_delegation(turn, call, delegated, started)
                }
                Slot::Delegate => {
                    let started = Instant::now();
                    let handle = delegation::spawn(self.ctx.clone(), self.depth, call.clone());
                    let delegated = delegation::join(handle, &call.id).await;
                    self.record_delegation(turn, call, delegated, started)
                }
            };
            results.push(result);
        }
        results
    }

    /// Delegation calls the coordinator handles: advertised ones, and any
    /// `agent_` call at or past the depth cap so it gets a depth error.
    fn routes_to_delegation(&self, call: &ToolCall) -> bool {
        is_delegation(&call.name)
            && (self.tools.contains(&call.name) || self.depth >= self.ctx.config.max_delegation_depth)
    }

    fn record_delegation(
        &mut self,
        turn: usize,
        call: &ToolCall,
        delegated: Delegated,
        started: Instant,
    ) -> ToolResult {
        let status = delegated.run.as_ref().map_or(RunStatus::Failed, |r| r.status);
        self.tracer.emit(TraceKind::Delegation {
            turn,
            template: call.delegation_target().unwrap_or_default().to_string(),
            call_id: call.id.clone(),
            status,
            latency_ms: millis(started),
        });
        debug!(
            agent = %self.agent_kind,
            call_id = %call.id,
            %status,
            "delegation finished"
        );
        if let Some(run) = delegated.run {
            self.sub_runs.push(DelegatedRun {
                tool_call_id: call.id.clone(),
                run,
            });
        }
        delegated.result
    }

    /// Dispatches one backend tool call. Never fails: every problem becomes
    /// an error result.
    async fn dispatch_tool(&self, turn: usize, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let result = self.invoke_backend(call).await;
        self.tracer.emit(TraceKind::ToolCall {
            turn,
            tool: call.name.clone(),
            call_id: call.id.clone(),
            arguments: call.arguments.clone(),
            result_len: result.content.len(),
            latency_ms: millis(started),
            is_error: result.is_error,
        });
        debug!(
            tool = %call.name,
            call_id = %call.id,
            is_error = result.is_error,
            "tool execution complete"
        );
        result
    }

    async fn invoke_backend(&self, call: &ToolCall) -> ToolResult {
        if is_delegation(&call.name) || !self.tools.contains(&call.name) {
            return ToolResult::error(
                &call.id,
                format!(
                    "unknown tool: {}. Available tools: {}",
                    call.name,
                    self.tools.names().join(", ")
                ),
            );
        }

        let size = call.arguments_len();
        if size > MAX_TOOL_ARGUMENT_BYTES {
            return ToolResult::error(
                &call.id,
                format!(
                    "arguments too large: {size} bytes (max {MAX_TOOL_ARGUMENT_BYTES}); \
                     pass references instead of inline content"
                ),
            );
        }

        let timeout = self.ctx.config.tool_timeout;
        let invocation = AssertUnwindSafe(self.ctx.tools.invoke(&call.name, &call.arguments))
            .catch_unwind();
        let outcome = tokio::select! {
            () = self.ctx.cancel.cancelled() => {
                debug!(tool = %call.name, "tool call abandoned on cancellation");
                return ToolResult::error(&call.id, format!("tool {} cancelled", call.name));
            }
            outcome = tokio::time::timeout(timeout, invocation) => outcome,
        };
        match outcome {
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool call timed out");
                ToolResult::error(
                    &call.id,
                    format!("tool {} timed out after {}s", call.name, timeout.as_secs()),
                )
            }
            Ok(Err(_)) => {
                warn!(tool = %call.name, "tool gateway panicked");
                ToolResult::error(&call.id, format!("tool {} failed: internal error", call.name))
            }
            Ok(Ok(output)) => {
                let content = if output.content.trim().is_empty() {
                    "(no output)".to_string()
                } else {
                    output.content
                };
                ToolResult {
                    tool_call_id: call.id.clone(),
                    content,
                    is_error: output.is_error,
                }
            }
        }
    }

    fn finish(self, ending: Ending) -> AgentRun {
        if let Err(e) = self.conversation.validate(false) {
            warn!(agent = %self.agent_kind, error = %e, "inconsistent transcript");
        }

        let best_effort = || {
            self.conversation
                .last_assistant_text()
                .and_then(best_effort_answer)
        };
        let (status, failure, limit, error, final_answer) = match ending {
            Ending::Completed(answer) => (RunStatus::Completed, None, None, None, Some(answer)),
            Ending::Failed(reason, error) => {
                (RunStatus::Failed, Some(reason), None, Some(error), best_effort())
            }
            Ending::Limit(kind, error) => (
                RunStatus::TurnLimitExceeded,
                None,
                Some(kind),
                Some(error),
                best_effort(),
            ),
        };

        self.tracer.emit(TraceKind::RunFinished {
            status,
            turns: self.turn_count,
        });
        info!(
            agent = %self.agent_kind,
            depth = self.depth,
            turns = self.turn_count,
            %status,
            total_tokens = self.usage.total_tokens,
            "agent finished"
        );

        AgentRun {
            agent_kind: self.agent_kind,
            depth: self.depth,
            turn_count: self.turn_count,
            status,
            failure,
            limit,
            error,
            final_answer,
            conversation: self.conversation,
            usage: self.usage,
            sub_runs: self.sub_runs,
        }
    }
}

impl std::fmt::Debug for AgentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOrchestrator")
            .field("agent_kind", &self.agent_kind)
            .field("depth", &self.depth)
            .field("model", &self.model)
            .field("max_turns", &self.max_turns)
            .field("tools", &self.tools.names())
            .finish_non_exhaustive()
    }
}

fn millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::agent::message::{ChatResponse, Role};
    use crate::agent::provider::LlmProvider;
    use crate::agent::retry::{Backoff, RetryPolicy};
    use crate::tools::ToolOutput;

    struct Scripted {
        responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<ChatResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap_or_else(|e| panic!("{e}"))
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            *self.calls.lock().unwrap_or_else(|e| panic!("{e}")) += 1;
            self.responses
                .lock()
                .unwrap_or_else(|e| panic!("{e}"))
                .pop_front()
                .unwrap_or_else(|| Ok(text("\\boxed{fallback}")))
        }
    }

    struct Echo;

    #[async_trait]
    impl ToolGateway for Echo {
        async fn list_tools(&self) -> Vec<ToolDefinition> {
            vec![echo_def()]
        }

        async fn invoke(&self, _name: &str, arguments: &Value) -> ToolOutput {
            ToolOutput::ok(arguments["text"].as_str().unwrap_or_default())
        }
    }

    fn echo_def() -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echoes text.".to_string(),
            parameters: json!({"type": "object"}),
        }
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            ..ChatResponse::default()
        }
    }

    fn calls(n: usize) -> ChatResponse {
        ChatResponse {
            tool_calls: (0..n)
                .map(|i| ToolCall {
                    id: format!("c{i}"),
                    name: "echo".to_string(),
                    arguments: json!({"text": format!("r{i}")}),
                })
                .collect(),
            ..ChatResponse::default()
        }
    }

    fn context(provider: Arc<Scripted>, config: AgentConfig) -> RunContext {
        let policy = RetryPolicy {
            max_transient_attempts: 3,
            max_malformed_attempts: 2,
            backoff: Backoff {
                base: Duration::from_millis(1),
                multiplier: 2.0,
                max: Duration::from_millis(4),
            },
        };
        RunContext::new(
            Arc::new(config),
            Arc::new(Profile::builtin()),
            Arc::new(PromptSet::defaults()),
            LlmGateway::new(provider, policy, Duration::from_secs(5)),
            Arc::new(Echo),
            vec![echo_def()],
        )
    }

    fn config() -> AgentConfig {
        AgentConfig::builder()
            .api_key("test")
            .build()
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn main_agent(ctx: RunContext) -> AgentOrchestrator {
        let template = ctx.profile.main.clone();
        AgentOrchestrator::new(ctx, &template, 0, true)
    }

    #[tokio::test]
    async fn test_boxed_answer_completes() {
        let provider = Scripted::new(vec![Ok(calls(1)), Ok(text("So: \\boxed{done}"))]);
        let run = main_agent(context(Arc::clone(&provider), config()))
            .run("echo done".to_string())
            .await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.final_answer.as_deref(), Some("done"));
        assert_eq!(run.turn_count, 2);
        assert_eq!(run.conversation.len(), 5);
        assert!(run.conversation.validate(false).is_ok());
    }

    #[tokio::test]
    async fn test_missing_box_gets_one_summary_prompt() {
        let provider = Scripted::new(vec![Ok(text("I think 7")), Ok(text("still 7"))]);
        let run = main_agent(context(Arc::clone(&provider), config()))
            .run("q".to_string())
            .await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.final_answer.as_deref(), Some("still 7"));
        assert_eq!(provider.calls(), 2);
        let roles: Vec<Role> = run.conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn test_empty_text_after_summary_fails() {
        let provider = Scripted::new(vec![Ok(text("thinking...")), Ok(text("   "))]);
        let run = main_agent(context(Arc::clone(&provider), config()))
            .run("q".to_string())
            .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(FailureReason::Fatal));
        assert_eq!(run.error.as_deref(), Some("model produced no final answer"));
        assert_eq!(provider.calls(), 2);
    }

    struct Stuck;

    #[async_trait]
    impl ToolGateway for Stuck {
        async fn list_tools(&self) -> Vec<ToolDefinition> {
            vec![echo_def()]
        }

        async fn invoke(&self, _name: &str, _arguments: &Value) -> ToolOutput {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            ToolOutput::ok("late")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_tool_dispatch() {
        let provider = Scripted::new(vec![Ok(calls(1))]);
        let cfg = AgentConfig::builder()
            .api_key("test")
            .tool_timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_else(|e| panic!("{e}"));
        let mut ctx = context(Arc::clone(&provider), cfg);
        ctx.tools = Arc::new(Stuck);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        });

        let started = tokio::time::Instant::now();
        let run = main_agent(ctx).run("q".to_string()).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(run.failure, Some(FailureReason::Cancelled));
        assert_eq!(provider.calls(), 1);
        let tool = &run.conversation.messages()[3];
        assert!(tool.is_error);
        assert!(tool.content.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_turn_cap_is_exact() {
        let provider = Scripted::new((0..10).map(|_| Ok(calls(1))).collect());
        let cfg = AgentConfig::builder()
            .api_key("test")
            .max_turns(Some(3))
            .build()
            .unwrap_or_else(|e| panic!("{e}"));
        let run = main_agent(context(Arc::clone(&provider), cfg))
            .run("loop".to_string())
            .await;
        assert_eq!(run.status, RunStatus::TurnLimitExceeded);
        assert_eq!(run.limit, Some(LimitKind::Turns));
        assert_eq!(run.turn_count, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_call_budget() {
        let provider = Scripted::new(vec![Ok(calls(5)), Ok(text("\\boxed{ok}"))]);
        let cfg = AgentConfig::builder()
            .api_key("test")
            .max_tool_calls_per_turn(2)
            .build()
            .unwrap_or_else(|e| panic!("{e}"));
        let run = main_agent(context(provider, cfg)).run("q".to_string()).await;
        let tool_msgs: Vec<_> = run
            .conversation
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_msgs.len(), 5);
        assert_eq!(tool_msgs.iter().filter(|m| !m.is_error).count(), 2);
        assert!(tool_msgs[4].content.contains("call budget exceeded"));
    }

    #[tokio::test]
    async fn test_context_limit_is_not_retried() {
        let provider = Scripted::new(vec![Err(LlmError::ContextLimitExceeded {
            message: "prompt is too long".to_string(),
        })]);
        let run = main_agent(context(Arc::clone(&provider), config()))
            .run("q".to_string())
            .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(FailureReason::ContextLimitExceeded));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_turn() {
        let provider = Scripted::new(Vec::new());
        let ctx = context(Arc::clone(&provider), config());
        ctx.cancel.cancel();
        let run = main_agent(ctx).run("q".to_string()).await;
        assert_eq!(run.failure, Some(FailureReason::Cancelled));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let provider = Scripted::new(vec![
            Ok(ChatResponse {
                tool_calls: vec![ToolCall {
                    id: "x".to_string(),
                    name: "teleport".to_string(),
                    arguments: json!({}),
                }],
                ..ChatResponse::default()
            }),
            Ok(text("\\boxed{no}")),
        ]);
        let run = main_agent(context(provider, config())).run("q".to_string()).await;
        let tool = &run.conversation.messages()[3];
        assert!(tool.is_error);
        assert!(tool.content.contains("unknown tool: teleport"));
        assert!(tool.content.contains("echo"));
    }

    #[test]
    fn test_tool_set_includes_delegation_below_cap() {
        let ctx = context(Scripted::new(Vec::new()), config());
        let template = ctx.profile.main.clone();
        let main = AgentOrchestrator::new(ctx.clone(), &template, 0, true);
        assert!(main.tools().contains("agent_researcher"));
        assert!(main.tools().contains("echo"));

        let researcher = ctx.profile.sub_agent("researcher").cloned().unwrap_or_default();
        let sub = AgentOrchestrator::new(ctx, &researcher, 1, false);
        assert!(!sub.tools().contains("agent_researcher"));
    }
}
