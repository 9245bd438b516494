//! Task pipeline: one task in, one [`TaskResult`] out.
//!
//! # Steps
//!
//! 1. Resolve the agent profile and open the task's tool session
//! 2. Optionally augment the instruction with hints (auxiliary model)
//! 3. Run the main agent on a supervised task
//! 4. Optionally extract the canonical answer (auxiliary model), then
//!    normalize it deterministically
//!
//! Every step degrades instead of failing: [`TaskPipeline::run`] always
//! returns a result record. A panic in any step becomes a `failed` record.
//! Dropping the `run` future aborts the main agent and still shuts the tool
//! session down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::client::create_provider;
use super::config::AgentConfig;
use super::gateway::LlmGateway;
use super::message::{ChatRequest, TokenUsage, system_message, user_message};
use super::orchestrator::{AgentOrchestrator, AgentRun, FailureReason, RunContext, RunStatus};
use super::profile::{Profile, ToolServerConfig};
use super::prompt::{
    PromptSet, build_augmentation_prompt, build_extraction_prompt, build_task_prompt,
};
use super::provider::LlmProvider;
use super::trace::Tracer;
use crate::core::answer::{extract_boxed, extract_final_answer};
use crate::error::AgentError;
use crate::tools::{McpToolSession, NoTools, ToolGateway};

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Caller-chosen identifier, echoed in the result.
    #[serde(default)]
    pub task_id: String,
    /// The question or instruction.
    #[serde(alias = "question")]
    pub instruction: String,
    /// Path of a file the agent should work with.
    #[serde(default, alias = "file_name", skip_serializing_if = "Option::is_none")]
    pub attached_file: Option<String>,
    /// Profile reference: a TOML path or `default`.
    #[serde(
        default,
        alias = "agent_config_reference",
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_config: Option<String>,
}

impl Task {
    /// Creates a task with no attachment and the pipeline's profile.
    #[must_use]
    pub fn new(task_id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            instruction: instruction.into(),
            attached_file: None,
            agent_config: None,
        }
    }
}

/// Result record of one task. Serialized as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task identifier.
    pub task_id: String,
    /// Normalized answer.
    pub final_answer: Option<String>,
    /// Last assistant text of the main agent, before normalization.
    #[serde(default)]
    pub raw_answer: Option<String>,
    /// Terminal status of the main agent.
    pub status: RunStatus,
    /// Failure reason for failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Error description.
    #[serde(default)]
    pub error: Option<String>,
    /// Main agent run, including nested sub-agent runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<AgentRun>,
    /// Token usage across every LLM call of the task.
    pub usage: TokenUsage,
    /// Wall time.
    pub elapsed_secs: f64,
}

impl TaskResult {
    /// A task that failed without a main-agent run.
    #[must_use]
    pub fn failed(
        task_id: &str,
        reason: FailureReason,
        error: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            final_answer: None,
            raw_answer: None,
            status: RunStatus::Failed,
            failure: Some(reason),
            error: Some(error.into()),
            trace: None,
            usage: TokenUsage::default(),
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Opens the tool session of one task.
#[async_trait]
pub trait ToolGatewayFactory: Send + Sync {
    /// Connects to the given servers.
    async fn open(&self, servers: &[ToolServerConfig]) -> Result<Arc<dyn ToolGateway>, AgentError>;
}

/// Opens MCP stdio sessions.
#[derive(Debug, Clone, Copy)]
pub struct McpToolGatewayFactory {
    request_timeout: Duration,
}

impl McpToolGatewayFactory {
    /// Uses `request_timeout` for every MCP request.
    #[must_use]
    pub const fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl ToolGatewayFactory for McpToolGatewayFactory {
    async fn open(&self, servers: &[ToolServerConfig]) -> Result<Arc<dyn ToolGateway>, AgentError> {
        if servers.is_empty() {
            return Ok(Arc::new(NoTools));
        }
        let session = McpToolSession::open(servers, self.request_timeout).await;
        if session.startup_errors().len() == servers.len() {
            warn!(
                errors = ?session.startup_errors(),
                "no tool server started; continuing without tools"
            );
        }
        Ok(Arc::new(session))
    }
}

/// Tool session of one task. Released explicitly on the normal path; if the
/// owning future is dropped first, shutdown runs on a detached task.
struct ToolSession {
    tools: Option<Arc<dyn ToolGateway>>,
}

impl ToolSession {
    fn new(tools: Arc<dyn ToolGateway>) -> Self {
        Self { tools: Some(tools) }
    }

    async fn release(mut self) {
        if let Some(tools) = self.tools.take() {
            tools.shutdown().await;
        }
    }
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        let Some(tools) = self.tools.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("task abandoned; shutting tool session down in the background");
                handle.spawn(async move { tools.shutdown().await });
            }
            Err(_) => warn!("tool session dropped outside a runtime; servers not shut down"),
        }
    }
}

/// Drives tasks end to end.
pub struct TaskPipeline {
    config: Arc<AgentConfig>,
    prompts: Arc<PromptSet>,
    llm: LlmGateway,
    tool_factory: Arc<dyn ToolGatewayFactory>,
    profile: Arc<Profile>,
    tracer: Tracer,
    cancel: CancellationToken,
}

impl TaskPipeline {
    /// Creates a pipeline over an existing provider.
    ///
    /// Prompts load from [`AgentConfig::prompt_dir`], falling back to the
    /// compiled-in defaults. Tasks without a profile reference use the
    /// built-in profile.
    #[must_use]
    pub fn new(config: AgentConfig, provider: Arc<dyn LlmProvider>) -> Self {
        let prompts = PromptSet::load(config.prompt_dir.as_deref());
        let llm = LlmGateway::from_config(provider, &config);
        let tool_factory = Arc::new(McpToolGatewayFactory::new(config.tool_timeout));
        Self {
            config: Arc::new(config),
            prompts: Arc::new(prompts),
            llm,
            tool_factory,
            profile: Arc::new(Profile::builtin()),
            tracer: Tracer::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a pipeline with the provider the configuration names.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] if the provider cannot be created.
    pub fn from_config(config: AgentConfig) -> Result<Self, AgentError> {
        let provider = create_provider(&config)?;
        Ok(Self::new(config, provider))
    }

    /// Replaces the prompt set.
    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    /// Sets the profile used by tasks that name none.
    #[must_use]
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Arc::new(profile);
        self
    }

    /// Replaces the tool session factory.
    #[must_use]
    pub fn with_tool_factory(mut self, factory: Arc<dyn ToolGatewayFactory>) -> Self {
        self.tool_factory = factory;
        self
    }

    /// Sets the trace channel.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets the token whose cancellation stops every task of this pipeline.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cancellation token shared by every task.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Trace handle.
    #[must_use]
    pub const fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Runs one task. Never fails: problems are reported in the result.
    pub async fn run(&self, task: Task) -> TaskResult {
        let started = Instant::now();
        info!(task_id = %task.task_id, "task started");

        let profile = match self.resolve_profile(&task) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "profile resolution failed");
                return TaskResult::failed(
                    &task.task_id,
                    FailureReason::Fatal,
                    e.to_string(),
                    started.elapsed(),
                );
            }
        };
        let tools = match self.tool_factory.open(&profile.tool_servers).await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "tool session failed");
                return TaskResult::failed(
                    &task.task_id,
                    FailureReason::Fatal,
                    e.to_string(),
                    started.elapsed(),
                );
            }
        };
        let session = ToolSession::new(Arc::clone(&tools));

        let mut aux_usage = TokenUsage::default();
        let run = match self.prepare_prompt(&task, &mut aux_usage).await {
            Ok(prompt) => self.run_main(&task, prompt, profile, tools).await,
            Err(message) => AgentRun::aborted("main", FailureReason::Fatal, message),
        };
        session.release().await;

        let mut status = run.status;
        let mut failure = run.failure;
        let mut error = run.error.clone();

        let raw_answer = run.conversation.last_assistant_text().map(str::to_string);
        let extracted = match (&raw_answer, self.config.output_extraction) {
            (Some(raw), true) if run.final_answer.is_some() => {
                let extraction =
                    AssertUnwindSafe(self.extract(&task.instruction, raw, &mut aux_usage));
                extraction.catch_unwind().await.unwrap_or_else(|_| {
                    error!(task_id = %task.task_id, "answer extraction panicked");
                    status = RunStatus::Failed;
                    failure = Some(FailureReason::Fatal);
                    error = Some("answer extraction panicked".to_string());
                    None
                })
            }
            _ => None,
        };
        let final_answer = extracted
            .or_else(|| run.final_answer.clone())
            .map(|a| extract_final_answer(&a));

        let mut usage = run.total_usage();
        usage.add(&aux_usage);

        info!(
            task_id = %task.task_id,
            %status,
            turns = run.turn_count,
            sub_agents = run.sub_runs.len(),
            total_tokens = usage.total_tokens,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "task finished"
        );

        TaskResult {
            task_id: task.task_id,
            final_answer,
            raw_answer,
            status,
            failure,
            error,
            trace: Some(run),
            usage,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }

    /// Builds the main agent's first user message, with hints when
    /// augmentation is on. Errors only if augmentation panicked.
    async fn prepare_prompt(
        &self,
        task: &Task,
        usage: &mut TokenUsage,
    ) -> Result<String, &'static str> {
        let hints = if self.config.input_augmentation {
            let augmentation = AssertUnwindSafe(self.augment(&task.instruction, usage));
            augmentation.catch_unwind().await.map_err(|_| {
                error!(task_id = %task.task_id, "input augmentation panicked");
                "input augmentation panicked"
            })?
        } else {
            None
        };
        Ok(build_task_prompt(
            &task.instruction,
            task.attached_file.as_deref(),
            hints.as_deref(),
        ))
    }

    /// Runs the main agent on its own task. A panic or abort becomes a
    /// failed run; dropping the returned future aborts the agent.
    async fn run_main(
        &self,
        task: &Task,
        prompt: String,
        profile: Arc<Profile>,
        tools: Arc<dyn ToolGateway>,
    ) -> AgentRun {
        let config = Arc::clone(&self.config);
        let prompts = Arc::clone(&self.prompts);
        let llm = self.llm.clone();
        let cancel = self.cancel.child_token();
        let deadline = config.task_deadline.map(|d| tokio::time::Instant::now() + d);
        let tracer = self.tracer.for_task(&task.task_id);

        let main = AbortOnDropHandle::new(tokio::spawn(async move {
            let backend_tools = tools.list_tools().await;
            let ctx = RunContext::new(
                config,
                Arc::clone(&profile),
                prompts,
                llm,
                tools,
                backend_tools,
            )
            .with_cancel(cancel)
            .with_deadline(deadline)
            .with_tracer(tracer);
            AgentOrchestrator::new(ctx, &profile.main, 0, true).run(prompt).await
        }));

        match main.await {
            Ok(run) => run,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "main agent task died");
                let message = if e.is_panic() {
                    "agent panicked"
                } else {
                    "agent task was cancelled"
                };
                AgentRun::aborted("main", FailureReason::Fatal, message)
            }
        }
    }

    fn resolve_profile(&self, task: &Task) -> Result<Arc<Profile>, AgentError> {
        match task.agent_config.as_deref().map(str::trim) {
            None | Some("") => Ok(Arc::clone(&self.profile)),
            reference => Profile::resolve(reference).map(Arc::new),
        }
    }

    /// Auxiliary hint generation. Failures fall back to no hints.
    async fn augment(&self, instruction: &str, usage: &mut TokenUsage) -> Option<String> {
        let request = self.aux_request(
            &self.prompts.augmentation,
            &build_augmentation_prompt(instruction),
        );
        match self.llm.complete(&request, &self.cancel).await {
            Ok(completion) => {
                usage.add(&completion.response.usage);
                let hints = completion.response.content.trim().to_string();
                debug!(len = hints.len(), "input augmentation produced hints");
                (!hints.is_empty()).then_some(hints)
            }
            Err(e) => {
                warn!(error = %e, "input augmentation failed; using raw instruction");
                None
            }
        }
    }

    /// Auxiliary answer extraction. Failures fall back to the raw answer.
    async fn extract(
        &self,
        instruction: &str,
        raw_answer: &str,
        usage: &mut TokenUsage,
    ) -> Option<String> {
        let request = self.aux_request(
            &self.prompts.extraction,
            &build_extraction_prompt(instruction, raw_answer),
        );
        match self.llm.complete(&request, &self.cancel).await {
            Ok(completion) => {
                usage.add(&completion.response.usage);
                let text = completion.response.content.trim();
                let answer = extract_boxed(text).unwrap_or_else(|| text.to_string());
                debug!(answer = %answer, "answer extracted");
                (!answer.is_empty()).then_some(answer)
            }
            Err(e) => {
                warn!(error = %e, "answer extraction failed; keeping raw answer");
                None
            }
        }
    }

    fn aux_request(&self, system: &str, user: &str) -> ChatRequest {
        ChatRequest {
            model: self.config.aux_model.clone(),
            messages: vec![system_message(system), user_message(user)],
            tools: Vec::new(),
            sampling: self.config.sampling.clone(),
        }
    }
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("llm", &self.llm)
            .field("profile", &self.profile.main.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(r#"{"task_id":"a","instruction":"q"}"#, None, None; "minimal")]
    #[test_case(
        r#"{"task_id":"a","question":"q","file_name":"x.pdf","agent_config_reference":"p.toml"}"#,
        Some("x.pdf"),
        Some("p.toml");
        "aliases"
    )]
    fn test_task_deserialization(line: &str, file: Option<&str>, profile: Option<&str>) {
        let task: Task = serde_json::from_str(line).unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(task.instruction, "q");
        assert_eq!(task.attached_file.as_deref(), file);
        assert_eq!(task.agent_config.as_deref(), profile);
    }

    #[test]
    fn test_failed_result_shape() {
        let result = TaskResult::failed(
            "t1",
            FailureReason::Cancelled,
            "interrupted",
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&result).unwrap_or_default();
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure"], "cancelled");
        assert!(json["final_answer"].is_null());
        assert!(json.get("trace").is_none());
        assert!((result.elapsed_secs - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_mcp_factory_without_servers() {
        let factory = McpToolGatewayFactory::new(Duration::from_secs(1));
        let tools = factory
            .open(&[])
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        assert!(tools.list_tools().await.is_empty());
    }
}
