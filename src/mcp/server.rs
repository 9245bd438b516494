//! MCP server implementation for delve.
//!
//! Exposes the task pipeline and tool discovery as MCP tools, and the active
//! prompt templates and built-in profile as MCP resources.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    AnnotateAble, CallToolResult, Content, Implementation, ListResourcesResult,
    PaginatedRequestParams, ProtocolVersion, RawResource, ReadResourceRequestParams,
    ReadResourceResult, Resource, ResourceContents, ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, tool, tool_handler, tool_router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::client::create_provider;
use crate::agent::config::{AgentConfig, parse_max_turns};
use crate::agent::orchestrator::RunStatus;
use crate::agent::pipeline::{Task, TaskPipeline};
use crate::agent::profile::Profile;
use crate::agent::prompt::PromptSet;
use crate::agent::provider::LlmProvider;
use crate::tools::{McpToolSession, ToolGateway};

use super::params::{ListToolsParams, RunTaskParams};

/// URI scheme of every resource this server exposes.
const URI_SCHEME: &str = "delve://";

/// delve MCP server.
///
/// Each `run_task` call builds its own pipeline over the shared provider, so
/// per-call overrides never leak between clients.
#[derive(Clone)]
pub struct DelveMcpServer {
    tool_router: ToolRouter<Self>,
    config: Arc<AgentConfig>,
    provider: Arc<dyn LlmProvider>,
    prompts: Arc<PromptSet>,
    cancel: CancellationToken,
}

#[tool_router]
impl DelveMcpServer {
    /// Runs one research task end to end and returns its result record.
    #[tool(
        name = "run_task",
        description = "Run a deep-research task. A main agent plans, calls the profile's tools and delegates subtasks to sub-agents, then commits to a final answer. Returns JSON with task_id, final_answer, status, error, token usage and (optionally) the full agent trace."
    )]
    async fn run_task(
        &self,
        Parameters(params): Parameters<RunTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut config = (*self.config).clone();
        if let Some(turns) = &params.max_turns {
            config.max_turns = parse_max_turns(turns)
                .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
        }
        // Cancelled when the client abandons the request and this future drops.
        let call_cancel = self.cancel.child_token();
        let _cancel_on_drop = call_cancel.clone().drop_guard();
        let pipeline = TaskPipeline::new(config, Arc::clone(&self.provider))
            .with_prompts((*self.prompts).clone())
            .with_cancel(call_cancel);

        let task = Task {
            task_id: params.task_id.unwrap_or_else(|| "mcp".to_string()),
            instruction: params.instruction,
            attached_file: params.attached_file,
            agent_config: params.profile,
        };
        info!(task_id = %task.task_id, "run_task called");

        let mut result = pipeline.run(task).await;
        if !params.include_trace {
            result.trace = None;
        }

        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| McpError::internal_error(format!("Serialization error: {e}"), None))?;

        if result.status == RunStatus::Failed {
            Ok(CallToolResult::error(vec![Content::text(json)]))
        } else {
            Ok(CallToolResult::success(vec![Content::text(json)]))
        }
    }

    /// Connects to a profile's tool servers and lists their tools.
    #[tool(
        name = "list_tools",
        description = "List the tools a delve agent profile exposes to its agents. Starts the profile's tool servers, collects their tool signatures and shuts them down. Returns JSON with the tools and any server startup errors."
    )]
    async fn list_tools(
        &self,
        Parameters(params): Parameters<ListToolsParams>,
    ) -> Result<CallToolResult, McpError> {
        let profile = Profile::resolve(params.profile.as_deref())
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let session = McpToolSession::open(&profile.tool_servers, self.config.tool_timeout).await;
        let tools = session.list_tools().await;
        let errors = session.startup_errors().to_vec();
        session.shutdown().await;

        let json = serde_json::to_string_pretty(&serde_json::json!({
            "tools": tools,
            "errors": errors,
        }))
        .map_err(|e| McpError::internal_error(format!("Serialization error: {e}"), None))?;

        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

#[tool_handler]
impl ServerHandler for DelveMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "delve".to_string(),
                title: Some("delve deep research agent".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "delve: deep research agent runtime. Use `run_task` to answer a question with \
                 a main agent and delegated sub-agents; use `list_tools` to inspect a profile's \
                 tools. Prompt templates and the built-in profile are available as resources."
                    .to_string(),
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let mut resources: Vec<Resource> = self
            .prompts
            .entries()
            .iter()
            .map(|(name, text)| {
                let mut raw =
                    RawResource::new(format!("{URI_SCHEME}prompts/{name}"), format!("Prompt: {name}"));
                raw.description = Some(format!("{} bytes", text.len()));
                raw.mime_type = Some("text/markdown".to_string());
                raw.no_annotation()
            })
            .collect();

        let mut profile = RawResource::new(
            format!("{URI_SCHEME}profile/builtin"),
            "Built-in agent profile".to_string(),
        );
        profile.mime_type = Some("application/json".to_string());
        resources.push(profile.no_annotation());

        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        ReadResourceRequestParams { uri, .. }: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let content = self.resource_content(&uri)?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(content, uri)],
        })
    }
}

impl DelveMcpServer {
    /// Creates a server over an existing provider.
    #[must_use]
    pub fn new(config: AgentConfig, provider: Arc<dyn LlmProvider>) -> Self {
        let prompts = PromptSet::load(config.prompt_dir.as_deref());
        Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            provider,
            prompts: Arc::new(prompts),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a server configured from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent configuration cannot be loaded from
    /// environment variables or if the LLM provider cannot be created.
    pub fn from_env() -> Result<Self, crate::error::Error> {
        let config = AgentConfig::from_env().map_err(|e| {
            crate::error::CommandError::ExecutionFailed(format!("Agent configuration error: {e}"))
        })?;

        let provider = create_provider(&config).map_err(|e| {
            crate::error::CommandError::ExecutionFailed(format!("Provider creation failed: {e}"))
        })?;

        Ok(Self::new(config, provider))
    }

    /// Token cancelled when the server shuts down; running tasks stop at
    /// their next turn boundary.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn resource_content(&self, uri: &str) -> Result<String, McpError> {
        let path = uri.strip_prefix(URI_SCHEME).ok_or_else(|| {
            McpError::invalid_params(
                format!("Invalid URI scheme, expected {URI_SCHEME}: {uri}"),
                None,
            )
        })?;

        match path.split('/').collect::<Vec<_>>().as_slice() {
            ["prompts", name] => self
                .prompts
                .entries()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, text)| (*text).to_string())
                .ok_or_else(|| {
                    McpError::resource_not_found(format!("Prompt not found: {name}"), None)
                }),
            ["profile", "builtin"] => serde_json::to_string_pretty(&Profile::builtin())
                .map_err(|e| McpError::internal_error(format!("Serialization error: {e}"), None)),
            _ => Err(McpError::invalid_params(
                format!(
                    "Invalid URI format: {path}. Expected {URI_SCHEME}prompts/{{name}} or {URI_SCHEME}profile/builtin"
                ),
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::{ChatRequest, ChatResponse};
    use crate::error::LlmError;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl LlmProvider for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse::default())
        }
    }

    fn server() -> DelveMcpServer {
        let config = AgentConfig::builder()
            .api_key("test")
            .build()
            .unwrap_or_else(|e| unreachable!("{e}"));
        DelveMcpServer::new(config, Arc::new(Silent))
    }

    #[test]
    fn test_prompt_resource() {
        let server = server();
        let text = server
            .resource_content("delve://prompts/final_summary")
            .unwrap_or_default();
        assert!(text.contains("\\boxed{}"));
    }

    #[test]
    fn test_builtin_profile_resource() {
        let text = server()
            .resource_content("delve://profile/builtin")
            .unwrap_or_default();
        assert!(text.contains("researcher"));
    }

    #[test]
    fn test_bad_resource_uris() {
        let server = server();
        assert!(server.resource_content("rlm://prompts/main").is_err());
        assert!(server.resource_content("delve://prompts/missing").is_err());
        assert!(server.resource_content("delve://other").is_err());
    }

    #[test]
    fn test_info_advertises_tools() {
        let info = server().get_info();
        assert_eq!(info.server_info.name, "delve");
        assert!(info.capabilities.tools.is_some());
    }
}
