//! Tool gateway: uniform access to external tool backends.
//!
//! Agents see tools only through [`ToolGateway`]. The production
//! implementation, [`McpToolSession`], opens one MCP stdio connection per
//! configured server for the lifetime of a task.

pub mod client;
pub mod protocol;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::profile::ToolServerConfig;
use crate::agent::tool::{ToolDefinition, is_delegation};
pub use client::McpClient;

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Result text, or the error description.
    pub content: String,
    /// Whether the invocation failed.
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful output.
    #[must_use]
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Failed output.
    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Access to the tools of one task.
///
/// Implementations never fail past this boundary: every problem becomes an
/// error [`ToolOutput`].
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Tool signatures available in this session.
    async fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Invokes a tool by name.
    async fn invoke(&self, name: &str, arguments: &Value) -> ToolOutput;

    /// Releases backend resources. Further invocations return errors.
    async fn shutdown(&self) {}
}

/// A gateway with no tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolGateway for NoTools {
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn invoke(&self, name: &str, _arguments: &Value) -> ToolOutput {
        ToolOutput::error(format!("unknown tool: {name}"))
    }
}

/// MCP connections opened for one task.
pub struct McpToolSession {
    clients: Vec<Arc<McpClient>>,
    routes: HashMap<String, usize>,
    tools: Vec<ToolDefinition>,
    startup_errors: Vec<String>,
}

impl McpToolSession {
    /// Connects to every server concurrently and indexes their tools.
    ///
    /// A server that fails to start or list is skipped and recorded in
    /// [`startup_errors`](Self::startup_errors). Tools using the reserved
    /// delegation prefix are rejected; on a name clash the first server in
    /// profile order wins.
    pub async fn open(servers: &[ToolServerConfig], request_timeout: Duration) -> Self {
        let connections = join_all(servers.iter().map(|server| async move {
            let client = McpClient::connect(server, request_timeout).await?;
            let tools = client.list_tools().await?;
            anyhow::Ok((client, tools))
        }))
        .await;

        let mut session = Self {
            clients: Vec::new(),
            routes: HashMap::new(),
            tools: Vec::new(),
            startup_errors: Vec::new(),
        };

        for (server, connection) in servers.iter().zip(connections) {
            let (client, tools) = match connection {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(server = %server.name, error = %e, "tool server unavailable");
                    session.startup_errors.push(format!("{}: {e}", server.name));
                    continue;
                }
            };
            let index = session.clients.len();
            session.clients.push(Arc::new(client));

            for tool in tools {
                if is_delegation(&tool.name) {
                    warn!(server = %server.name, tool = %tool.name, "rejecting tool with reserved prefix");
                    continue;
                }
                if session.routes.contains_key(&tool.name) {
                    warn!(server = %server.name, tool = %tool.name, "duplicate tool name ignored");
                    continue;
                }
                session.routes.insert(tool.name.clone(), index);
                session.tools.push(ToolDefinition {
                    name: tool.name,
                    description: tool.description.unwrap_or_default(),
                    parameters: normalize_schema(tool.input_schema),
                });
            }
        }

        info!(
            servers = session.clients.len(),
            tools = session.tools.len(),
            "tool session opened"
        );
        session
    }

    /// Problems encountered while opening the session.
    #[must_use]
    pub fn startup_errors(&self) -> &[String] {
        &self.startup_errors
    }
}

/// Ensures the schema is an object schema, as providers require.
fn normalize_schema(schema: Value) -> Value {
    match schema {
        Value::Object(mut map) => {
            map.entry("type").or_insert_with(|| Value::from("object"));
            Value::Object(map)
        }
        _ => serde_json::json!({"type": "object", "properties": {}}),
    }
}

#[async_trait]
impl ToolGateway for McpToolSession {
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> ToolOutput {
        let Some(client) = self.routes.get(name).and_then(|&i| self.clients.get(i)) else {
            return ToolOutput::error(format!("unknown tool: {name}"));
        };
        match client.call_tool(name, arguments).await {
            Ok(result) => ToolOutput {
                content: result.text(),
                is_error: result.is_error,
            },
            Err(e) => ToolOutput::error(format!("tool {name} on {} failed: {e}", client.name())),
        }
    }

    async fn shutdown(&self) {
        join_all(self.clients.iter().map(|c| c.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_no_tools() {
        assert!(NoTools.list_tools().await.is_empty());
        let out = NoTools.invoke("search", &json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("search"));
    }

    #[test]
    fn test_normalize_schema() {
        assert_eq!(
            normalize_schema(json!({"properties": {}})),
            json!({"type": "object", "properties": {}})
        );
        assert_eq!(normalize_schema(Value::Null)["type"], "object");
    }

    #[tokio::test]
    async fn test_open_skips_broken_servers() {
        let servers = vec![ToolServerConfig {
            name: "ghost".to_string(),
            command: "delve-definitely-not-a-command".to_string(),
            args: Vec::new(),
            env: std::collections::BTreeMap::new(),
            cwd: None,
        }];
        let session = McpToolSession::open(&servers, Duration::from_secs(1)).await;
        assert!(session.list_tools().await.is_empty());
        assert_eq!(session.startup_errors().len(), 1);
        assert!(session.startup_errors()[0].starts_with("ghost:"));
        let out = session.invoke("anything", &json!({})).await;
        assert!(out.is_error);
        session.shutdown().await;
    }
}
