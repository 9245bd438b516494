//! MCP client for one stdio server.
//!
//! A background task reads responses and completes pending requests by id,
//! so concurrent `tools/call` requests can share one connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::protocol::{
    McpTool, RpcMessage, RpcNotification, RpcRequest, ToolCallResult, ToolsListResult,
};
use super::transport::StdioTransport;
use crate::agent::profile::ToolServerConfig;

const PROTOCOL_VERSION: &str = "2024-11-05";
/// Upper bound on `tools/list` pages followed.
const MAX_LIST_PAGES: usize = 32;

type Pending = Arc<RwLock<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

/// Connection to one MCP server process.
pub struct McpClient {
    name: String,
    transport: Arc<StdioTransport>,
    next_id: AtomicI64,
    pending: Pending,
    request_timeout: Duration,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl McpClient {
    /// Spawns the server, starts the receive loop and performs the
    /// `initialize` handshake.
    pub async fn connect(config: &ToolServerConfig, request_timeout: Duration) -> Result<Self> {
        let transport = Arc::new(StdioTransport::spawn(
            &config.command,
            &config.args,
            &config.env,
            config.cwd.as_deref(),
        )?);
        let pending: Pending = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let recv_transport = Arc::clone(&transport);
        let recv_pending = Arc::clone(&pending);
        let recv_name = config.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(server = %recv_name, "MCP receive loop stopped");
                        break;
                    }
                    result = recv_transport.receive() => match result {
                        Ok(message) => dispatch(&recv_name, &message, &recv_pending).await,
                        Err(e) => {
                            warn!(server = %recv_name, error = %e, "MCP connection lost");
                            for (_, tx) in recv_pending.write().await.drain() {
                                let _ = tx.send(Err(anyhow!("connection lost: {e}")));
                            }
                            break;
                        }
                    }
                }
            }
        });

        let client = Self {
            name: config.name.clone(),
            transport,
            next_id: AtomicI64::new(1),
            pending,
            request_timeout,
            shutdown_tx: Some(shutdown_tx),
        };
        client.initialize().await?;
        Ok(client)
    }

    /// Server name from the profile.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "delve", "version": env!("CARGO_PKG_VERSION")},
        });
        let result: Value = self.request("initialize", Some(params)).await?;
        let protocol = result
            .get("protocolVersion")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("?");
        info!(server = %self.name, protocol, "MCP server initialized");
        self.notify("notifications/initialized").await
    }

    /// Lists the server's tools, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ToolsListResult = self.request("tools/list", params).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        debug!(server = %self.name, count = tools.len(), "MCP tools listed");
        Ok(tools)
    }

    /// Calls a tool.
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<ToolCallResult> {
        let params = json!({ "name": name, "arguments": arguments });
        self.request("tools/call", Some(params)).await
    }

    /// Stops the receive loop and kills the server.
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.try_send(());
        }
        self.transport.terminate().await;
    }

    async fn request<R: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&RpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);
        let _entry = PendingEntry {
            id,
            pending: Arc::clone(&self.pending),
        };

        self.transport.send(&json).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(anyhow!("request cancelled")),
            Err(_) => Err(anyhow!(
                "{method} timed out after {}s",
                self.request_timeout.as_secs()
            )),
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let json = serde_json::to_string(&RpcNotification {
            jsonrpc: "2.0",
            method,
            params: None,
        })?;
        self.transport.send(&json).await
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

/// Removes a request's pending slot when the request ends, including when
/// its future is dropped by an outer timeout.
struct PendingEntry {
    id: i64,
    pending: Pending,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.try_write() {
            map.remove(&self.id);
            return;
        }
        let (id, pending) = (self.id, Arc::clone(&self.pending));
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pending.write().await.remove(&id);
            });
        }
    }
}

async fn dispatch(server: &str, message: &str, pending: &Pending) {
    let parsed: RpcMessage = match serde_json::from_str(message) {
        Ok(m) => m,
        Err(e) => {
            warn!(server, error = %e, "unparseable MCP message");
            return;
        }
    };

    let Some(id) = parsed.response_id() else {
        if let Some(method) = &parsed.method {
            debug!(server, method, "MCP notification ignored");
        }
        return;
    };
    if parsed.method.is_some() {
        debug!(server, id, "server-initiated MCP request ignored");
        return;
    }

    if let Some(tx) = pending.write().await.remove(&id) {
        let outcome = match parsed.error {
            Some(err) => Err(anyhow!("MCP error {}: {}", err.code, err.message)),
            None => Ok(parsed.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_routes_by_id() {
        let pending: Pending = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.write().await.insert(5, tx);

        dispatch("s", r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#, &pending).await;
        dispatch("s", r#"{"jsonrpc":"2.0","id":5,"result":{"ok":true}}"#, &pending).await;

        let value = rx
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(value["ok"], true);
        assert!(pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_request_frees_its_slot() {
        let pending: Pending = Arc::new(RwLock::new(HashMap::new()));
        let (tx, _rx) = oneshot::channel();
        pending.write().await.insert(3, tx);
        drop(PendingEntry {
            id: 3,
            pending: Arc::clone(&pending),
        });
        assert!(pending.read().await.is_empty());

        let (tx, _rx) = oneshot::channel();
        pending.write().await.insert(4, tx);
        let reader = pending.read().await;
        drop(PendingEntry {
            id: 4,
            pending: Arc::clone(&pending),
        });
        assert_eq!(reader.len(), 1);
        drop(reader);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_error_response() {
        let pending: Pending = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.write().await.insert(9, tx);

        dispatch(
            "s",
            r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32601,"message":"no such method"}}"#,
            &pending,
        )
        .await;

        let outcome = rx.await.unwrap_or_else(|_| unreachable!());
        let err = outcome.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("no such method"));
    }
}
