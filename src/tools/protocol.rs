//! MCP wire types (JSON-RPC 2.0), client side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Request id.
    pub id: i64,
    /// Method name.
    pub method: &'a str,
    /// Parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> RpcRequest<'a> {
    /// Creates a request.
    #[must_use]
    pub const fn new(id: i64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// JSON-RPC notification (no id, no response).
#[derive(Debug, Serialize)]
pub struct RpcNotification<'a> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Method name.
    pub method: &'a str,
    /// Parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Incoming message: a response, or a server notification/request.
#[derive(Debug, Deserialize)]
pub struct RpcMessage {
    /// Response id; absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Success payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error payload.
    #[serde(default)]
    pub error: Option<RpcError>,
    /// Method, for server-initiated messages.
    #[serde(default)]
    pub method: Option<String>,
}

impl RpcMessage {
    /// Numeric response id, accepting ids echoed back as strings.
    #[must_use]
    pub fn response_id(&self) -> Option<i64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
}

/// Tool signature from `tools/list`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpTool {
    /// Tool name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema of the arguments.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// `tools/list` result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    /// Tools on this page.
    pub tools: Vec<McpTool>,
    /// Cursor for the next page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content blocks.
    #[serde(default)]
    pub content: Vec<McpContent>,
    /// Whether the tool reported failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Joins the content blocks into one text.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content block returned by a tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Inline image.
    Image {
        /// MIME type.
        #[serde(rename = "mimeType", default)]
        mime_type: String,
    },
    /// Embedded resource.
    Resource {
        /// Resource body.
        resource: Value,
    },
    /// Anything newer than this client understands.
    #[serde(other)]
    Other,
}

impl std::fmt::Display for McpContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text { text } => f.write_str(text),
            Self::Image { mime_type } => write!(f, "[image: {mime_type}]"),
            Self::Resource { resource } => {
                let uri = resource.get("uri").and_then(Value::as_str).unwrap_or("");
                match resource.get("text").and_then(Value::as_str) {
                    Some(text) => write!(f, "{uri}\n{text}"),
                    None => write!(f, "[resource: {uri}]"),
                }
            }
            Self::Other => f.write_str("[unsupported content]"),
        }
    }
}
