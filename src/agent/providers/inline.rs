//! Inline tool-call encoding.
//!
//! For OpenAI-compatible servers without native function calling, tool
//! calls travel as text:
//!
//! ```text
//! <tool_call>{"name": "search", "arguments": {"query": "..."}}</tool_call>
//! ```
//!
//! The request side renders the tool catalogue into the system prompt,
//! re-encodes past calls as text and turns tool results into user turns.
//! The response side extracts the tagged JSON with the balanced scanner so
//! braces inside argument strings do not end the object early.

use std::fmt::Write;

use serde_json::json;

use super::parse_arguments;
use crate::agent::message::{ChatMessage, Role, user_message};
use crate::agent::tool::{ToolCall, ToolDefinition};
use crate::core::find_json_object;
use crate::error::LlmError;

/// Opening tag of an inline tool call.
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
/// Closing tag of an inline tool call.
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Renders the tool catalogue and calling convention for the system prompt.
#[must_use]
pub fn render_tool_catalogue(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "\n\n# Tools\n\nYou may call one or more tools. For each call, output a JSON object \
         inside tags, exactly like:\n<tool_call>{\"name\": \"<tool-name>\", \"arguments\": \
         {<arguments>}}</tool_call>\nTool results are returned in <tool_response> tags in the \
         next user message.\n\nAvailable tools:\n",
    );
    for tool in tools {
        let sig = json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        });
        let _ = writeln!(out, "{sig}");
    }
    out
}

/// Encodes one call as inline text.
#[must_use]
pub fn encode_call(call: &ToolCall) -> String {
    let body = json!({ "name": call.name, "arguments": call.arguments });
    format!("{TOOL_CALL_OPEN}{body}{TOOL_CALL_CLOSE}")
}

/// Rewrites a native transcript into the inline convention.
///
/// The catalogue is appended to the system message, assistant tool calls
/// become tagged text, and consecutive tool results are merged into a
/// single user message.
#[must_use]
pub fn encode_messages(messages: &[ChatMessage], tools: &[ToolDefinition]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut pending_results = String::new();

    let flush = |out: &mut Vec<ChatMessage>, pending: &mut String| {
        if !pending.is_empty() {
            out.push(user_message(pending.trim_end()));
            pending.clear();
        }
    };

    for msg in messages {
        match msg.role {
            Role::Tool => {
                let status = if msg.is_error { " status=\"error\"" } else { "" };
                let _ = write!(
                    pending_results,
                    "<tool_response id=\"{}\"{status}>\n{}\n</tool_response>\n",
                    msg.tool_call_id.as_deref().unwrap_or_default(),
                    msg.content
                );
            }
            Role::System => {
                flush(&mut out, &mut pending_results);
                let mut sys = msg.clone();
                if !tools.is_empty() {
                    sys.content.push_str(&render_tool_catalogue(tools));
                }
                out.push(sys);
            }
            Role::Assistant => {
                flush(&mut out, &mut pending_results);
                let mut text = msg.content.clone();
                for call in &msg.tool_calls {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&encode_call(call));
                }
                let mut assistant = msg.clone();
                assistant.content = text;
                assistant.tool_calls = Vec::new();
                out.push(assistant);
            }
            Role::User => {
                flush(&mut out, &mut pending_results);
                out.push(msg.clone());
            }
        }
    }
    flush(&mut out, &mut pending_results);
    out
}

/// Extracts inline tool calls from response text.
///
/// Returns the text with every tagged call removed, plus the calls in order.
/// Call ids are left empty for the gateway to assign. A missing closing tag
/// is tolerated (generation often stops on it).
///
/// # Errors
///
/// Returns [`LlmError::Malformed`] if a tag does not contain a JSON object
/// with a string `name`.
pub fn parse_tool_calls(text: &str) -> Result<(String, Vec<ToolCall>), LlmError> {
    let mut calls = Vec::new();
    let mut remaining = String::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find(TOOL_CALL_OPEN) {
        let open = cursor + rel;
        remaining.push_str(&text[cursor..open]);
        let body_start = open + TOOL_CALL_OPEN.len();

        let close_tag = text[body_start..]
            .find(TOOL_CALL_CLOSE)
            .map(|r| body_start + r);
        let (obj_start, obj_end) = find_json_object(text, body_start)
            .filter(|&(start, end)| {
                close_tag.is_none_or(|c| end <= c)
                    && text[body_start..start].trim().is_empty()
            })
            .ok_or_else(|| LlmError::Malformed {
                message: format!(
                    "tool_call tag without a JSON object: {}",
                    truncate(&text[body_start..], 200)
                ),
            })?;

        calls.push(decode_call(&text[obj_start..obj_end])?);

        cursor = match close_tag {
            Some(c) => c + TOOL_CALL_CLOSE.len(),
            None => obj_end,
        };
    }
    remaining.push_str(&text[cursor..]);

    Ok((remaining.trim().to_string(), calls))
}

fn decode_call(raw: &str) -> Result<ToolCall, LlmError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| LlmError::Malformed {
        message: format!("invalid tool_call JSON: {e}"),
    })?;
    let name = value
        .get("name")
        .and_then(serde_json::Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| LlmError::Malformed {
            message: "tool_call missing string field `name`".to_string(),
        })?
        .to_string();
    let arguments = match value.get("arguments").or_else(|| value.get("parameters")) {
        None | Some(serde_json::Value::Null) => json!({}),
        Some(serde_json::Value::String(s)) => parse_arguments(&name, s)?,
        Some(v @ serde_json::Value::Object(_)) => v.clone(),
        Some(other) => {
            return Err(LlmError::Malformed {
                message: format!("arguments for tool {name} must be an object, got {other}"),
            });
        }
    };
    Ok(ToolCall {
        id: String::new(),
        name,
        arguments,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
