//! Tool type definitions for function-calling.
//!
//! Provides provider-agnostic types for tool definitions, calls, and results.
//! Backend tools come from the tool gateway; delegation tools are synthesized
//! per agent from its sub-agent templates and share the reserved
//! [`DELEGATION_PREFIX`].

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Reserved name prefix for delegation tools (`agent_<template>`).
pub const DELEGATION_PREFIX: &str = "agent_";

/// Name of the single argument every delegation tool takes.
pub const TASK_DESCRIPTION_ARG: &str = "task_description";

/// A tool definition that can be sent to an LLM for function-calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique within one agent's tool set).
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema object describing the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier, unique within one assistant turn.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Parsed arguments (a JSON object).
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Returns the delegation target template if this is a delegation call.
    #[must_use]
    pub fn delegation_target(&self) -> Option<&str> {
        delegation_target(&self.name)
    }

    /// Serialized argument length in bytes.
    #[must_use]
    pub fn arguments_len(&self) -> usize {
        serde_json::to_string(&self.arguments).map_or(0, |s| s.len())
    }
}

/// The result of executing a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// ID of the tool call this result corresponds to.
    pub tool_call_id: String,
    /// Result content (tool output on success, error message on failure).
    pub content: String,
    /// Whether this result represents an error.
    pub is_error: bool,
}

impl ToolResult {
    /// Successful result.
    #[must_use]
    pub fn ok(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Error result.
    #[must_use]
    pub fn error(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Returns `true` if `name` uses the reserved delegation prefix.
#[must_use]
pub fn is_delegation(name: &str) -> bool {
    name.starts_with(DELEGATION_PREFIX)
}

/// Strips the delegation prefix, returning the template name.
#[must_use]
pub fn delegation_target(name: &str) -> Option<&str> {
    name.strip_prefix(DELEGATION_PREFIX).filter(|t| !t.is_empty())
}

/// Builds the delegation tool advertised for a sub-agent template.
#[must_use]
pub fn delegation_tool(template: &str, description: &str) -> ToolDefinition {
    ToolDefinition {
        name: format!("{DELEGATION_PREFIX}{template}"),
        description: format!(
            "Delegate a self-contained subtask to the `{template}` sub-agent. {description}"
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                TASK_DESCRIPTION_ARG: {
                    "type": "string",
                    "description": "Complete, standalone description of the subtask. \
                                    The sub-agent sees nothing else from this conversation."
                }
            },
            "required": [TASK_DESCRIPTION_ARG],
            "additionalProperties": false
        }),
    }
}

/// A set of tool definitions scoped to one agent.
///
/// The main agent typically sees every backend tool plus one delegation
/// tool per sub-agent template; sub-agents see the subset their template
/// allows.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    definitions: Vec<ToolDefinition>,
}

impl ToolSet {
    /// Creates a set from definitions, dropping later duplicates by name.
    #[must_use]
    pub fn from_definitions(definitions: Vec<ToolDefinition>) -> Self {
        let mut set = Self::default();
        for def in definitions {
            set.push(def);
        }
        set
    }

    /// Adds a definition unless one with the same name exists.
    pub fn push(&mut self, def: ToolDefinition) {
        if !self.contains(&def.name) {
            self.definitions.push(def);
        }
    }

    /// Returns the tool definitions in this set.
    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    /// Returns `true` if this set contains no tools.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Returns the number of tools in this set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns `true` if a tool with this name is in the set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.iter().any(|d| d.name == name)
    }

    /// Tool names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.definitions.iter().map(|d| d.name.as_str()).collect()
    }

    /// Restricts the set to the allowed names. `None` keeps everything.
    #[must_use]
    pub fn restrict(&self, allowed: Option<&[String]>) -> Self {
        allowed.map_or_else(
            || self.clone(),
            |names| Self {
                definitions: self
                    .definitions
                    .iter()
                    .filter(|d| names.iter().any(|n| n == &d.name))
                    .cloned()
                    .collect(),
            },
        )
    }

    /// Empty tool set (no tools available).
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}
