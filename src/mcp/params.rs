//! MCP tool parameter types.
//!
//! Defines the input schemas for MCP tools using `schemars` for automatic
//! JSON Schema generation required by the MCP protocol.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `run_task` MCP tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunTaskParams {
    /// The question or instruction.
    pub instruction: String,

    /// Path of a file the agent should work with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_file: Option<String>,

    /// Agent profile: a TOML path or `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Identifier echoed in the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Turn cap override: an integer, `-1` or `"unlimited"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<String>,

    /// Include the full agent run (transcripts of every agent) in the result.
    #[serde(default)]
    pub include_trace: bool,
}

/// Parameters for the `list_tools` MCP tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListToolsParams {
    /// Agent profile whose tool servers to query: a TOML path or `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}
