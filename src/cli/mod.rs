//! CLI layer for delve.
//!
//! Provides the command-line interface using clap: single tasks, batch
//! files, tool discovery, prompt scaffolding and the MCP server.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::execute;
pub use output::OutputFormat;
#[cfg(feature = "mcp")]
pub use parser::McpCommands;
pub use parser::{AgentArgs, Cli, Commands};
