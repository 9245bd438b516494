//! MCP (Model Context Protocol) server for delve.
//!
//! Exposes the task pipeline as an MCP server so other agents can hand
//! research questions to delve.
//!
//! # Feature Gate
//!
//! This module requires the `mcp` feature flag (enabled by default):
//! ```toml
//! [dependencies]
//! delve-rs = { version = "...", features = ["mcp"] }
//! ```
//!
//! # Architecture
//!
//! ```text
//! MCP Client
//!   ↓ run_task(instruction, attached_file, profile)
//! DelveMcpServer
//!   ↓ per-call TaskPipeline (shared provider)
//! TaskPipeline::run()
//!   ├── main agent + sub-agents
//!   └── tool servers from the profile
//!   ↓
//! TaskResult JSON → MCP Client
//! ```

pub mod params;
pub mod server;
pub mod transport;

pub use params::{ListToolsParams, RunTaskParams};
pub use server::DelveMcpServer;
pub use transport::{serve_sse, serve_stdio};
