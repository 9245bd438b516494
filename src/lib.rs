//! # delve
//!
//! Deep research agent runtime: a main agent plans, calls external tools
//! over MCP and delegates self-contained subtasks to sub-agents, then
//! commits to a benchmark-formatted (`\boxed{}`) answer.
//!
//! ## Overview
//!
//! A [`Task`](agent::Task) goes through a [`TaskPipeline`](agent::TaskPipeline):
//! profile and tool session setup, optional input augmentation, the main
//! agent's turn loop, optional answer extraction and deterministic answer
//! normalization. Every task yields exactly one
//! [`TaskResult`](agent::TaskResult), whatever goes wrong.
//!
//! ## Modules
//!
//! - [`agent`]: LLM gateway, orchestrator, delegation, pipeline, batch runner
//! - [`tools`]: tool gateway and the MCP stdio client
//! - [`core`]: pure text primitives (balanced scanning, boxed answers)
//! - [`cli`]: command-line interface
//! - [`mcp`]: MCP server exposing the pipeline (feature `mcp`)
//! - [`error`]: error types
//!
//! ## Example
//!
//! ```no_run
//! use delve::agent::{AgentConfig, Task, TaskPipeline};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::builder().from_env().build()?;
//! let pipeline = TaskPipeline::from_config(config)?;
//! let result = pipeline
//!     .run(Task::new("t1", "What is the boiling point of water in Kelvin?"))
//!     .await;
//! assert_eq!(result.task_id, "t1");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cli;
pub mod core;
pub mod error;
#[cfg(feature = "mcp")]
pub mod mcp;
pub mod tools;

pub use agent::{
    AgentConfig, AgentRun, BatchRunner, BatchSummary, Profile, RunStatus, Task, TaskPipeline,
    TaskResult,
};
pub use error::{AgentError, CommandError, Error, LlmError, Result};
pub use tools::{ToolGateway, ToolOutput};
