//! Agent runtime for delve-rs.
//!
//! A main agent plans and answers; it can delegate self-contained subtasks
//! to sub-agents, which call external tools. Every agent runs the same
//! turn loop over a provider-agnostic LLM gateway.
//!
//! # Architecture
//!
//! ```text
//! Task → TaskPipeline
//!   ├── profile + tool session (MCP stdio servers)
//!   ├── input augmentation (optional, auxiliary model)
//!   ├── AgentOrchestrator (main, depth 0)
//!   │   ├── LlmGateway → LlmProvider (OpenAI | Anthropic)
//!   │   ├── ToolGateway → backend tools
//!   │   └── agent_<template> → delegation → AgentOrchestrator (sub, depth 1)
//!   ├── answer extraction (optional) + boxed-answer normalization
//!   └── TaskResult (JSON line)
//! ```

pub mod client;
pub mod config;
pub mod conversation;
pub mod delegation;
pub mod gateway;
pub mod message;
pub mod orchestrator;
pub mod pipeline;
pub mod profile;
pub mod prompt;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod runner;
pub mod tool;
pub mod trace;

// Re-export key types
pub use client::create_provider;
pub use config::{AgentConfig, ToolCallEncoding};
pub use conversation::Conversation;
pub use gateway::LlmGateway;
pub use message::{ChatMessage, ChatRequest, ChatResponse, Role, TokenUsage};
pub use orchestrator::{AgentOrchestrator, AgentRun, FailureReason, LimitKind, RunContext, RunStatus};
pub use pipeline::{Task, TaskPipeline, TaskResult, ToolGatewayFactory};
pub use profile::{AgentTemplate, AnswerFormat, Profile, ToolServerConfig};
pub use prompt::PromptSet;
pub use provider::LlmProvider;
pub use runner::{BatchRunner, BatchSummary};
pub use tool::{ToolCall, ToolDefinition, ToolResult, ToolSet};
pub use trace::{TraceEvent, TraceKind, Tracer};
