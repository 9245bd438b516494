//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// delve: deep research agent runtime.
///
/// Runs a main agent that plans, calls MCP tools and delegates subtasks to
/// sub-agents, then reports a benchmark-formatted answer.
#[derive(Parser, Debug)]
#[command(name = "delve")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json, ndjson).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one task and print its answer.
    #[command(after_help = r#"Examples:
  delve run "What is the capital of Australia?"
  delve run "Summarize the attached report" --file ./report.pdf --profile ./research.toml
  delve run "..." --max-turns unlimited --language German
  delve --format json run "..." | jq '.final_answer'
"#)]
    Run {
        /// The question or instruction.
        instruction: String,

        /// File attached to the task.
        #[arg(short, long)]
        file: Option<String>,

        /// Task identifier echoed in the result.
        #[arg(long, default_value = "cli")]
        task_id: String,

        /// Agent options.
        #[command(flatten)]
        agent: AgentArgs,
    },

    /// Run a JSONL task file and write one JSON result per line.
    #[command(after_help = r#"Examples:
  delve batch tasks.jsonl --output results.jsonl
  delve batch tasks.jsonl -o results.jsonl -j 8 --trace-file trace.jsonl

Each input line: {"task_id": "...", "instruction": "...", "attached_file": "...", "agent_config": "profile.toml"}
"#)]
    Batch {
        /// Input task file (JSONL).
        input: PathBuf,

        /// Output result file (JSONL).
        #[arg(short, long)]
        output: PathBuf,

        /// Concurrent tasks.
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Agent options.
        #[command(flatten)]
        agent: AgentArgs,
    },

    /// Connect to a profile's tool servers and list their tools.
    #[command(after_help = r#"Examples:
  delve tools --profile ./research.toml
  delve --format json tools --profile ./research.toml
"#)]
    Tools {
        /// Agent profile (TOML).
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Per-request timeout in seconds.
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Write the default prompt templates for customization.
    ///
    /// Existing files are never overwritten.
    InitPrompts {
        /// Target directory (defaults to ~/.config/delve/prompts).
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Start MCP (Model Context Protocol) server.
    #[cfg(feature = "mcp")]
    #[command(subcommand)]
    Mcp(McpCommands),
}

/// Options shared by commands that run agents.
///
/// Unset options fall back to `DELVE_*` environment variables, then to
/// built-in defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Agent profile (TOML) for tasks that name none.
    #[arg(short, long)]
    pub profile: Option<PathBuf>,

    /// LLM provider (openai, anthropic).
    #[arg(long)]
    pub provider: Option<String>,

    /// Default model.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Model for augmentation and extraction.
    #[arg(long)]
    pub aux_model: Option<String>,

    /// Turn cap: a number, -1 or "unlimited".
    #[arg(long, allow_hyphen_values = true)]
    pub max_turns: Option<String>,

    /// Tool calls executed per turn.
    #[arg(long)]
    pub max_tool_calls: Option<usize>,

    /// Task deadline in seconds.
    #[arg(long)]
    pub deadline: Option<u64>,

    /// Working language for agent output.
    #[arg(long)]
    pub language: Option<String>,

    /// Tool-call encoding (native, inline).
    #[arg(long)]
    pub tool_call_encoding: Option<String>,

    /// Generate hints for the instruction before running.
    #[arg(long)]
    pub augment: bool,

    /// Extract the canonical answer with the auxiliary model.
    #[arg(long)]
    pub extract: bool,

    /// Run delegations of one turn one after another.
    #[arg(long)]
    pub sequential_delegation: bool,

    /// Directory containing prompt template files.
    #[arg(long)]
    pub prompt_dir: Option<PathBuf>,

    /// Append trace events to this JSONL file.
    #[arg(long)]
    pub trace_file: Option<PathBuf>,
}

/// MCP server transport subcommands.
#[cfg(feature = "mcp")]
#[derive(Subcommand, Debug)]
pub enum McpCommands {
    /// Start MCP server with stdio transport.
    ///
    /// Reads JSON-RPC messages from stdin, writes responses to stdout.
    #[command(after_help = r#"Examples:
  delve mcp stdio
  OPENAI_API_KEY=sk-... delve mcp stdio
"#)]
    Stdio,

    /// Start MCP server with streamable HTTP transport.
    #[command(after_help = r#"Examples:
  delve mcp sse                            # Listen on 127.0.0.1:3000
  delve mcp sse --host 0.0.0.0 --port 8080
"#)]
    Sse {
        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on.
        #[arg(long, default_value = "3000")]
        port: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_with_unlimited_turns() {
        let cli = Cli::try_parse_from([
            "delve",
            "run",
            "what?",
            "--max-turns",
            "-1",
            "--file",
            "a.pdf",
        ])
        .unwrap_or_else(|e| unreachable!("{e}"));
        let Commands::Run {
            instruction,
            file,
            agent,
            ..
        } = cli.command
        else {
            unreachable!()
        };
        assert_eq!(instruction, "what?");
        assert_eq!(file.as_deref(), Some("a.pdf"));
        assert_eq!(agent.max_turns.as_deref(), Some("-1"));
    }

    #[test]
    fn test_global_format_after_subcommand() {
        let cli = Cli::try_parse_from(["delve", "init-prompts", "--format", "json"])
            .unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(cli.format, "json");
    }

    #[test]
    fn test_batch_requires_output() {
        assert!(Cli::try_parse_from(["delve", "batch", "tasks.jsonl"]).is_err());
    }
}
