//! CLI command implementations.
//!
//! Each command returns the text to print; `main` owns stdout.

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::format_push_string)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::config::{AgentConfig, ToolCallEncoding, parse_max_turns};
use crate::agent::pipeline::{Task, TaskPipeline};
use crate::agent::profile::Profile;
use crate::agent::prompt::PromptSet;
use crate::agent::runner::{BatchRunner, read_tasks};
use crate::agent::trace::{Tracer, spawn_jsonl_sink, spawn_log_sink};
use crate::cli::output::{
    OutputFormat, format_batch_summary, format_task_result, format_tool_list,
};
#[cfg(feature = "mcp")]
use crate::cli::parser::McpCommands;
use crate::cli::parser::{AgentArgs, Cli, Commands};
use crate::error::{CommandError, Result};
use crate::tools::{McpToolSession, ToolGateway};

/// Executes the parsed command and returns its output.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the command cannot run.
/// Task failures are reported in the output, not as errors.
pub fn execute(cli: &Cli) -> Result<String> {
    let format = OutputFormat::parse(&cli.format);

    match &cli.command {
        Commands::Run {
            instruction,
            file,
            task_id,
            agent,
        } => {
            let task = Task {
                task_id: task_id.clone(),
                instruction: instruction.clone(),
                attached_file: file.clone(),
                agent_config: None,
            };
            cmd_run(task, agent, format)
        }
        Commands::Batch {
            input,
            output,
            concurrency,
            agent,
        } => cmd_batch(input, output, *concurrency, agent, format),
        Commands::Tools { profile, timeout } => cmd_tools(profile.as_deref(), *timeout, format),
        Commands::InitPrompts { dir } => cmd_init_prompts(dir.as_deref(), format),
        #[cfg(feature = "mcp")]
        Commands::Mcp(cmd) => cmd_mcp(cmd),
    }
}

/// Resolves agent options: flags, then environment, then defaults.
///
/// # Errors
///
/// Returns an error for unparseable flag values or a missing API key.
pub fn build_config(args: &AgentArgs) -> Result<AgentConfig> {
    let mut builder = AgentConfig::builder();
    if let Some(provider) = &args.provider {
        builder = builder.provider(provider);
    }
    if let Some(model) = &args.model {
        builder = builder.model(model);
    }
    if let Some(model) = &args.aux_model {
        builder = builder.aux_model(model);
    }
    if let Some(turns) = &args.max_turns {
        let turns = parse_max_turns(turns)
            .map_err(|e| CommandError::InvalidArgument(format!("--max-turns: {e}")))?;
        builder = builder.max_turns(turns);
    }
    if let Some(n) = args.max_tool_calls {
        builder = builder.max_tool_calls_per_turn(n);
    }
    if let Some(secs) = args.deadline {
        builder = builder.task_deadline(Duration::from_secs(secs));
    }
    if let Some(language) = &args.language {
        builder = builder.language(language);
    }
    if let Some(encoding) = &args.tool_call_encoding {
        let encoding = ToolCallEncoding::parse(encoding)
            .map_err(|e| CommandError::InvalidArgument(format!("--tool-call-encoding: {e}")))?;
        builder = builder.tool_call_encoding(encoding);
    }
    if args.augment {
        builder = builder.input_augmentation(true);
    }
    if args.extract {
        builder = builder.output_extraction(true);
    }
    if args.sequential_delegation {
        builder = builder.parallel_delegation(false);
    }
    if let Some(dir) = &args.prompt_dir {
        builder = builder.prompt_dir(dir);
    }
    Ok(builder.from_env().build()?)
}

fn load_profile(path: Option<&Path>) -> Result<Option<Profile>> {
    path.map(Profile::load).transpose().map_err(Into::into)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| {
        CommandError::ExecutionFailed(format!("Failed to create async runtime: {e}")).into()
    })
}

/// Exit status after a forced second interrupt (128 + SIGINT).
const FORCED_EXIT_CODE: i32 = 130;

/// Cancels `cancel` on the first Ctrl-C; exits on the second.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; stopping agents (press Ctrl-C again to exit immediately)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second interrupt received; exiting");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
}

/// Consumer of the trace channel.
enum TraceSink {
    Log(JoinHandle<u64>),
    File(JoinHandle<std::io::Result<u64>>),
}

impl TraceSink {
    fn start(trace_file: Option<&Path>, capacity: usize) -> (Tracer, Self) {
        let (tracer, rx) = Tracer::channel(capacity);
        let sink = match trace_file {
            Some(path) => Self::File(spawn_jsonl_sink(rx, path)),
            None => Self::Log(spawn_log_sink(rx)),
        };
        (tracer, sink)
    }

    /// Waits for the sink to drain. Every tracer clone must be dropped first.
    async fn finish(self) {
        match self {
            Self::Log(handle) => {
                let _ = handle.await;
            }
            Self::File(handle) => match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "trace file write failed"),
                Err(e) => warn!(error = %e, "trace sink died"),
            },
        }
    }
}

fn build_pipeline(
    config: AgentConfig,
    profile: Option<Profile>,
    tracer: Tracer,
    cancel: CancellationToken,
) -> Result<TaskPipeline> {
    let mut pipeline = TaskPipeline::from_config(config)?
        .with_tracer(tracer)
        .with_cancel(cancel);
    if let Some(profile) = profile {
        pipeline = pipeline.with_profile(profile);
    }
    Ok(pipeline)
}

fn cmd_run(task: Task, args: &AgentArgs, format: OutputFormat) -> Result<String> {
    let config = build_config(args)?;
    let profile = load_profile(args.profile.as_deref())?;
    let rt = runtime()?;

    let result = rt.block_on(async {
        let cancel = CancellationToken::new();
        spawn_interrupt_handler(cancel.clone());
        let (tracer, sink) = TraceSink::start(args.trace_file.as_deref(), config.trace_capacity);
        let pipeline = build_pipeline(config, profile, tracer, cancel)?;

        let result = pipeline.run(task).await;
        drop(pipeline);
        sink.finish().await;
        Result::Ok(result)
    })?;

    Ok(format_task_result(&result, format))
}

fn cmd_batch(
    input: &Path,
    output: &Path,
    concurrency: Option<usize>,
    args: &AgentArgs,
    format: OutputFormat,
) -> Result<String> {
    let config = build_config(args)?;
    let profile = load_profile(args.profile.as_deref())?;
    let tasks = read_tasks(input)?;
    let rt = runtime()?;

    let summary = rt.block_on(async {
        let cancel = CancellationToken::new();
        spawn_interrupt_handler(cancel.clone());
        let (tracer, sink) = TraceSink::start(args.trace_file.as_deref(), config.trace_capacity);
        let pipeline = build_pipeline(config, profile, tracer, cancel)?;

        let mut runner = BatchRunner::new(Arc::new(pipeline));
        if let Some(n) = concurrency {
            runner = runner.with_concurrency(n);
        }
        let mut file = tokio::fs::File::create(output).await.map_err(|e| {
            CommandError::ExecutionFailed(format!(
                "Failed to create {}: {e}",
                output.display()
            ))
        })?;

        let summary = runner.run(tasks, &mut file).await;
        drop(runner);
        sink.finish().await;
        summary
    })?;

    Ok(format_batch_summary(&summary, output, format))
}

fn cmd_tools(profile: Option<&Path>, timeout_secs: u64, format: OutputFormat) -> Result<String> {
    let profile = load_profile(profile)?.unwrap_or_else(Profile::builtin);
    if profile.tool_servers.is_empty() {
        return Ok(format_tool_list(&[], &[], format));
    }
    let rt = runtime()?;

    let (tools, errors) = rt.block_on(async {
        let session =
            McpToolSession::open(&profile.tool_servers, Duration::from_secs(timeout_secs)).await;
        let tools = session.list_tools().await;
        let errors = session.startup_errors().to_vec();
        session.shutdown().await;
        (tools, errors)
    });
    info!(tools = tools.len(), errors = errors.len(), "tool discovery finished");

    Ok(format_tool_list(&tools, &errors, format))
}

fn cmd_init_prompts(dir: Option<&Path>, format: OutputFormat) -> Result<String> {
    let target_dir = dir
        .map(PathBuf::from)
        .or_else(PromptSet::default_dir)
        .ok_or_else(|| {
            CommandError::ExecutionFailed(
                "Could not determine home directory for default prompt path".to_string(),
            )
        })?;

    let written = PromptSet::write_defaults(&target_dir).map_err(|e| {
        CommandError::ExecutionFailed(format!("Failed to write prompt templates: {e}"))
    })?;

    match format {
        OutputFormat::Text => {
            if written.is_empty() {
                Ok(format!(
                    "All prompt templates already exist in: {}\n",
                    target_dir.display()
                ))
            } else {
                let mut output = format!(
                    "Wrote {} prompt template(s) to: {}\n",
                    written.len(),
                    target_dir.display()
                );
                for path in &written {
                    output.push_str(&format!(
                        "  {}\n",
                        path.file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("unknown")
                    ));
                }
                output.push_str("\nPass --prompt-dir or set DELVE_PROMPT_DIR to use them.\n");
                Ok(output)
            }
        }
        OutputFormat::Json | OutputFormat::Ndjson => {
            let json = serde_json::json!({
                "directory": target_dir,
                "written": written,
            });
            Ok(format.to_json(&json))
        }
    }
}

#[cfg(feature = "mcp")]
fn cmd_mcp(cmd: &McpCommands) -> Result<String> {
    use crate::mcp::{DelveMcpServer, serve_sse, serve_stdio};

    let server = DelveMcpServer::from_env().map_err(|e| {
        CommandError::ExecutionFailed(format!("Failed to create MCP server: {e}"))
    })?;

    let rt = runtime()?;

    rt.block_on(async {
        match cmd {
            McpCommands::Stdio => serve_stdio(server).await,
            McpCommands::Sse { host, port } => serve_sse(server, host, *port).await,
        }
    })
    .map_err(|e| CommandError::ExecutionFailed(format!("MCP server error: {e}")))?;

    Ok(String::new())
}
