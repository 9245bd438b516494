//! Output formatting for CLI results.

use std::fmt::Write as _;

use serde::Serialize;

use crate::agent::pipeline::TaskResult;
use crate::agent::runner::BatchSummary;
use crate::agent::tool::ToolDefinition;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
    /// One compact JSON document per line.
    Ndjson,
}

impl OutputFormat {
    /// Parses a format name; unknown names fall back to text.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "ndjson" | "jsonl" => Self::Ndjson,
            _ => Self::Text,
        }
    }

    /// Serializes `value` for this format. Text falls back to pretty JSON.
    #[must_use]
    pub fn to_json<T: Serialize>(self, value: &T) -> String {
        let rendered = match self {
            Self::Ndjson => serde_json::to_string(value),
            Self::Text | Self::Json => serde_json::to_string_pretty(value),
        };
        rendered.unwrap_or_else(|e| format!("{{\"error\":\"serialization failed: {e}\"}}"))
    }
}

/// Formats one task result.
#[must_use]
pub fn format_task_result(result: &TaskResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => format.to_json(result),
        OutputFormat::Text => {
            let mut output = result
                .final_answer
                .clone()
                .unwrap_or_else(|| "(no answer)".to_string());
            let (turns, sub_agents) = result
                .trace
                .as_ref()
                .map_or((0, 0), |t| (t.turn_count, t.sub_runs.len()));
            let _ = write!(
                output,
                "\n\n---\nStatus: {} | Turns: {turns} | Sub-agents: {sub_agents} | Tokens: {} | Time: {:.1}s",
                result.status, result.usage.total_tokens, result.elapsed_secs
            );
            if let Some(failure) = result.failure {
                let _ = write!(output, "\nFailure: {failure}");
            }
            if let Some(error) = &result.error {
                let _ = write!(output, "\nError: {error}");
            }
            output.push('\n');
            output
        }
    }
}

/// Formats a batch summary.
#[must_use]
pub fn format_batch_summary(
    summary: &BatchSummary,
    output_path: &std::path::Path,
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => format.to_json(summary),
        OutputFormat::Text => {
            let mut output = format!(
                "Wrote {} result(s) to {}\n  completed: {}\n  failed: {}\n  turn limit exceeded: {}\n",
                summary.total,
                output_path.display(),
                summary.completed,
                summary.failed,
                summary.turn_limit_exceeded
            );
            if summary.dropped_trace_events > 0 {
                let _ = writeln!(
                    output,
                    "  trace events dropped: {}",
                    summary.dropped_trace_events
                );
            }
            output
        }
    }
}

/// Formats discovered tools plus any server startup errors.
#[must_use]
pub fn format_tool_list(
    tools: &[ToolDefinition],
    errors: &[String],
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Ndjson => format.to_json(&serde_json::json!({
            "tools": tools,
            "errors": errors,
        })),
        OutputFormat::Text => {
            let mut output = String::new();
            if tools.is_empty() {
                output.push_str("No tools discovered.\n");
            } else {
                let _ = writeln!(output, "{} tool(s):", tools.len());
                for tool in tools {
                    let summary = tool.description.lines().next().unwrap_or_default();
                    let _ = writeln!(output, "  {:<28} {summary}", tool.name);
                }
            }
            for error in errors {
                let _ = writeln!(output, "Server error: {error}");
            }
            output
        }
    }
}
