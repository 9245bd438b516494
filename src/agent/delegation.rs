//! Sub-agent delegation.
//!
//! A delegation call (`agent_<template>`) starts a fresh orchestrator with
//! its own conversation, runs it to a terminal state on its own tokio task
//! and turns the outcome into a tool result for the parent. Only the answer
//! text crosses back; a failed or panicking child never fails the parent.
//! Dropping a spawned delegation's handle aborts the child.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};

use super::orchestrator::{AgentOrchestrator, AgentRun, RunContext, RunStatus};
use super::tool::{TASK_DESCRIPTION_ARG, ToolCall, ToolResult};
use crate::error::AgentError;

/// Outcome of one delegation.
#[derive(Debug, Clone)]
pub struct Delegated {
    /// Result spliced into the parent's transcript.
    pub result: ToolResult,
    /// The child's run, if one was started.
    pub run: Option<AgentRun>,
}

impl Delegated {
    fn rejected(call_id: &str, message: impl Into<String>) -> Self {
        Self {
            result: ToolResult::error(call_id, message),
            run: None,
        }
    }
}

/// Starts a delegation on its own task.
pub fn spawn(
    ctx: RunContext,
    parent_depth: usize,
    call: ToolCall,
) -> AbortOnDropHandle<Delegated> {
    AbortOnDropHandle::new(tokio::spawn(delegate(ctx, parent_depth, call)))
}

/// Waits for a spawned delegation. A panicked or aborted child becomes an
/// error result.
pub async fn join(handle: AbortOnDropHandle<Delegated>, call_id: &str) -> Delegated {
    match handle.await {
        Ok(delegated) => delegated,
        Err(e) => {
            let what = if e.is_panic() { "panicked" } else { "was cancelled" };
            warn!(call_id, error = %e, "sub-agent task {what}");
            Delegated::rejected(call_id, format!("sub-agent {what}; no result available"))
        }
    }
}

/// Runs the sub-agent named by `call` to completion.
pub fn delegate(ctx: RunContext, parent_depth: usize, call: ToolCall) -> BoxFuture<'static, Delegated> {
    Box::pin(async move {
        let max = ctx.config.max_delegation_depth;
        if parent_depth >= max {
            let err = AgentError::DelegationDepthExceeded {
                depth: parent_depth + 1,
                max,
            };
            return Delegated::rejected(&call.id, format!("delegation rejected: {err}"));
        }

        let Some(name) = call.delegation_target() else {
            return Delegated::rejected(&call.id, format!("not a delegation tool: {}", call.name));
        };
        let Some(template) = ctx.profile.sub_agent(name).cloned() else {
            return Delegated::rejected(&call.id, format!("unknown sub-agent: {name}"));
        };
        let Some(task) = call
            .arguments
            .get(TASK_DESCRIPTION_ARG)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            return Delegated::rejected(
                &call.id,
                format!("missing required string argument `{TASK_DESCRIPTION_ARG}`"),
            );
        };

        info!(sub_agent = name, depth = parent_depth + 1, call_id = %call.id, "delegating");
        let child = AgentOrchestrator::new(ctx, &template, parent_depth + 1, false);
        let run = child.run(task.to_string()).await;
        Delegated {
            result: to_tool_result(&call.id, &run),
            run: Some(run),
        }
    })
}

/// Text the parent sees for a finished child.
fn to_tool_result(call_id: &str, run: &AgentRun) -> ToolResult {
    match run.status {
        RunStatus::Completed => {
            let answer = run.final_answer.as_deref().unwrap_or_default().trim();
            if answer.is_empty() {
                ToolResult::ok(call_id, "(sub-agent returned an empty answer)")
            } else {
                ToolResult::ok(call_id, answer)
            }
        }
        status => {
            let reason = run
                .failure
                .map(|f| f.to_string())
                .or_else(|| run.limit.map(|l| l.as_str().to_string()))
                .unwrap_or_else(|| "unknown".to_string());
            let mut text = format!(
                "sub-agent {} ended with status {status} ({reason}) after {} turn(s)",
                run.agent_kind, run.turn_count
            );
            if let Some(error) = &run.error {
                text.push_str(": ");
                text.push_str(error);
            }
            match run.final_answer.as_deref().map(str::trim) {
                Some(partial) if !partial.is_empty() => {
                    text.push_str("\nPartial answer: ");
                    text.push_str(partial);
                }
                _ => text.push_str("\nNo partial answer."),
            }
            ToolResult::error(call_id, text)
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::conversation::Conversation;
    use crate::agent::message::TokenUsage;
    use crate::agent::orchestrator::{FailureReason, LimitKind};

    fn run(status: RunStatus) -> AgentRun {
        AgentRun {
            agent_kind: "browser".to_string(),
            depth: 1,
            turn_count: 4,
            status,
            failure: None,
            limit: None,
            error: None,
            final_answer: None,
            conversation: Conversation::default(),
            usage: TokenUsage::default(),
            sub_runs: Vec::new(),
        }
    }

    #[test]
    fn test_completed_child_returns_answer() {
        let mut child = run(RunStatus::Completed);
        child.final_answer = Some("  Paris ".to_string());
        let result = to_tool_result("c1", &child);
        assert!(!result.is_error);
        assert_eq!(result.content, "Paris");
    }

    #[test]
    fn test_failed_child_describes_failure() {
        let mut child = run(RunStatus::Failed);
        child.failure = Some(FailureReason::RetriesExhausted);
        child.error = Some("503".to_string());
        let result = to_tool_result("c1", &child);
        assert!(result.is_error);
        assert!(result.content.contains("status failed (retries_exhausted)"));
        assert!(result.content.contains("503"));
        assert!(result.content.contains("No partial answer."));
    }

    #[test]
    fn test_turn_limited_child_carries_partial_answer() {
        let mut child = run(RunStatus::TurnLimitExceeded);
        child.limit = Some(LimitKind::Turns);
        child.final_answer = Some("probably 12".to_string());
        let result = to_tool_result("c1", &child);
        assert!(result.is_error);
        assert!(result.content.contains("(turns)"));
        assert!(result.content.contains("Partial answer: probably 12"));
    }

    #[tokio::test]
    async fn test_join_converts_panics() {
        let handle = AbortOnDropHandle::<Delegated>::new(tokio::spawn(async { panic!("boom") }));
        let delegated = join(handle, "c9").await;
        assert!(delegated.result.is_error);
        assert_eq!(delegated.result.tool_call_id, "c9");
        assert!(delegated.run.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_aborts_child() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let child = tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
            Delegated::rejected("c1", "finished")
        });
        let handle = AbortOnDropHandle::new(child);
        drop(handle);
        assert!(rx.await.is_err());
    }
}
