//! Batch runner: one flushed JSON line per task, whatever happens.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{MockTools, RoutedProvider, ScriptedProvider, ToolMode, config, pipeline, text};
use delve::agent::orchestrator::{FailureReason, RunStatus};
use delve::agent::pipeline::{Task, TaskResult};
use delve::agent::runner::{BatchRunner, parse_tasks};
use delve::agent::trace::{TraceKind, Tracer};
use tokio_util::sync::CancellationToken;

fn records(output: &[u8]) -> Vec<TaskResult> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap_or_else(|e| unreachable!("{e}: {line}")))
        .collect()
}

fn tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| Task::new(format!("t{i}"), format!("question {i}")))
        .collect()
}

#[tokio::test]
async fn every_task_yields_one_record() {
    let provider = ScriptedProvider::new(Vec::new());
    let tools = MockTools::new(ToolMode::Echo);
    let runner = BatchRunner::new(Arc::new(pipeline(config(), provider, &tools))).with_concurrency(2);

    let mut output = Vec::new();
    let summary = runner
        .run(tasks(5), &mut output)
        .await
        .unwrap_or_else(|e| unreachable!("{e}"));

    assert_eq!(summary.total, 5);
    assert_eq!(summary.completed, 5);
    let records = records(&output);
    let ids: BTreeSet<String> = records.iter().map(|r| r.task_id.clone()).collect();
    assert_eq!(ids.len(), 5);
    assert!(records.iter().all(|r| r.final_answer.as_deref() == Some("fallback")));
    assert_eq!(tools.shutdowns(), 5);
}

#[tokio::test]
async fn cancelled_batch_still_records_every_task() {
    let provider = ScriptedProvider::new(Vec::new());
    let tools = MockTools::new(ToolMode::Echo);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let runner = BatchRunner::new(Arc::new(
        pipeline(config(), provider.clone(), &tools).with_cancel(cancel),
    ));

    let mut output = Vec::new();
    let summary = runner
        .run(tasks(3), &mut output)
        .await
        .unwrap_or_else(|e| unreachable!("{e}"));

    assert_eq!(summary.total, 3);
    assert_eq!(summary.failed, 3);
    assert_eq!(provider.calls(), 0);
    let records = records(&output);
    assert_eq!(records.len(), 3);
    assert!(
        records
            .iter()
            .all(|r| r.status == RunStatus::Failed && r.failure == Some(FailureReason::Cancelled))
    );
}

#[tokio::test]
async fn one_defective_task_does_not_affect_siblings() {
    let provider = RoutedProvider::new(|request| {
        assert!(
            !common::last_user_text(request).contains("question 1"),
            "defect in task t1"
        );
        (Duration::ZERO, Ok(text("\\boxed{ok}")))
    });
    let tools = MockTools::new(ToolMode::Echo);
    let runner = BatchRunner::new(Arc::new(pipeline(config(), provider, &tools)));

    let mut output = Vec::new();
    let summary = runner
        .run(tasks(3), &mut output)
        .await
        .unwrap_or_else(|e| unreachable!("{e}"));

    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    let failed: Vec<_> = records(&output)
        .into_iter()
        .filter(|r| r.status == RunStatus::Failed)
        .map(|r| r.task_id)
        .collect();
    assert_eq!(failed, vec!["t1"]);
}

#[tokio::test]
async fn trace_events_reach_the_channel() {
    let (tracer, mut rx) = Tracer::channel(256);
    let provider = ScriptedProvider::new(vec![Ok(common::echo_calls(1)), Ok(text("\\boxed{x}"))]);
    let tools = MockTools::new(ToolMode::Echo);
    let pipeline = pipeline(config(), provider, &tools).with_tracer(tracer);

    let result = pipeline.run(Task::new("traced", "q")).await;
    assert_eq!(result.status, RunStatus::Completed);
    drop(pipeline);

    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        assert_eq!(event.task_id, "traced");
        kinds.push(event.kind);
    }
    let turns = kinds.iter().filter(|k| matches!(k, TraceKind::Turn { .. })).count();
    let completions = kinds
        .iter()
        .filter(|k| matches!(k, TraceKind::LlmCompletion { .. }))
        .count();
    assert_eq!(turns, 2);
    assert_eq!(completions, 2);
    assert!(kinds.iter().any(|k| matches!(k, TraceKind::ToolCall { tool, .. } if tool == "echo")));
    assert!(matches!(
        kinds.last(),
        Some(TraceKind::RunFinished {
            status: RunStatus::Completed,
            turns: 2
        })
    ));
}

#[test]
fn task_file_round_trips_through_parser() {
    let input = r#"{"task_id":"q1","question":"What?","file_name":"a.pdf"}

{"instruction":"No id"}
"#;
    let tasks = parse_tasks(input.as_bytes()).unwrap_or_else(|e| unreachable!("{e}"));
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].attached_file.as_deref(), Some("a.pdf"));
    assert_eq!(tasks[1].task_id, "task-3");
}
