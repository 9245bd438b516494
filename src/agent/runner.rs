//! Batch execution of JSONL task files.
//!
//! Tasks run concurrently under a semaphore. Each result is written as one
//! JSON line and flushed as soon as it is available, so an interrupted
//! batch keeps everything finished so far. Every submitted task yields
//! exactly one record, including tasks cancelled before they started.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info};

use super::orchestrator::{FailureReason, RunStatus};
use super::pipeline::{Task, TaskPipeline, TaskResult};
use crate::error::{AgentError, Result};

/// Reads tasks from a JSONL file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line is not a task.
pub fn read_tasks(path: &Path) -> Result<Vec<Task>> {
    let file = std::fs::File::open(path)?;
    parse_tasks(std::io::BufReader::new(file))
}

/// Parses JSONL tasks, skipping blank lines. Tasks without an id get
/// `task-<line>`.
///
/// # Errors
///
/// Returns [`AgentError::Config`] naming the first bad line.
pub fn parse_tasks(reader: impl BufRead) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut task: Task = serde_json::from_str(&line).map_err(|e| AgentError::Config {
            message: format!("task line {line_no}: {e}"),
        })?;
        if task.task_id.trim().is_empty() {
            task.task_id = format!("task-{line_no}");
        }
        tasks.push(task);
    }
    Ok(tasks)
}

/// Counts by terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Records written.
    pub total: usize,
    /// Completed tasks.
    pub completed: usize,
    /// Failed tasks.
    pub failed: usize,
    /// Tasks stopped by a turn or deadline limit.
    pub turn_limit_exceeded: usize,
    /// Trace events dropped because the consumer lagged.
    pub dropped_trace_events: u64,
}

impl BatchSummary {
    fn record(&mut self, status: RunStatus) {
        self.total += 1;
        match status {
            RunStatus::Completed => self.completed += 1,
            RunStatus::TurnLimitExceeded => self.turn_limit_exceeded += 1,
            RunStatus::Failed | RunStatus::Running => self.failed += 1,
        }
    }
}

/// Runs many tasks through one pipeline.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    pipeline: Arc<TaskPipeline>,
    max_concurrency: usize,
}

impl BatchRunner {
    /// Uses the pipeline's configured concurrency.
    #[must_use]
    pub fn new(pipeline: Arc<TaskPipeline>) -> Self {
        let max_concurrency = pipeline.config().max_concurrency;
        Self {
            pipeline,
            max_concurrency,
        }
    }

    /// Overrides the number of concurrent tasks.
    #[must_use]
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Runs every task and writes one JSON line per result, in completion
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error only if writing to `writer` fails.
    pub async fn run<W>(&self, tasks: Vec<Task>, writer: &mut W) -> Result<BatchSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let total = tasks.len();
        info!(tasks = total, concurrency = self.max_concurrency, "batch started");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskResult>();
        let mut handles = Vec::with_capacity(total);

        for task in tasks {
            let sem = Arc::clone(&semaphore);
            let pipeline = Arc::clone(&self.pipeline);
            let tx = tx.clone();
            let task_id = task.task_id.clone();

            let handle = AbortOnDropHandle::new(tokio::spawn(async move {
                let queued = Instant::now();
                let result = match sem.acquire_owned().await {
                    Ok(_permit) if pipeline.cancel_token().is_cancelled() => TaskResult::failed(
                        &task.task_id,
                        FailureReason::Cancelled,
                        "cancelled before start",
                        queued.elapsed(),
                    ),
                    Ok(_permit) => pipeline.run(task).await,
                    Err(e) => TaskResult::failed(
                        &task.task_id,
                        FailureReason::Fatal,
                        format!("semaphore closed: {e}"),
                        queued.elapsed(),
                    ),
                };
                let _ = tx.send(result);
            }));
            handles.push((task_id, handle));
        }
        drop(tx);

        let mut summary = BatchSummary::default();
        while let Some(result) = rx.recv().await {
            write_result(writer, &result).await?;
            summary.record(result.status);
            info!(
                task_id = %result.task_id,
                status = %result.status,
                done = summary.total,
                total,
                "task recorded"
            );
        }

        for (task_id, handle) in handles {
            if let Err(e) = handle.await {
                error!(task_id = %task_id, error = %e, "task runner died");
                let result = TaskResult::failed(
                    &task_id,
                    FailureReason::Fatal,
                    format!("task runner died: {e}"),
                    std::time::Duration::ZERO,
                );
                write_result(writer, &result).await?;
                summary.record(result.status);
            }
        }

        summary.dropped_trace_events = self.pipeline.tracer().dropped();
        info!(
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            turn_limit_exceeded = summary.turn_limit_exceeded,
            "batch finished"
        );
        Ok(summary)
    }
}

async fn write_result<W>(writer: &mut W, result: &TaskResult) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut line = serde_json::to_vec(result)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
