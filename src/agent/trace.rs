//! Structured trace side channel.
//!
//! Agents emit one [`TraceEvent`] per turn, LLM completion, tool call and
//! delegation. Emission never blocks: events go through a bounded channel
//! with `try_send`, and events that do not fit are dropped and counted.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::message::TokenUsage;
use super::orchestrator::RunStatus;

/// One trace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Task the agent belongs to.
    pub task_id: String,
    /// Agent kind (`main` or template name).
    pub agent: String,
    /// Delegation depth of the agent.
    pub depth: usize,
    /// Event payload.
    #[serde(flatten)]
    pub kind: TraceKind,
}

/// Trace event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceKind {
    /// A turn started.
    Turn {
        /// 1-based turn index.
        turn: usize,
    },
    /// An LLM call finished, successfully or not.
    LlmCompletion {
        /// Turn index.
        turn: usize,
        /// Wall time including retries.
        latency_ms: u64,
        /// Attempts made.
        attempts: u32,
        /// Tool calls requested.
        tool_calls: usize,
        /// Token usage of the successful attempt.
        usage: TokenUsage,
        /// Error kind when the call failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A backend tool call finished.
    ToolCall {
        /// Turn index.
        turn: usize,
        /// Tool name.
        tool: String,
        /// Call id.
        call_id: String,
        /// Arguments as sent.
        arguments: Value,
        /// Result length in bytes.
        result_len: usize,
        /// Wall time.
        latency_ms: u64,
        /// Whether the result is an error.
        is_error: bool,
    },
    /// A delegated sub-agent finished.
    Delegation {
        /// Turn index.
        turn: usize,
        /// Sub-agent template.
        template: String,
        /// Call id.
        call_id: String,
        /// Terminal status of the child.
        status: RunStatus,
        /// Wall time.
        latency_ms: u64,
    },
    /// An agent reached a terminal state.
    RunFinished {
        /// Terminal status.
        status: RunStatus,
        /// Turns used.
        turns: usize,
    },
}

/// Cheap, cloneable handle for emitting events.
#[derive(Debug, Clone)]
pub struct Tracer {
    tx: Option<mpsc::Sender<TraceEvent>>,
    dropped: Arc<AtomicU64>,
    task_id: String,
    agent: String,
    depth: usize,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Tracer {
    /// Creates a tracer and the receiving end of its channel.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TraceEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let tracer = Self {
            tx: Some(tx),
            ..Self::disabled()
        };
        (tracer, rx)
    }

    /// A tracer that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
            task_id: String::new(),
            agent: String::new(),
            depth: 0,
        }
    }

    /// Same channel, scoped to a task.
    #[must_use]
    pub fn for_task(&self, task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            ..self.clone()
        }
    }

    /// Same channel and task, scoped to an agent.
    #[must_use]
    pub fn for_agent(&self, agent: &str, depth: usize) -> Self {
        Self {
            agent: agent.to_string(),
            depth,
            ..self.clone()
        }
    }

    /// Emits an event without waiting.
    pub fn emit(&self, kind: TraceKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = TraceEvent {
            task_id: self.task_id.clone(),
            agent: self.agent.clone(),
            depth: self.depth,
            kind,
        };
        if tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped so far across every clone of this tracer.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumes events into `tracing` at debug level. Returns the event count.
pub fn spawn_log_sink(mut rx: mpsc::Receiver<TraceEvent>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut count = 0;
        while let Some(event) = rx.recv().await {
            count += 1;
            match serde_json::to_string(&event) {
                Ok(line) => debug!(target: "delve::trace", "{line}"),
                Err(e) => debug!(target: "delve::trace", error = %e, "unserializable trace event"),
            }
        }
        count
    })
}

/// Appends events to a JSONL file. Returns the event count.
pub fn spawn_jsonl_sink(
    mut rx: mpsc::Receiver<TraceEvent>,
    path: &Path,
) -> JoinHandle<std::io::Result<u64>> {
    let path = path.to_path_buf();
    tokio::spawn(async move {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut count = 0;
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            file.write_all(&line).await?;
            count += 1;
        }
        file.flush().await?;
        info!(path = %path.display(), events = count, "trace file closed");
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_scopes_events() {
        let (tracer, mut rx) = Tracer::channel(8);
        let agent = tracer.for_task("t1").for_agent("browser", 1);
        agent.emit(TraceKind::Turn { turn: 1 });
        let event = rx.recv().await.unwrap_or_else(|| unreachable!());
        assert_eq!(event.task_id, "t1");
        assert_eq!(event.agent, "browser");
        assert_eq!(event.depth, 1);
        assert_eq!(event.kind, TraceKind::Turn { turn: 1 });
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let (tracer, _rx) = Tracer::channel(1);
        for turn in 0..5 {
            tracer.emit(TraceKind::Turn { turn });
        }
        assert_eq!(tracer.dropped(), 4);
        assert_eq!(tracer.for_agent("x", 0).dropped(), 4);
    }

    #[test]
    fn test_disabled_is_silent() {
        let tracer = Tracer::disabled();
        tracer.emit(TraceKind::Turn { turn: 1 });
        assert_eq!(tracer.dropped(), 0);
    }

    #[test]
    fn test_event_serialization_is_flat() {
        let event = TraceEvent {
            task_id: "t".to_string(),
            agent: "main".to_string(),
            depth: 0,
            kind: TraceKind::RunFinished {
                status: RunStatus::Completed,
                turns: 2,
            },
        };
        let json = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(json["event"], "run_finished");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["turns"], 2);
    }

    #[tokio::test]
    async fn test_jsonl_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("trace.jsonl");
        let (tracer, rx) = Tracer::channel(8);
        let sink = spawn_jsonl_sink(rx, &path);
        tracer.emit(TraceKind::Turn { turn: 1 });
        tracer.emit(TraceKind::Turn { turn: 2 });
        drop(tracer);
        let count = sink
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(count, 2);
        let text = std::fs::read_to_string(&path).unwrap_or_default();
        assert_eq!(text.lines().count(), 2);
    }
}
