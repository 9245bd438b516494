//! Newline-delimited JSON over a child process's stdio.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Stdio transport for one MCP server process.
///
/// The child is killed when the transport is dropped.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
}

fn mask(key: &str, value: &str) -> String {
    let upper = key.to_ascii_uppercase();
    if upper.contains("KEY") || upper.contains("TOKEN") || upper.contains("SECRET") {
        let head: String = value.chars().take(4).collect();
        format!("{head}***")
    } else {
        value.to_string()
    }
}

impl StdioTransport {
    /// Spawns the server process.
    ///
    /// Server stderr is discarded so chatty servers cannot block on a full
    /// pipe.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        info!(command, ?args, "spawning MCP server");
        for (k, v) in env {
            debug!(key = %k, value = %mask(k, v), "MCP server env");
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow!("command not found: {command}")
            } else {
                anyhow!("failed to spawn {command}: {e}")
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
        })
    }

    /// Writes one message followed by a newline.
    pub async fn send(&self, message: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        debug!(message, "MCP sent");
        Ok(())
    }

    /// Reads the next JSON line, skipping blank and non-JSON output.
    pub async fn receive(&self) -> Result<String> {
        let mut stdout = self.stdout.lock().await;

        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;

            if bytes == 0 {
                let mut child = self.child.lock().await;
                return match child.try_wait() {
                    Ok(Some(status)) => Err(anyhow!("MCP server exited with {status}")),
                    Ok(None) => Err(anyhow!("MCP server closed stdout")),
                    Err(e) => Err(anyhow!("cannot query MCP server status: {e}")),
                };
            }

            let line = line.trim();
            if line.starts_with('{') {
                debug!(message = line, "MCP received");
                return Ok(line.to_string());
            }
            if !line.is_empty() {
                debug!(line, "skipping non-JSON line");
            }
        }
    }

    /// Kills the process and waits for it to exit.
    pub async fn terminate(&self) {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secrets() {
        assert_eq!(mask("SEARCH_API_KEY", "abcdefgh"), "abcd***");
        assert_eq!(mask("GITHUB_TOKEN", "xy"), "xy***");
        assert_eq!(mask("REGION", "eu-west-1"), "eu-west-1");
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let result = StdioTransport::spawn(
            "delve-definitely-not-a-command",
            &[],
            &BTreeMap::new(),
            None,
        );
        let err = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("command not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let transport = StdioTransport::spawn("cat", &[], &BTreeMap::new(), None)
            .unwrap_or_else(|e| unreachable!("{e}"));
        transport
            .send("not json")
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        let line = transport.receive().await.unwrap_or_else(|e| unreachable!("{e}"));
        assert!(line.contains("\"id\":1"));
        transport.terminate().await;
    }
}
