//! Binary-level tests that need no LLM backend.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn delve() -> Command {
    let mut cmd = Command::cargo_bin("delve").unwrap_or_else(|e| unreachable!("{e}"));
    for key in [
        "OPENAI_API_KEY",
        "ANTHROPIC_API_KEY",
        "DELVE_API_KEY",
        "DELVE_PROVIDER",
        "DELVE_PROMPT_DIR",
        "RUST_LOG",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn help_lists_commands() {
    delve()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("init-prompts"));
}

#[test]
fn init_prompts_writes_templates() {
    let dir = TempDir::new().unwrap_or_else(|e| unreachable!("{e}"));
    delve()
        .args(["init-prompts", "--dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("main.md"));
    assert!(dir.path().join("final_summary.md").exists());

    delve()
        .args(["init-prompts", "--dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("already exist"));
}

#[test]
fn run_without_api_key_fails() {
    delve()
        .args(["run", "What is 2 + 2?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("API key missing"));
}

#[test]
fn run_rejects_bad_turn_cap() {
    delve()
        .args(["run", "q", "--max-turns", "many"])
        .env("OPENAI_API_KEY", "sk-test")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--max-turns"));
}

#[test]
fn batch_with_missing_input_fails() {
    let dir = TempDir::new().unwrap_or_else(|e| unreachable!("{e}"));
    delve()
        .arg("batch")
        .arg(dir.path().join("missing.jsonl"))
        .arg("--output")
        .arg(dir.path().join("out.jsonl"))
        .env("OPENAI_API_KEY", "sk-test")
        .assert()
        .failure()
        .stderr(predicate::str::contains("I/O error"));
    assert!(!dir.path().join("out.jsonl").exists());
}

#[test]
fn tools_with_builtin_profile_lists_nothing() {
    delve()
        .args(["--format", "json", "tools"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tools\": []"));
}

#[test]
fn tools_reports_unstartable_server() {
    let dir = TempDir::new().unwrap_or_else(|e| unreachable!("{e}"));
    let profile = dir.path().join("profile.toml");
    std::fs::write(
        &profile,
        r#"
[main]
description = "main"

[[tool_servers]]
name = "ghost"
command = "delve-definitely-not-a-command"
"#,
    )
    .unwrap_or_else(|e| unreachable!("{e}"));

    delve()
        .args(["tools", "--timeout", "2", "--profile"])
        .arg(&profile)
        .assert()
        .success()
        .stdout(predicate::str::contains("No tools discovered."))
        .stdout(predicate::str::contains("Server error: ghost"));
}
