//! CLI tests for the listener binary.
//!
//! These exercise the non-daemon subcommands end to end: configuration
//! validation, example generation, webhook probing, and the exit codes the
//! `run` command reports for rejected configurations.

use assert_cmd::Command;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

const VALID_CONFIG: &str = r#"
[bot]
token = "test-token"

[[webhook_rules]]
name = "everything"
webhook_url = "https://hooks.example.com/abc"
"#;

fn listener_cmd() -> Command {
    Command::cargo_bin("switchboard-listener").unwrap()
}

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

// =============================================================================
// Check Tests
// =============================================================================

#[test]
fn check_accepts_a_valid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, VALID_CONFIG);

    let output = listener_cmd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration OK"));
    assert!(stdout.contains("1 enabled"));
}

#[test]
fn check_rejects_malformed_toml_with_code_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "not toml [[[");

    listener_cmd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .code(2);
}

#[test]
fn check_rejects_a_missing_file_with_code_2() {
    let dir = TempDir::new().unwrap();

    listener_cmd()
        .args(["check", "--config"])
        .arg(dir.path().join("nope.toml"))
        .assert()
        .code(2);
}

#[test]
fn check_rejects_an_invalid_rule_with_code_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        r#"
[bot]
token = "test-token"

[[webhook_rules]]
name = "broken"
webhook_url = "https://hooks.example.com/abc"
scope_type = "guild"
"#,
    );

    let output = listener_cmd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .get_output()
        .clone();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("scope_id"));
}

// =============================================================================
// Init Tests
// =============================================================================

#[test]
fn init_writes_a_config_that_validates() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");

    listener_cmd()
        .args(["init", "--config"])
        .arg(&config)
        .assert()
        .success();

    let contents = std::fs::read_to_string(&config).unwrap();
    assert!(contents.contains("[bot]"));
    assert!(contents.contains("[[webhook_rules]]"));

    // The generated file must pass its own validation.
    listener_cmd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .success();
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "original = true\n");

    listener_cmd()
        .args(["init", "--config"])
        .arg(&config)
        .write_stdin("n\n")
        .assert()
        .success();

    let contents = std::fs::read_to_string(&config).unwrap();
    assert_eq!(contents, "original = true\n");
}

#[test]
fn init_force_overwrites_an_existing_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "original = true\n");

    listener_cmd()
        .args(["init", "--force", "--config"])
        .arg(&config)
        .assert()
        .success();

    let contents = std::fs::read_to_string(&config).unwrap();
    assert!(contents.contains("[bot]"));
}

// =============================================================================
// Probe and Run Tests
// =============================================================================

#[test]
fn test_webhook_reports_an_unreachable_endpoint() {
    listener_cmd()
        .args(["test-webhook", "http://127.0.0.1:9/hook"])
        .assert()
        .code(1);
}

#[test]
fn run_with_a_rejected_config_exits_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[bot]\ntoken = \"\"\n");

    listener_cmd()
        .args(["run", "--config"])
        .arg(&config)
        .args(["--feed"])
        .arg(dir.path().join("events.jsonl"))
        .assert()
        .code(2);
}

#[test]
fn run_with_a_disabled_bot_exits_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        r#"
[bot]
token = "test-token"
enabled = false
"#,
    );

    listener_cmd()
        .args(["run", "--config"])
        .arg(&config)
        .args(["--feed"])
        .arg(dir.path().join("events.jsonl"))
        .assert()
        .code(2);
}

// =============================================================================
// Signal Tests
// =============================================================================

#[cfg(unix)]
mod signals {
    use super::*;
    use assert_cmd::cargo::CommandCargoExt;
    use std::process::{Child, Command as StdCommand, ExitStatus, Stdio};
    use std::time::{Duration, Instant};

    fn send_signal(pid: u32, sig: &str) {
        let status = StdCommand::new("kill")
            .arg(sig)
            .arg(pid.to_string())
            .status()
            .expect("run kill");
        assert!(status.success(), "kill {sig} {pid} failed");
    }

    fn wait_with_deadline(child: &mut Child, limit: Duration) -> ExitStatus {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().expect("poll listener") {
                return status;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        child.kill().ok();
        panic!("listener did not exit within {limit:?}");
    }

    /// A reload signal immediately followed by a termination signal still
    /// shuts the listener down cleanly.
    #[test]
    fn reload_then_terminate_exits_gracefully() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, VALID_CONFIG);
        let feed = dir.path().join("events.jsonl");
        std::fs::write(&feed, "").unwrap();

        let mut command = StdCommand::cargo_bin("switchboard-listener").expect("listener binary");
        command
            .arg("run")
            .arg("--config")
            .arg(&config)
            .arg("--feed")
            .arg(&feed)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = command.spawn().expect("spawn listener");

        // Let the listener install its signal handlers and connect.
        std::thread::sleep(Duration::from_millis(500));

        send_signal(child.id(), "-HUP");
        send_signal(child.id(), "-TERM");

        let status = wait_with_deadline(&mut child, Duration::from_secs(5));
        assert_eq!(status.code(), Some(0));
    }
}
