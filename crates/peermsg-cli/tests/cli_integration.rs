//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library, and never
//! need a relay or a second node.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("peermsg").expect("Failed to find peermsg binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Extract the fingerprint from `identity show` output
fn extract_fingerprint(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("  Fingerprint: "))
        .map(|fp| fp.trim().to_string())
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("Failed to run peermsg");
    assert!(output.status.success(), "command failed: {:?}", output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ============================================================================
// Info and Identity Tests
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("PeerMessenger"))
        .stdout(predicate::str::contains("Identity:"))
        .stdout(predicate::str::contains("Fingerprint:"))
        .stdout(predicate::str::contains("Friends: 0"));
}

#[test]
fn test_info_reports_missing_relay() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("reconnection disabled"));

    cli_cmd(&data_dir)
        .args(["--relay", "ws://127.0.0.1:9", "info"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Relay: ws://127.0.0.1:9"));
}

#[test]
fn test_identity_is_stable_across_runs() {
    let data_dir = TempDir::new().unwrap();

    let first = stdout_of(cli_cmd(&data_dir).args(["identity", "show"]));
    let second = stdout_of(cli_cmd(&data_dir).args(["identity", "show"]));

    let fp = extract_fingerprint(&first).expect("fingerprint in output");
    assert_eq!(extract_fingerprint(&second).as_deref(), Some(fp.as_str()));
    assert_eq!(fp.split(' ').count(), 16);
    assert!(first.contains("Public key:"));
}

#[test]
fn test_separate_data_dirs_have_separate_identities() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    let fa = extract_fingerprint(&stdout_of(cli_cmd(&a).args(["identity", "show"])));
    let fb = extract_fingerprint(&stdout_of(cli_cmd(&b).args(["identity", "show"])));
    assert!(fa.is_some());
    assert_ne!(fa, fb);
}

// ============================================================================
// Friends and Messages Tests
// ============================================================================

#[test]
fn test_friends_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["friends", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No friends yet"));
}

#[test]
fn test_messages_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["messages", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No messages."));
}

#[test]
fn test_chat_message_is_persisted() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("chat")
        .write_stdin("hello from the terminal\n/quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("no friend online"));

    cli_cmd(&data_dir)
        .args(["messages", "list", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("you: hello from the terminal"));
}

// ============================================================================
// Chat Command Tests
// ============================================================================

#[test]
fn test_chat_invite_prints_code() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["--name", "Alice", "chat"])
        .write_stdin("/invite\n/quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("You: Alice"))
        .stdout(predicate::str::contains("pm1:"));
}

#[test]
fn test_chat_rejects_garbage_code() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("chat")
        .write_stdin("/accept not-a-code\n/complete pm1:xyz\n/quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Error:"));

    cli_cmd(&data_dir)
        .args(["friends", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No friends yet"));
}

#[test]
fn test_chat_unknown_command_shows_hint() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("chat")
        .write_stdin("/dance\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Unknown command /dance"));
}

#[test]
fn test_commands_report_running_node() {
    use std::process::{Command as StdCommand, Stdio};
    use std::time::{Duration, Instant};

    let data_dir = TempDir::new().unwrap();

    // A chat node holds the store for as long as its stdin stays open
    let mut node = StdCommand::new(assert_cmd::cargo::cargo_bin("peermsg"))
        .arg("--data-dir")
        .arg(data_dir.path())
        .arg("chat")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start chat node");

    let deadline = Instant::now() + Duration::from_secs(10);
    let stderr = loop {
        let output = cli_cmd(&data_dir).args(["friends", "list"]).output().unwrap();
        if !output.status.success() {
            break String::from_utf8_lossy(&output.stderr).into_owned();
        }
        assert!(Instant::now() < deadline, "chat node never took the store");
        std::thread::sleep(Duration::from_millis(50));
    };

    let _ = node.kill();
    let _ = node.wait();
    assert!(stderr.contains("already running"), "stderr: {}", stderr);

    cli_cmd(&data_dir)
        .args(["friends", "list"])
        .assert()
        .success();
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_config_show_applies_overrides() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["--name", "Bob", "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"display_name\": \"Bob\""))
        .stdout(predicate::str::contains("\"have_limit\": 200"));
}

#[test]
fn test_config_save_persists() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["--relay", "ws://relay.example:8787", "config", "save"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.json"));

    assert!(data_dir.path().join("config.json").exists());

    cli_cmd(&data_dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ws://relay.example:8787"));
}

#[test]
fn test_bad_listen_address_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["--listen", "not an address", "info"])
        .assert()
        .failure();
}

#[test]
fn test_log_dir_receives_jsonl() {
    let data_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("-v")
        .arg("--log-dir")
        .arg(log_dir.path())
        .arg("info")
        .assert()
        .success();

    let logs: Vec<_> = std::fs::read_dir(log_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(!logs.is_empty());
}
