// CLI integration tests that need no live Redis server.
use std::net::TcpListener;
use std::process::{Command, Output};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_redump");
    let mut command = Command::new(exe);
    command.env("RUST_LOG", "off");
    command
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

/// Last non-empty stderr line, which carries the error envelope.
fn stderr_error(output: &Output) -> Value {
    let text = String::from_utf8_lossy(&output.stderr);
    let line = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .expect("stderr line");
    let value = parse_json(line);
    value.get("error").cloned().expect("error envelope")
}

fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

#[test]
fn help_lists_subcommands() {
    let output = cmd().arg("--help").output().expect("help");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("dump"));
    assert!(text.contains("restore"));
    assert!(text.contains("--host"));
}

#[test]
fn no_arguments_prints_help_and_exits_two() {
    let output = cmd().output().expect("run");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn version_emits_json_when_piped() {
    let output = cmd().arg("version").output().expect("version");
    assert!(output.status.success());
    let value = parse_json(String::from_utf8_lossy(&output.stdout).trim());
    assert_eq!(value["name"], "redump");
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn completion_bash_succeeds() {
    let output = cmd().args(["completion", "bash"]).output().expect("completion");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("redump"));
}

#[test]
fn restore_of_missing_file_exits_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = temp.path().join("missing.dump");
    let output = cmd()
        .args(["restore", "-f", missing.to_str().expect("utf8 path")])
        .output()
        .expect("restore");

    assert_eq!(output.status.code(), Some(3));
    let error = stderr_error(&output);
    assert_eq!(error["kind"], "NotFound");
    assert_eq!(error["path"], missing.display().to_string());
    assert!(error.get("hint").is_some());
}

#[test]
fn dump_to_unreachable_server_exits_connection_without_creating_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let file = temp.path().join("out.dump");
    let port = unused_port().to_string();
    let output = cmd()
        .args([
            "-H",
            "127.0.0.1",
            "-p",
            &port,
            "--connect-timeout",
            "1",
            "--min-idle",
            "1",
            "dump",
            "-f",
            file.to_str().expect("utf8 path"),
        ])
        .output()
        .expect("dump");

    assert_eq!(output.status.code(), Some(5));
    let error = stderr_error(&output);
    assert_eq!(error["kind"], "Connection");
    assert!(error["hint"].as_str().expect("hint").contains(&port));
    assert!(!file.exists());
}

#[test]
fn zero_workers_is_a_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let file = temp.path().join("out.dump");
    let output = cmd()
        .args([
            "dump",
            "--workers",
            "0",
            "-f",
            file.to_str().expect("utf8 path"),
        ])
        .output()
        .expect("dump");

    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stderr_error(&output)["kind"], "Usage");
}

#[test]
fn database_out_of_range_is_a_usage_error() {
    let output = cmd().args(["-d", "17", "dump"]).output().expect("dump");
    assert_eq!(output.status.code(), Some(2));
    let error = stderr_error(&output);
    assert_eq!(error["kind"], "Usage");
    assert!(
        error["hint"]
            .as_str()
            .expect("hint")
            .contains("redump")
    );
}

#[test]
fn min_idle_above_max_connections_is_a_usage_error() {
    let output = cmd()
        .args(["--min-idle", "20", "--max-connections", "5", "restore"])
        .output()
        .expect("restore");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stderr_error(&output)["kind"], "Usage");
}
