//! End-to-end tests for the tether CLI binary.

use std::process::Command;

fn tether() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tether"))
}

fn mockas_path() -> &'static str {
    env!("CARGO_BIN_EXE_mockas")
}

#[test]
fn test_help_describes_subcommands() {
    let output = tether().arg("--help").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("send"));
    assert!(stdout.contains("list"));
    assert!(stdout.contains("monitor"));
}

#[test]
fn test_version_flag() {
    let output = tether().arg("--version").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("tether"));
}

#[test]
fn test_send_ping_round_trip() {
    let output = tether()
        .args([
            "send",
            "ping",
            "--server",
            mockas_path(),
            "--arg",
            "--stdio",
        ])
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "send failed\nstdout: {stdout}\nstderr: {stderr}"
    );
    assert!(stdout.contains("pong"));
    assert!(stdout.contains("\"success\": true"));
}

#[test]
fn test_send_echo_passes_arguments() {
    let output = tether()
        .args([
            "send",
            "echo",
            "--arguments",
            r#"{"path": "src/main.rs"}"#,
            "--server",
            mockas_path(),
            "--arg",
            "--stdio",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("src/main.rs"));
}

#[test]
fn test_send_unknown_command_exits_nonzero() {
    let output = tether()
        .args([
            "send",
            "frobnicate",
            "--server",
            mockas_path(),
            "--arg",
            "--stdio",
        ])
        .output()
        .unwrap();

    // The response is printed, but the rejection makes the exit code nonzero.
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"success\": false"));
}

#[test]
fn test_send_rejects_non_object_arguments() {
    let output = tether()
        .args([
            "send",
            "ping",
            "--arguments",
            "[1,2,3]",
            "--server",
            mockas_path(),
        ])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("JSON object"));
}

#[test]
fn test_send_without_server_configured_fails_fast() {
    let output = tether()
        .env("XDG_CONFIG_HOME", std::env::temp_dir().join("tether-empty"))
        .args(["send", "ping"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no server command configured"));
}

#[test]
fn test_send_with_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[server]
command = "{}"
args = ["--stdio"]
"#,
            mockas_path()
        ),
    )
    .unwrap();

    let output = tether()
        .args(["send", "ping", "--config"])
        .arg(&config_path)
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {stderr}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pong"));
}

#[test]
fn test_list_runs() {
    let output = tether().arg("list").output().unwrap();
    assert!(output.status.success());
}

#[test]
fn test_monitor_unknown_session_fails() {
    let output = tether()
        .args(["monitor", "no-such-session-id"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found") || stderr.contains("Session"));
}
