//! Integration tests for the `halink` binary.
//!
//! Argument parsing, help output, completions, config handling and error
//! exit codes, all without a live Home Assistant.
#![allow(clippy::unwrap_used)]

use std::net::TcpListener;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// `halink` with `HALINK_*` cleared and config dirs pointed at `home`.
fn halink_cmd(home: &std::path::Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("halink");
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("HALINK_PROFILE")
        .env_remove("HALINK_URL")
        .env_remove("HALINK_TOKEN")
        .env_remove("HALINK_TIMEOUT")
        .env_remove("RUST_LOG");
    cmd
}

/// A local port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn no_args_shows_help() {
    let home = tempfile::tempdir().unwrap();
    let output = halink_cmd(home.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(text.contains("Usage"), "expected usage in:\n{text}");
}

#[test]
fn help_lists_commands() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path()).arg("--help").assert().success().stdout(
        predicate::str::contains("watch")
            .and(predicate::str::contains("call"))
            .and(predicate::str::contains("status"))
            .and(predicate::str::contains("config")),
    );
}

#[test]
fn version_flag() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("halink"));
}

#[test]
fn completions_bash() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn token_is_not_echoed_in_help() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .env("HALINK_TOKEN", "super-secret-value")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("super-secret-value").not());
}

// ── Config resolution errors ────────────────────────────────────────

#[test]
fn status_without_config_is_a_usage_error() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No Home Assistant URL configured"));
}

#[test]
fn url_without_token_is_an_auth_error() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .args(["--url", "http://127.0.0.1:1", "status"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("No access token"));
}

#[test]
fn invalid_filter_is_rejected_before_output() {
    let home = tempfile::tempdir().unwrap();
    let url = format!("ws://127.0.0.1:{}/api/websocket", closed_port());
    halink_cmd(home.path())
        .args(["--url", &url, "--token", "t", "watch", "light.*.x"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

#[test]
fn unreachable_backend_is_a_connection_error() {
    let home = tempfile::tempdir().unwrap();
    let url = format!("http://127.0.0.1:{}", closed_port());
    halink_cmd(home.path())
        .args(["--url", &url, "--token", "t", "--timeout", "2", "status"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("Could not connect"));
}

#[test]
fn call_rejects_non_object_data() {
    let home = tempfile::tempdir().unwrap();
    let url = format!("ws://127.0.0.1:{}/api/websocket", closed_port());
    halink_cmd(home.path())
        .args(["--url", &url, "--token", "t", "call", "get_states", "--data", "[1]"])
        .assert()
        .failure();
}

// ── Config subcommands ──────────────────────────────────────────────

#[test]
fn config_init_then_show() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .args([
            "--profile",
            "cabin",
            "config",
            "init",
            "--url",
            "http://cabin.local:8123",
            "--token-env",
            "CABIN_TOKEN",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("Profile 'cabin' written"));

    halink_cmd(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("http://cabin.local:8123")
                .and(predicate::str::contains("CABIN_TOKEN"))
                .and(predicate::str::contains("default_profile = \"cabin\"")),
        );
}

#[test]
fn config_init_rejects_bad_url() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .args(["config", "init", "--url", "ftp://nas.local"])
        .assert()
        .code(2);
}

#[test]
fn unknown_profile_is_reported() {
    let home = tempfile::tempdir().unwrap();
    halink_cmd(home.path())
        .args(["--profile", "nowhere", "status"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Profile 'nowhere' not found"));
}
