// ABOUTME: Integration tests for the berth CLI.
// ABOUTME: Validates help output, flag parsing and configuration errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn berth_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("berth"));
    cmd.env_remove("BERTH_BACKEND").env_remove("BERTH_ENDPOINT");
    cmd
}

#[test]
fn help_shows_commands() {
    berth_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("info"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("logs"));
}

#[test]
fn unknown_backend_is_rejected() {
    berth_cmd()
        .args(["--backend", "lxc", "info"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lxc"));
}

#[test]
fn exec_requires_a_command() {
    berth_cmd().args(["exec", "abc123"]).assert().failure();
}

#[test]
fn unreachable_endpoint_fails_cleanly() {
    let temp_dir = tempfile::tempdir().unwrap();
    berth_cmd()
        .current_dir(temp_dir.path())
        .args(["--backend", "docker", "--endpoint", "tcp://127.0.0.1:1", "info"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn invalid_config_file_is_reported() {
    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(
        temp_dir.path().join("berth.yml"),
        "retry:\n  max_attempts: 0\n",
    )
    .unwrap();

    berth_cmd()
        .current_dir(temp_dir.path())
        .arg("info")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_attempts"));
}

#[test]
fn explicit_missing_config_is_reported() {
    let temp_dir = tempfile::tempdir().unwrap();
    berth_cmd()
        .current_dir(temp_dir.path())
        .args(["--config", "nope.yml", "info"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.yml"));
}
