//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn isolated_home() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("vastrun");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn help_lists_job_commands() {
    let mut cmd = cargo_bin_cmd!("vastrun");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("launch"))
        .stdout(predicate::str::contains("start-run"))
        .stdout(predicate::str::contains("set-api-key"));
}

#[test]
fn set_api_key_writes_key_file() {
    let home = isolated_home();
    let key_file = home.path().join("keys").join("vast");

    let mut cmd = cargo_bin_cmd!("vastrun");
    cmd.env("HOME", home.path())
        .env("VAST_API_KEY_FILE", &key_file)
        .args(["set-api-key", "secret-123"])
        .assert()
        .success()
        .stdout(predicate::str::contains("api key saved"));

    let stored = std::fs::read_to_string(&key_file)
        .unwrap_or_else(|err| panic!("read key file: {err}"));
    assert_eq!(stored, "secret-123");
}

#[test]
fn copy_rejects_destination_without_instance() {
    let home = isolated_home();

    let mut cmd = cargo_bin_cmd!("vastrun");
    cmd.env("HOME", home.path())
        .args(["copy", ".", "/root/data"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("expected ID:PATH"));
}

#[test]
fn launch_rejects_control_characters_before_renting() {
    let home = isolated_home();

    let mut cmd = cargo_bin_cmd!("vastrun");
    cmd.env("HOME", home.path())
        .current_dir(home.path())
        .args(["launch", "123", "--", "echo", "line\nbreak"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("control characters"));
}
