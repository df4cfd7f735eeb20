//! CLI behavior and exit codes, driven through the real binary.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;

use clusterkey::keymgr::store::KEY_RECORD_LEN;

const EXIT_USAGE: i32 = 64;

fn clusterkey() -> Command {
    let mut cmd = Command::cargo_bin("clusterkey").expect("binary exists");
    cmd.env("CLUSTERKEY_TEST_KDF", "1");
    cmd
}

fn passphrase_command(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    format!("cat '{}'", path.display())
}

#[test]
fn status_reports_missing_keystore() {
    let dir = tempfile::tempdir().unwrap();

    clusterkey()
        .args(["status", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("missing"));
}

#[test]
fn bootstrap_creates_keystore_and_status_is_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let command = passphrase_command(dir.path(), "pp", "correct horse battery staple");

    clusterkey()
        .args(["bootstrap", "--command", command.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success();

    let key_file = dir.path().join("cryptokeys").join("0000");
    assert_eq!(
        fs::metadata(&key_file).unwrap().len(),
        KEY_RECORD_LEN as u64
    );

    let output = clusterkey()
        .args(["status", "--json", "--data-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: Value = serde_json::from_slice(&output.stdout).expect("valid json");
    assert_eq!(json.get("value").and_then(Value::as_str), Some("healthy"));
    assert_eq!(
        json.pointer("/meta/keys").and_then(Value::as_u64),
        Some(1)
    );
}

#[test]
fn bootstrap_twice_exits_with_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let command = passphrase_command(dir.path(), "pp", "correct horse battery staple");

    clusterkey()
        .args(["bootstrap", "--command", command.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success();

    clusterkey()
        .args(["bootstrap", "--command", command.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .code(EXIT_USAGE)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn bootstrap_rejects_short_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let command = passphrase_command(dir.path(), "pp", "tiny");

    clusterkey()
        .args(["bootstrap", "--command", command.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .code(EXIT_USAGE)
        .stderr(predicate::str::contains("at least"));
}

#[test]
fn bootstrap_without_command_or_config_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");

    clusterkey()
        .arg("--config")
        .arg(&config)
        .args(["bootstrap", "--data-dir"])
        .arg(dir.path())
        .assert()
        .code(EXIT_USAGE)
        .stderr(predicate::str::contains("not configured"));
}

#[test]
fn verify_accepts_matching_passphrase_and_rejects_others() {
    let dir = tempfile::tempdir().unwrap();
    let right = passphrase_command(dir.path(), "right", "correct horse battery staple");
    let wrong = passphrase_command(dir.path(), "wrong", "incorrect donkey battery staple");

    clusterkey()
        .args(["bootstrap", "--command", right.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success();

    clusterkey()
        .args(["verify", "--command", right.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));

    clusterkey()
        .args(["verify", "--command", wrong.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .code(EXIT_USAGE)
        .stderr(predicate::str::contains("does not match"));
}

#[test]
fn save_config_round_trips_through_verify() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    let command = passphrase_command(dir.path(), "pp", "correct horse battery staple");

    clusterkey()
        .arg("--config")
        .arg(&config)
        .args(["bootstrap", "--save-config", "--command", command.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success();

    assert!(config.exists());

    // No --command: the saved template is used.
    clusterkey()
        .arg("--config")
        .arg(&config)
        .args(["verify", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn rotate_switches_the_unlocking_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    let old_cmd = passphrase_command(dir.path(), "old", "PP-old-xxxxxxxxxxx");
    let new_cmd = passphrase_command(dir.path(), "new", "PP-new-xxxxxxxxxxx");

    clusterkey()
        .arg("--config")
        .arg(&config)
        .args(["bootstrap", "--save-config", "--command", old_cmd.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success();

    clusterkey()
        .arg("--config")
        .arg(&config)
        .args(["rotate", "--command", new_cmd.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("rotated"));

    clusterkey()
        .args(["verify", "--command", new_cmd.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .success();

    clusterkey()
        .args(["verify", "--command", old_cmd.as_str(), "--data-dir"])
        .arg(dir.path())
        .assert()
        .code(EXIT_USAGE);
}

#[test]
fn rotate_without_enabled_config_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");

    clusterkey()
        .arg("--config")
        .arg(&config)
        .args(["rotate", "--data-dir"])
        .arg(dir.path())
        .assert()
        .code(EXIT_USAGE)
        .stderr(predicate::str::contains("not enabled"));
}

#[test]
fn no_subcommand_prints_help_with_usage_exit() {
    clusterkey().assert().code(EXIT_USAGE);
}
