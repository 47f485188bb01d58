//! Binary behaviour: JSON output, error shape and exit codes

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

fn toolhost(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("toolhost").unwrap();
    cmd.env("TOOLHOST_MASTER_KEY", MASTER_KEY)
        .env_remove("RUST_LOG")
        .arg("--config-dir")
        .arg(dir.path());
    cmd
}

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("toolhost")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("invoke"))
        .stdout(predicate::str::contains("configure"));
}

#[test]
fn secret_round_trip() {
    let dir = TempDir::new().unwrap();

    toolhost(&dir)
        .args(["secret", "set", "google", "refresh_token", "r-value-1", "--secret"])
        .assert()
        .success();

    toolhost(&dir)
        .args(["secret", "get", "google", "refresh_token"])
        .assert()
        .success()
        .stdout(predicate::str::contains("r-value-1"));

    let on_disk = fs::read_to_string(dir.path().join("secrets.json")).unwrap();
    assert!(!on_disk.contains("r-value-1"));

    toolhost(&dir)
        .args(["secret", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("google"));

    toolhost(&dir)
        .args(["secret", "delete", "google", "refresh_token"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"deleted\": true"));
}

#[test]
fn wrong_master_key_fails() {
    let dir = TempDir::new().unwrap();
    toolhost(&dir)
        .args(["secret", "set", "svc", "k", "v"])
        .assert()
        .success();

    Command::cargo_bin("toolhost")
        .unwrap()
        .env(
            "TOOLHOST_MASTER_KEY",
            "ff0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        )
        .arg("--config-dir")
        .arg(dir.path())
        .args(["secret", "get", "svc", "k"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Master key does not match"));
}

#[test]
fn plugins_lists_builtin_rest() {
    let dir = TempDir::new().unwrap();
    toolhost(&dir)
        .arg("plugins")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"rest\""))
        .stdout(predicate::str::contains("\"configured\": false"));
}

#[test]
fn tools_prints_manifests() {
    let dir = TempDir::new().unwrap();
    toolhost(&dir)
        .args(["tools", "--plugin", "rest"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"rest_send\""))
        .stdout(predicate::str::contains("\"requiresApproval\": true"))
        .stdout(predicate::str::contains("\"inputSchema\""));
}

#[test]
fn invoke_unconfigured_prints_error_json() {
    let dir = TempDir::new().unwrap();
    toolhost(&dir)
        .args(["invoke", "rest", "rest_get", "--args", r#"{"path":"/x"}"#])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"code\": \"not_configured\""))
        .stdout(predicate::str::contains("toolhost configure rest"));
}

#[test]
fn invoke_rejects_malformed_args() {
    let dir = TempDir::new().unwrap();
    toolhost(&dir)
        .args(["invoke", "rest", "rest_get", "--args", "{not json"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("invalid_argument"));
}

#[test]
fn invoke_unknown_plugin() {
    let dir = TempDir::new().unwrap();
    toolhost(&dir)
        .args(["invoke", "nope", "nope_get"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("no_such_plugin"));
}

#[test]
fn configure_then_invoke_with_bearer() {
    let mut server = mockito::Server::new();
    let upstream = server
        .mock("POST", "/notes")
        .match_header("authorization", "Bearer cli-token-123")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":1}"#)
        .create();

    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("config.toml"),
        format!(
            "[plugins.settings.rest]\nbase_url = \"{}\"\nauth = \"bearer\"\n",
            server.url()
        ),
    )
    .unwrap();

    toolhost(&dir)
        .args(["configure", "rest", "--set", "token=cli-token-123"])
        .assert()
        .success()
        .stdout(predicate::str::contains("token"));

    toolhost(&dir)
        .args(["status", "rest"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"configured\": true"));

    toolhost(&dir)
        .args([
            "invoke",
            "rest",
            "rest_send",
            "--yes",
            "--args",
            r#"{"method":"POST","path":"/notes","body":{"text":"hi"}}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": 1"));

    upstream.assert();
}
