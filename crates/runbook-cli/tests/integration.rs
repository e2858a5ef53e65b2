#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn runbook(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("runbook").unwrap();
    cmd.current_dir(dir.path())
        .env("RUNBOOK_CONFIG", dir.path().join("runbook.yaml"))
        .env_remove("RUNBOOK_TOKEN")
        .env_remove("RUNBOOK_URL");
    cmd
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A `runbook serve` child process, killed on drop.
struct Server {
    child: Child,
    url: String,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Write a config with local-host actions backed by shell scripts and
/// start a server on a free port.
fn start_server(dir: &TempDir) -> Server {
    let deploy = write_script(dir.path(), "deploy.sh", "echo Deploying...\necho Deploying...");
    let broken = write_script(dir.path(), "broken.sh", "echo oops >&2\nexit 3");
    let wipe = write_script(dir.path(), "wipe.sh", "echo wiped");
    let port = free_port();
    let config = format!(
        r#"
listen: "127.0.0.1:{port}"
operators:
  - {{ name: alice, token: alice-token, tier: elevated_use }}
  - {{ name: bob, token: bob-token, tier: use }}
servers:
  - id: local
    name: Local
    host: localhost
    actions:
      - {{ id: deploy, name: Deploy, command_path: "{deploy}" }}
      - {{ id: broken, name: Broken, command_path: "{broken}" }}
      - {{ id: wipe, name: Wipe, command_path: "{wipe}", dangerous: true }}
"#,
        deploy = deploy.display(),
        broken = broken.display(),
        wipe = wipe.display(),
    );
    std::fs::write(dir.path().join("runbook.yaml"), config).unwrap();

    let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("runbook"))
        .arg("serve")
        .env("RUNBOOK_CONFIG", dir.path().join("runbook.yaml"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let server = Server {
        child,
        url: format!("http://127.0.0.1:{port}"),
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(("127.0.0.1", port)).is_err() {
        assert!(Instant::now() < deadline, "server did not start");
        std::thread::sleep(Duration::from_millis(50));
    }
    server
}

fn as_operator(dir: &TempDir, server: &Server, token: &str) -> Command {
    let mut cmd = runbook(dir);
    cmd.env("RUNBOOK_URL", &server.url)
        .env("RUNBOOK_TOKEN", token);
    cmd
}

// ---------------------------------------------------------------------------
// runbook config validate
// ---------------------------------------------------------------------------

#[test]
fn config_validate_accepts_good_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("runbook.yaml"),
        r#"
operators:
  - { name: alice, token: t1, tier: use }
servers:
  - id: web-1
    name: Web
    host: web1.internal
    actions:
      - { id: deploy, name: Deploy, command_path: /opt/deploy.sh }
"#,
    )
    .unwrap();
    runbook(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_rejects_duplicate_tokens() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("runbook.yaml"),
        r#"
operators:
  - { name: alice, token: same, tier: use }
  - { name: bob, token: same, tier: manage }
"#,
    )
    .unwrap();
    runbook(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_json_lists_warnings() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("runbook.yaml"), "servers: []\n").unwrap();
    let output = runbook(&dir)
        .args(["--json", "config", "validate"])
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["servers"], 0);
    assert!(!value["warnings"].as_array().unwrap().is_empty());
}

#[test]
fn missing_config_file_fails() {
    let dir = TempDir::new().unwrap();
    runbook(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}

// ---------------------------------------------------------------------------
// Remote commands without a server
// ---------------------------------------------------------------------------

#[test]
fn remote_command_without_token_fails() {
    let dir = TempDir::new().unwrap();
    runbook(&dir)
        .arg("servers")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no operator token"));
}

#[test]
fn unreachable_server_fails() {
    let dir = TempDir::new().unwrap();
    runbook(&dir)
        .args(["--url", &format!("http://127.0.0.1:{}", free_port())])
        .args(["--token", "x", "servers"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot reach runbook server"));
}

// ---------------------------------------------------------------------------
// End to end against `runbook serve`
// ---------------------------------------------------------------------------

#[test]
fn run_streams_output_and_exits_zero() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir);

    as_operator(&dir, &server, "bob-token")
        .args(["run", "local", "deploy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("started at"))
        .stdout(predicate::str::contains("Deploying...\nDeploying..."))
        .stdout(predicate::str::contains("exit code: 0"));

    as_operator(&dir, &server, "bob-token")
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("success"));
}

#[test]
fn failing_action_exits_two() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir);

    as_operator(&dir, &server, "bob-token")
        .args(["run", "local", "broken"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("[stderr] oops"))
        .stdout(predicate::str::contains("exit code: 3"));
}

#[test]
fn dangerous_action_needs_elevated_tier() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir);

    as_operator(&dir, &server, "bob-token")
        .args(["run", "local", "wipe", "--confirm", "confirm"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("requires elevated_use permission"));

    as_operator(&dir, &server, "bob-token")
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs yet."));
}

#[test]
fn dangerous_action_needs_confirmation_phrase() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir);

    as_operator(&dir, &server, "alice-token")
        .args(["run", "local", "wipe"])
        .write_stdin("yes\n")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("type 'confirm'"));

    as_operator(&dir, &server, "alice-token")
        .args(["run", "local", "wipe"])
        .write_stdin("  CONFIRM \n")
        .assert()
        .success()
        .stdout(predicate::str::contains("wiped"));
}

#[test]
fn detach_then_watch() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir);

    let output = as_operator(&dir, &server, "bob-token")
        .args(["run", "local", "deploy", "--detach"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let run_id = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert!(!run_id.is_empty());

    as_operator(&dir, &server, "bob-token")
        .args(["watch", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("exit code: 0"));

    as_operator(&dir, &server, "bob-token")
        .args(["--json", "show", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"success\""));
}
