//! CLI integration tests for the conduit command-line interface.
//!
//! These tests verify:
//! - Help text is displayed correctly
//! - Server configuration round-trips through `servers add/list/remove`
//! - Invalid inputs are rejected with appropriate messages
//!
//! Tests that talk to a real server use the mock server built by
//! `conduit-mcp` and skip when it is not available.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A conduit command isolated from the user's config and log directories.
fn conduit(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("conduit").unwrap();
    cmd.env("CONDUIT_CONFIG_DIR", dir)
        .env("CONDUIT_CONFIG", dir.join("conduit.toml"))
        .env_remove("RUST_LOG")
        .current_dir(dir);
    cmd
}

fn mock_server_path() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // crates
    path.pop(); // workspace root
    path.push("target");
    path.push(if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    });
    path.push("mock-mcp-server");
    path
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("servers"))
        .stdout(predicate::str::contains("tools"))
        .stdout(predicate::str::contains("call"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_version_displays() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("conduit"));
}

#[test]
fn test_call_help() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .args(["call", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--task"))
        .stdout(predicate::str::contains("--args"));
}

#[test]
fn test_ttl_requires_task() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .args(["call", "srv", "tool", "--ttl", "10"])
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_servers_empty() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .arg("servers")
        .assert()
        .success()
        .stdout(predicate::str::contains("No MCP servers configured"));

    conduit(dir.path())
        .args(["--json", "servers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_servers_add_list_remove() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .args(["servers", "add", "sqlite", "mcp-server-sqlite", "-e", "DEBUG=1", "--", "--db", "x.db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added MCP server: sqlite"));
    conduit(dir.path())
        .args(["servers", "add", "local", "/tmp/local.sock", "--unix"])
        .assert()
        .success();

    let saved = std::fs::read_to_string(dir.path().join("conduit.toml")).unwrap();
    assert!(saved.contains("mcp-server-sqlite"));
    assert!(saved.contains("transport = \"unix\""));

    conduit(dir.path())
        .args(["servers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sqlite"))
        .stdout(predicate::str::contains("mcp-server-sqlite --db x.db"))
        .stdout(predicate::str::contains("/tmp/local.sock"));

    conduit(dir.path())
        .args(["servers", "add", "sqlite", "other"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    conduit(dir.path())
        .args(["servers", "remove", "sqlite"])
        .assert()
        .success();
    conduit(dir.path())
        .args(["servers", "remove", "sqlite"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_unknown_server_is_rejected() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .args(["check", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_call_rejects_bad_arguments() {
    let dir = TempDir::new().unwrap();
    conduit(dir.path())
        .args(["call", "ghost", "echo", "--args", "[1]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON object"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Against the mock server
// ─────────────────────────────────────────────────────────────────────────────

fn with_mock_server() -> Option<TempDir> {
    let mock = mock_server_path();
    if !mock.exists() {
        eprintln!(
            "Skipping test: mock-mcp-server not built. Run `cargo build --package conduit-mcp` first."
        );
        return None;
    }
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("conduit.toml"),
        format!(
            "[[servers]]\nname = \"mock\"\ncommand = {:?}\n",
            mock.display().to_string()
        ),
    )
    .unwrap();
    Some(dir)
}

#[test]
fn test_check_mock_server() {
    let Some(dir) = with_mock_server() else {
        return;
    };
    conduit(dir.path())
        .args(["check", "mock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mock-mcp-server v1.0.0"))
        .stdout(predicate::str::contains("Listed 7 tools"));
}

#[test]
fn test_tools_and_call_mock_server() {
    let Some(dir) = with_mock_server() else {
        return;
    };
    conduit(dir.path())
        .args(["tools", "mock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("echo"))
        .stdout(predicate::str::contains("quirky"));

    conduit(dir.path())
        .args(["call", "mock", "echo", "--args", r#"{"message": "hello"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));

    conduit(dir.path())
        .args(["call", "mock", "fail"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("simulated failure"));

    conduit(dir.path())
        .args(["--json", "call", "mock", "slow", "--args", r#"{"delay_ms": 50}"#, "--task"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Slept for 50 ms"));
}
