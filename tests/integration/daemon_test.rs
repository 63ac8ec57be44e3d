//! Daemon discovery and lifecycle tests against the built binary.

use querymux::connector::Value;
use querymux::daemon::DaemonClient;
use querymux::query::QueryRequest;
use querymux::session::TabStatus;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const BINARY: &str = env!("CARGO_BIN_EXE_querymux");

/// Writes a config with HTTP off and one in-memory SQLite profile.
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        "[daemon]\nhttp = false\n\n[connections.local]\ntype = \"sqlite\"\npath = \":memory:\"\n",
    )
    .unwrap();
    path
}

/// A pid that belonged to a process which has already exited.
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

fn client(runtime_dir: &Path, config: &Path) -> DaemonClient {
    DaemonClient::new(runtime_dir)
        .with_program(BINARY)
        .with_daemon_args(["--config".into(), config.as_os_str().to_os_string()])
        .with_spawn_timeout(Duration::from_secs(15))
}

/// Scenario: Markers left behind by a crashed daemon
/// Given a PID marker naming a dead process
/// And a socket file nobody listens on
/// When a client starts
/// Then the stale markers are reaped and a fresh daemon is spawned
/// And queries run against it
/// And stopping it removes its markers
#[tokio::test]
async fn test_stale_markers_are_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let runtime = dir.path().join("rt");
    std::fs::create_dir_all(&runtime).unwrap();

    let mut client = client(&runtime, &config);
    let paths = client.paths().clone();
    std::fs::write(&paths.pid, dead_pid().to_string()).unwrap();
    drop(std::os::unix::net::UnixListener::bind(&paths.socket).unwrap());
    assert!(paths.socket.exists());

    client.start().await.unwrap();
    let pid = paths.read_pid().unwrap();
    assert_ne!(pid, std::process::id());

    let submitted = client
        .run_query(&QueryRequest::new("SELECT 1", "cli"))
        .await
        .unwrap();
    let info = client
        .wait_for_tab("cli", &submitted.tab_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(info.status, TabStatus::Success, "error: {:?}", info.error);
    assert_eq!(info.rows, vec![vec![Value::Int(1)]]);

    let status = client.status().await.unwrap();
    assert_eq!(status.pid, pid);
    assert!(status.http.is_none());

    assert!(client.shutdown().await.unwrap());
    assert!(!paths.has_markers());
}

/// Scenario: Second daemon on the same runtime directory
/// Given a running daemon
/// When another "querymux daemon" starts with the same runtime directory
/// Then it exits with a failure
/// And the first daemon keeps answering
#[tokio::test]
async fn test_second_daemon_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let runtime = dir.path().join("rt");

    let mut client = client(&runtime, &config);
    client.start().await.unwrap();

    let output = Command::new(BINARY)
        .arg("--config")
        .arg(&config)
        .arg("daemon")
        .env("QUERYMUX_RUNTIME_DIR", &runtime)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("already running"), "stderr: {stderr}");

    client.ping().await.unwrap();
    assert!(client.shutdown().await.unwrap());
}

/// Scenario: Status with no daemon
/// Given an empty runtime directory
/// When "querymux status" runs
/// Then it reports "stopped" without spawning anything
#[test]
fn test_status_does_not_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let runtime = dir.path().join("rt");

    let output = Command::new(BINARY)
        .arg("--config")
        .arg(&config)
        .arg("status")
        .env("QUERYMUX_RUNTIME_DIR", &runtime)
        .output()
        .unwrap();
    assert!(output.status.success());

    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["status"], "stopped");
    assert!(!runtime.join("daemon.pid").exists());
}
