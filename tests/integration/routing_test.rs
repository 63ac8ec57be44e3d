//! Connection routing integration tests.
//!
//! Queries that read from a file path must run on the embedded engine, no
//! matter which connection the caller asked for.

use querymux::connector::{ConnectorRegistry, Value};
use querymux::error::ErrorKind;
use querymux::profiles::{ConnectionProfile, MemoryProfileStore};
use querymux::query::{QueryExecutor, QueryRequest, QuerySessionRegistry};
use querymux::session::{SessionManager, TabStatus};
use std::sync::Arc;

/// One unreachable Trino profile, so any query routed to it would fail.
fn executor() -> QueryExecutor {
    let warehouse = ConnectionProfile::new("warehouse", "trino")
        .with_field("host", "127.0.0.1")
        .with_field("port", 1)
        .with_field("user", "analyst");
    QueryExecutor::new(
        Arc::new(ConnectorRegistry::with_defaults(100)),
        Arc::new(MemoryProfileStore::new([warehouse])),
        Arc::new(SessionManager::new()),
        Arc::new(QuerySessionRegistry::new()),
    )
}

fn write_csv(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("events.csv");
    std::fs::write(&path, "id,kind\n1,open\n2,click\n3,close\n").unwrap();
    path
}

/// Scenario: Path literal with a connection id that does not exist
/// Given a query reading from an absolute CSV path
/// When it is submitted with connection id "nope"
/// Then it runs on the embedded engine
/// And the tab holds the file's rows
#[tokio::test]
async fn test_path_literal_ignores_invalid_connection_id() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_csv(dir.path());
    let executor = executor();

    let sql = format!("SELECT kind FROM '{}' ORDER BY id", csv.display());
    let summary = executor
        .execute(QueryRequest::new(sql, "s1").with_connection("nope"))
        .await
        .unwrap();

    let tab = executor.sessions().get_tab("s1", &summary.tab_id).unwrap();
    assert_eq!(tab.status, TabStatus::Success);
    assert_eq!(tab.connection_id.as_deref(), Some("file-auto"));
    assert_eq!(
        tab.rows,
        vec![
            vec![Value::String("open".into())],
            vec![Value::String("click".into())],
            vec![Value::String("close".into())],
        ]
    );
}

/// Scenario: Path literal preceded by a comment, padded inside its quotes
/// Given "-- note" on the first line and "'  <path> '" as the source
/// When the query runs with a valid but unrelated connection id
/// Then the file is still read by the embedded engine
#[tokio::test]
async fn test_path_literal_after_comment_with_padding() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_csv(dir.path());
    let executor = executor();

    let sql = format!(
        "-- note\nSELECT COUNT(*) AS n FROM '  {} '",
        csv.display()
    );
    let summary = executor
        .execute(QueryRequest::new(sql, "s1").with_connection("warehouse"))
        .await
        .unwrap();

    let tab = executor.sessions().get_tab("s1", &summary.tab_id).unwrap();
    assert_eq!(tab.status, TabStatus::Success, "error: {:?}", tab.error);
    assert_eq!(tab.rows, vec![vec![Value::Int(3)]]);
}

/// Scenario: Relative and home-relative paths that do not exist
/// Given "./" and "~/" path literals naming missing files
/// When each query runs with connection id "nope"
/// Then the failure is about the file, not about routing
#[tokio::test]
async fn test_missing_relative_files_fail_on_the_file() {
    let executor = executor();

    for path in [
        "./querymux-missing-dir/events.csv",
        "~/querymux-missing-dir/events.csv",
    ] {
        let sql = format!("SELECT * FROM '{path}'");
        let prepared = match executor.prepare(QueryRequest::new(sql, "s1").with_connection("nope")) {
            Ok(prepared) => prepared,
            Err(e) => panic!("{path}: routing failed: {e}"),
        };
        let tab_id = prepared.tab_id.clone();
        let err = executor.run(prepared, |_, _, _| {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection, "{path}: {err}");

        let tab = executor.sessions().get_tab("s1", &tab_id).unwrap();
        assert_eq!(tab.status, TabStatus::Error);
        let error = tab.error.unwrap_or_default();
        assert!(
            !error.contains("No valid connection profile found"),
            "{path}: {error}"
        );
    }
}

/// Scenario: Plain SQL with an unknown connection id
/// Given no path literal in the query
/// When it is submitted with connection id "nope"
/// Then preparing it fails with a routing error
/// And no tab is created
#[tokio::test]
async fn test_unknown_connection_without_path_is_routing_error() {
    let executor = executor();

    let err = executor
        .execute(QueryRequest::new("SELECT 1", "s1").with_connection("nope"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Routing);
    assert!(err.to_string().contains("No valid connection profile found"));
    assert!(executor
        .sessions()
        .get_session("s1")
        .map_or(true, |s| s.tab_count() == 0));
}
