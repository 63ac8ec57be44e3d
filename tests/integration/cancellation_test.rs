//! Cancellation against a real backend.
//!
//! The query below never ends on its own, so every test here only finishes
//! if cancellation reaches the SQLite connection.

use querymux::connector::{ConnectionGauge, ConnectorRegistry, SqliteConnector};
use querymux::daemon::{Daemon, DaemonOptions};
use querymux::profiles::{ConnectionProfile, MemoryProfileStore};
use querymux::query::{QueryExecutor, QueryRequest, QuerySessionRegistry};
use querymux::session::{SessionManager, TabStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ENDLESS: &str =
    "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c) SELECT n FROM c";

fn sqlite() -> (ConnectorRegistry, ConnectionGauge) {
    let connector = Arc::new(SqliteConnector::new(10));
    let gauge = connector.gauge();
    let mut registry = ConnectorRegistry::new();
    registry.register(connector);
    (registry, gauge)
}

fn memory_store() -> Arc<MemoryProfileStore> {
    Arc::new(MemoryProfileStore::new([
        ConnectionProfile::new("mem", "sqlite").with_field("path", ":memory:")
    ]))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Scenario: Cancelling a running query
/// Given an endless query that has already delivered rows
/// When its tab is cancelled
/// Then the tab is "cancelled" and stops growing
/// And the SQLite connection is released
#[tokio::test]
async fn test_cancel_stops_endless_query() {
    let (registry, gauge) = sqlite();
    let executor = Arc::new(QueryExecutor::new(
        Arc::new(registry),
        memory_store(),
        Arc::new(SessionManager::new()),
        Arc::new(QuerySessionRegistry::new()),
    ));

    let tab_id = executor
        .submit(QueryRequest::new(ENDLESS, "s1"), |_, _, _| {})
        .unwrap();
    wait_until("first rows", || {
        executor
            .sessions()
            .get_tab("s1", &tab_id)
            .is_some_and(|tab| !tab.rows.is_empty())
    })
    .await;

    assert!(executor.cancel(Some("s1"), &tab_id).unwrap());
    let rows_at_cancel = executor.sessions().get_tab("s1", &tab_id).unwrap().rows.len();

    wait_until("connection release", || gauge.open_count() == 0).await;
    wait_until("token release", || !executor.tokens().is_active("s1", &tab_id)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let tab = executor.sessions().get_tab("s1", &tab_id).unwrap();
    assert_eq!(tab.status, TabStatus::Cancelled);
    assert_eq!(tab.rows.len(), rows_at_cancel);
    assert!(gauge.released_count() >= 1);
}

/// Scenario: Resubmitting into a busy tab
/// Given an endless query running on tab "t1"
/// When "SELECT 42" is submitted to the same tab
/// Then the first run is cancelled and its connection released
/// And the tab ends up holding only the new result
#[tokio::test]
async fn test_resubmission_cancels_previous_run() {
    let (registry, gauge) = sqlite();
    let executor = Arc::new(QueryExecutor::new(
        Arc::new(registry),
        memory_store(),
        Arc::new(SessionManager::new()),
        Arc::new(QuerySessionRegistry::new()),
    ));

    executor
        .submit(QueryRequest::new(ENDLESS, "s1").with_tab("t1"), |_, _, _| {})
        .unwrap();
    wait_until("first rows", || {
        executor
            .sessions()
            .get_tab("s1", "t1")
            .is_some_and(|tab| !tab.rows.is_empty())
    })
    .await;

    executor
        .submit(QueryRequest::new("SELECT 42", "s1").with_tab("t1"), |_, _, _| {})
        .unwrap();
    wait_until("second run", || {
        executor
            .sessions()
            .get_tab("s1", "t1")
            .is_some_and(|tab| tab.status == TabStatus::Success)
    })
    .await;
    wait_until("connection release", || gauge.open_count() == 0).await;

    let tab = executor.sessions().get_tab("s1", "t1").unwrap();
    assert_eq!(tab.query, "SELECT 42");
    assert_eq!(tab.rows.len(), 1);
}

/// Scenario: A session goes away mid-query
/// Given a daemon running an endless query for session "s1"
/// When the session is removed
/// Then the daemon cancels the run and releases its connection
#[tokio::test]
async fn test_removed_session_cancels_its_queries() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, gauge) = sqlite();
    let options = DaemonOptions {
        runtime_dir: dir.path().to_path_buf(),
        stdio: false,
        http_addr: None,
        page_size: 10,
    };
    let handle = Daemon::with_connectors(options, memory_store(), registry)
        .start()
        .await
        .unwrap();
    let executor = Arc::clone(handle.service().executor());

    let tab_id = executor
        .submit(QueryRequest::new(ENDLESS, "s1"), |_, _, _| {})
        .unwrap();
    wait_until("connection open", || gauge.open_count() == 1).await;

    assert!(executor.sessions().remove_session("s1").is_some());
    assert!(!executor.tokens().is_active("s1", &tab_id));
    wait_until("connection release", || gauge.open_count() == 0).await;

    handle.stop().await;
}

/// Scenario: Two sessions pick the same tab id
/// Given sessions "alice" and "bob" each running an endless query on tab "t1"
/// When bob's tab is cancelled
/// Then bob's tab is "cancelled"
/// And alice's query keeps delivering rows until she cancels it too
#[tokio::test]
async fn test_shared_tab_id_is_cancelled_per_session() {
    let (registry, gauge) = sqlite();
    let executor = Arc::new(QueryExecutor::new(
        Arc::new(registry),
        memory_store(),
        Arc::new(SessionManager::new()),
        Arc::new(QuerySessionRegistry::new()),
    ));

    for session in ["alice", "bob"] {
        executor
            .submit(QueryRequest::new(ENDLESS, session).with_tab("t1"), |_, _, _| {})
            .unwrap();
    }
    wait_until("both connections", || gauge.open_count() == 2).await;

    assert!(executor.cancel(Some("bob"), "t1").unwrap());
    wait_until("bob's connection release", || gauge.open_count() == 1).await;
    let bob = executor.sessions().get_tab("bob", "t1").unwrap();
    assert_eq!(bob.status, TabStatus::Cancelled);

    let rows_before = executor.sessions().get_tab("alice", "t1").unwrap().rows.len();
    wait_until("alice's rows", || {
        executor
            .sessions()
            .get_tab("alice", "t1")
            .is_some_and(|tab| tab.rows.len() > rows_before)
    })
    .await;
    assert!(executor.tokens().is_active("alice", "t1"));

    assert!(executor.cancel(Some("alice"), "t1").unwrap());
    wait_until("connection release", || gauge.open_count() == 0).await;
}
