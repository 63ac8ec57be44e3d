//! End-to-end query round trips through an in-process daemon.

use querymux::connector::Value;
use querymux::daemon::protocol::resource_uri;
use querymux::daemon::{Daemon, DaemonClient, DaemonHandle, DaemonOptions};
use querymux::profiles::{ConnectionProfile, MemoryProfileStore};
use querymux::query::QueryRequest;
use querymux::session::TabStatus;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

async fn start_daemon(dir: &Path) -> DaemonHandle {
    let options = DaemonOptions {
        runtime_dir: dir.to_path_buf(),
        stdio: false,
        http_addr: Some("127.0.0.1:0".to_string()),
        page_size: 100,
    };
    let local = ConnectionProfile::new("local", "sqlite").with_field("path", ":memory:");
    Daemon::new(options, Arc::new(MemoryProfileStore::new([local])))
        .start()
        .await
        .unwrap()
}

/// Scenario: SELECT 1 over the local socket
/// Given a daemon whose only profile is an in-memory SQLite database
/// When a client runs "SELECT 1" without naming a connection
/// Then the tab reaches "success" with one column and the row [1]
#[tokio::test]
async fn test_select_one_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_daemon(dir.path()).await;

    let mut client = DaemonClient::new(dir.path()).with_program("/nonexistent/querymux");
    client.start().await.unwrap();

    let submitted = client
        .run_query(&QueryRequest::new("SELECT 1", "agent-1"))
        .await
        .unwrap();
    assert_eq!(submitted.session_id, "agent-1");
    assert_eq!(
        submitted.resource_uri,
        resource_uri("agent-1", &submitted.tab_id)
    );

    let info = client
        .wait_for_tab("agent-1", &submitted.tab_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(info.status, TabStatus::Success, "error: {:?}", info.error);
    assert_eq!(info.columns.len(), 1);
    assert_eq!(info.rows, vec![vec![Value::Int(1)]]);
    assert_eq!(info.row_count, 1);
    assert_eq!(info.connection_id.as_deref(), Some("local"));

    handle.stop().await;
}

/// Scenario: The same tab read back over HTTP
/// Given a query submitted through the local socket
/// When get_tab_info is posted to the HTTP /rpc endpoint
/// Then both transports see the same tab
#[tokio::test]
async fn test_tab_is_shared_across_transports() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_daemon(dir.path()).await;
    let http = handle.ready.http.clone().unwrap();

    let mut client = DaemonClient::new(dir.path());
    let submitted = client
        .run_query(&QueryRequest::new("SELECT 'a' AS x UNION ALL SELECT 'b'", "s1"))
        .await
        .unwrap();
    client
        .wait_for_tab("s1", &submitted.tab_id, Duration::from_secs(10))
        .await
        .unwrap();

    let request = serde_json::json!({
        "id": 1,
        "method": "get_tab_info",
        "params": { "session": "s1", "tabId": submitted.tab_id, "offset": 1 },
    });
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{http}/rpc"))
        .body(request.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["status"], "success");
    assert_eq!(body["result"]["rowCount"], 2);
    assert_eq!(body["result"]["rows"], serde_json::json!([["b"]]));

    handle.stop().await;
}

/// Scenario: Closing a tab
/// Given a finished tab
/// When the client closes it
/// Then reading it back is a not-found error
/// And the session stays listed with no tabs
#[tokio::test]
async fn test_close_tab_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_daemon(dir.path()).await;

    let mut client = DaemonClient::new(dir.path());
    client
        .register_session("s1", "Notebook", "web")
        .await
        .unwrap();
    let submitted = client
        .run_query(&QueryRequest::new("SELECT 1", "s1"))
        .await
        .unwrap();
    client
        .wait_for_tab("s1", &submitted.tab_id, Duration::from_secs(10))
        .await
        .unwrap();

    assert!(client.close_tab(Some("s1"), &submitted.tab_id).await.unwrap());
    assert!(client
        .get_tab_info("s1", &submitted.tab_id, None, None)
        .await
        .is_err());

    let sessions = client.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].client_type, "web");
    assert!(sessions[0].tabs.is_empty());

    handle.stop().await;
}
