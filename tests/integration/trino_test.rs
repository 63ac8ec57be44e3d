//! Trino connector tests against a fake coordinator.
//!
//! The coordinator serves two canned queries: a short one that pages across
//! two `nextUri` hops, and one that never finishes.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use querymux::connector::{collect_rows, Connector, TrinoConnector, Value};
use querymux::error::ErrorKind;
use querymux::profiles::ConnectionProfile;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Coordinator {
    base: String,
    deletes: AtomicUsize,
    users: Mutex<Vec<String>>,
}

type Shared = Arc<Coordinator>;

async fn submit(
    State(state): State<Shared>,
    headers: HeaderMap,
    sql: String,
) -> Json<serde_json::Value> {
    if let Some(user) = headers.get("X-Trino-User").and_then(|v| v.to_str().ok()) {
        state.users.lock().unwrap().push(user.to_string());
    }

    if sql.contains("endless") {
        return Json(json!({
            "id": "q2",
            "nextUri": format!("{}/v1/statement/q2/1", state.base),
            "columns": [{"name": "n", "type": "bigint"}],
            "data": [[0]],
            "stats": {"state": "RUNNING"},
        }));
    }
    if sql.contains("broken") {
        return Json(json!({
            "id": "q3",
            "error": {
                "message": "line 1:8: Column 'broken' cannot be resolved",
                "errorName": "COLUMN_NOT_FOUND",
                "errorType": "USER_ERROR",
            },
            "stats": {"state": "FAILED"},
        }));
    }
    Json(json!({
        "id": "q1",
        "nextUri": format!("{}/v1/statement/q1/1", state.base),
        "columns": [{"name": "id", "type": "bigint"}, {"name": "big", "type": "bigint"}],
        "data": [[1, 9007199254740993_i64]],
        "stats": {"state": "RUNNING"},
    }))
}

async fn advance(
    State(state): State<Shared>,
    Path((id, token)): Path<(String, u64)>,
) -> Json<serde_json::Value> {
    match (id.as_str(), token) {
        ("q1", 1) => Json(json!({
            "id": "q1",
            "nextUri": format!("{}/v1/statement/q1/2", state.base),
            "data": [[2, 3]],
            "stats": {"state": "RUNNING"},
        })),
        ("q1", _) => Json(json!({
            "id": "q1",
            "stats": {"state": "FINISHED"},
        })),
        _ => {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Json(json!({
                "id": &id,
                "nextUri": format!("{}/v1/statement/{id}/{}", state.base, token + 1),
                "data": [[token]],
                "stats": {"state": "RUNNING"},
            }))
        }
    }
}

async fn cancel(State(state): State<Shared>) -> &'static str {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    ""
}

async fn start_coordinator() -> (Shared, ConnectionProfile) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(Coordinator {
        base: format!("http://{addr}"),
        ..Default::default()
    });

    let app = Router::new()
        .route("/v1/statement", post(submit))
        .route("/v1/statement/{id}/{token}", get(advance).delete(cancel))
        .with_state(Arc::clone(&state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let profile = ConnectionProfile::new("warehouse", "trino")
        .with_field("host", format!("http://{addr}"))
        .with_field("user", "analyst");
    (state, profile)
}

/// Scenario: A result spread over several responses
/// Given a coordinator that pages a query across two nextUri hops
/// When the query runs to completion
/// Then every row arrives once, in order
/// And an integer beyond 2^53 arrives as a decimal string
#[tokio::test]
async fn test_follows_next_uri_until_finished() {
    let (state, profile) = start_coordinator().await;
    let connector = TrinoConnector::new();

    let stream = connector.run_query("SELECT id, big FROM t", &profile, None, None);
    let (columns, rows) = collect_rows(stream).await.unwrap();

    assert_eq!(columns.len(), 2);
    assert_eq!(columns[1].data_type, "bigint");
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(1), Value::String("9007199254740993".into())],
            vec![Value::Int(2), Value::Int(3)],
        ]
    );
    assert_eq!(*state.users.lock().unwrap(), vec!["analyst".to_string()]);
    assert_eq!(state.deletes.load(Ordering::SeqCst), 0);
}

/// Scenario: Cancelling a query that never finishes
/// Given a coordinator that always returns another nextUri
/// When the caller cancels after the first page
/// Then the stream ends without an error
/// And the coordinator receives a DELETE for the query
#[tokio::test]
async fn test_cancel_sends_delete() {
    let (state, profile) = start_coordinator().await;
    let connector = TrinoConnector::new();
    let token = CancellationToken::new();

    let mut stream = connector.run_query(
        "SELECT n FROM endless",
        &profile,
        None,
        Some(token.clone()),
    );
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.columns.is_some());
    assert!(first.next_token.is_some());

    token.cancel();
    while let Some(item) = stream.next().await {
        assert!(item.is_ok());
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while state.deletes.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "no DELETE reached the coordinator");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Scenario: The coordinator reports a failed query
/// Given a response carrying an error payload
/// When the query runs
/// Then it fails with a query error naming the problem
#[tokio::test]
async fn test_error_payload_fails_the_query() {
    let (_state, profile) = start_coordinator().await;
    let connector = TrinoConnector::new();

    let err = collect_rows(connector.run_query("SELECT broken", &profile, None, None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert!(err.to_string().contains("cannot be resolved"));
}
