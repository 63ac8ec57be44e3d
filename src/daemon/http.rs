//! HTTP transport with a server-sent event channel.
//!
//! `GET /status` is a liveness probe outside the control protocol.
//! `POST /rpc` answers a request in the response body. `GET /sse` opens an
//! event stream whose first `endpoint` event names a `POST /messages` URL;
//! requests posted there are answered as `message` events on that stream.
//! Session changes and page progress are pushed to every stream.

use super::dispatch::ControlService;
use super::protocol::{Response, SERVICE_NAME};
use crate::error::{QueryMuxError, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STREAM_BUFFER: usize = 64;

type Streams = Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>;

#[derive(Clone)]
struct HttpState {
    service: Arc<ControlService>,
    streams: Streams,
    shutdown: CancellationToken,
}

/// Builds the router.
pub fn router(service: Arc<ControlService>, shutdown: CancellationToken) -> Router {
    let state = HttpState {
        service,
        streams: Arc::new(Mutex::new(HashMap::new())),
        shutdown,
    };

    Router::new()
        .route("/status", get(handle_status))
        .route("/rpc", post(handle_rpc))
        .route("/sse", get(handle_sse))
        .route("/messages", post(handle_message))
        .with_state(state)
}

/// Binds the HTTP listener.
pub async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| QueryMuxError::process(format!("Failed to bind HTTP address {addr}: {e}")))?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// Serves HTTP until `shutdown` fires.
pub async fn serve(listener: TcpListener, service: Arc<ControlService>, shutdown: CancellationToken) {
    let app = router(service, shutdown.clone());
    let stop = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
    {
        warn!("HTTP transport failed: {e}");
    }
    debug!("HTTP transport stopped");
}

async fn handle_status() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "service": SERVICE_NAME,
        "pid": std::process::id(),
    }))
}

async fn handle_rpc(State(state): State<HttpState>, body: String) -> impl IntoResponse {
    match state.service.handle_line(&body).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(Response::err(
                serde_json::Value::Null,
                &QueryMuxError::invalid_request("Empty request"),
            )),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    stream: String,
}

async fn handle_message(
    State(state): State<HttpState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> impl IntoResponse {
    let sender = state
        .streams
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&query.stream)
        .cloned();
    let Some(sender) = sender else {
        return (StatusCode::NOT_FOUND, "Unknown stream").into_response();
    };

    let service = Arc::clone(&state.service);
    tokio::spawn(async move {
        let Some(response) = service.handle_line(&body).await else {
            return;
        };
        match serde_json::to_string(&response) {
            Ok(data) => {
                let _ = sender.send(Event::default().event("message").data(data)).await;
            }
            Err(e) => warn!("Failed to encode response: {e}"),
        }
    });

    StatusCode::ACCEPTED.into_response()
}

/// Removes a stream's reply channel when its SSE connection goes away.
struct StreamGuard {
    id: String,
    streams: Streams,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        debug!("SSE stream {} closed", self.id);
    }
}

async fn handle_sse(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    state
        .streams
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id.clone(), tx);
    info!("SSE stream {id} opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?stream={id}"));
    let guard = StreamGuard {
        id,
        streams: Arc::clone(&state.streams),
    };

    let replies = ReceiverStream::new(rx);
    let sessions = BroadcastStream::new(state.service.executor().sessions().subscribe())
        .filter_map(|event| async move {
            let event = event.ok()?;
            let data = serde_json::to_string(&event).ok()?;
            Some(Event::default().event("session").data(data))
        });
    let pages = BroadcastStream::new(state.service.subscribe_pages()).filter_map(|event| async move {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Event::default().event("page").data(data))
    });

    let events = stream::once(async move { endpoint })
        .chain(stream::select(replies, stream::select(sessions, pages)))
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(move |event| {
            let _ = &guard;
            Ok(event)
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}
