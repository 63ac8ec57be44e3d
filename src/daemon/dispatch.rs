//! Transport-independent request handling.
//!
//! Every transport feeds decoded [`Request`]s into one [`ControlService`].
//! Line-framed transports share [`serve_lines`].

use super::protocol::{
    decode_params, encode_result, methods, resource_uri, DaemonStatus, PageEvent,
    RegisterSessionParams, Request, Response, RunQueryParams, RunQueryResult, TabInfo,
    TabInfoParams, TabParams, TestConnectionParams, SERVICE_NAME,
};
use crate::connector::ConnectorRegistry;
use crate::error::{QueryMuxError, Result};
use crate::query::{QueryExecutor, QueryRequest};
use serde_json::{json, Value as Json};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay between answering `shutdown` and tearing the daemon down, so the
/// reply reaches the caller.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

const PAGE_EVENT_CAPACITY: usize = 256;

/// Where the daemon is reachable, filled in as transports bind.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub socket: Option<String>,
    pub http: Option<String>,
    pub stdio: bool,
}

/// Handles control requests against one executor.
pub struct ControlService {
    executor: Arc<QueryExecutor>,
    connector_ids: Vec<String>,
    started: Instant,
    endpoints: RwLock<Endpoints>,
    pages: broadcast::Sender<PageEvent>,
    shutdown: CancellationToken,
}

impl ControlService {
    pub fn new(
        executor: Arc<QueryExecutor>,
        connectors: &ConnectorRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let (pages, _) = broadcast::channel(PAGE_EVENT_CAPACITY);
        Self {
            executor,
            connector_ids: connectors.ids(),
            started: Instant::now(),
            endpoints: RwLock::new(Endpoints::default()),
            pages,
            shutdown,
        }
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Token cancelled when a `shutdown` request arrives.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn set_endpoints(&self, endpoints: Endpoints) {
        *self.endpoints.write().unwrap_or_else(|e| e.into_inner()) = endpoints;
    }

    /// Subscribes to per-page progress.
    pub fn subscribe_pages(&self) -> broadcast::Receiver<PageEvent> {
        self.pages.subscribe()
    }

    /// Handles one raw JSON request. Blank input yields no response.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Request>(line) {
            Ok(request) => Some(self.handle(request).await),
            Err(e) => Some(Response::err(
                Json::Null,
                &QueryMuxError::invalid_request(format!("Malformed request: {e}")),
            )),
        }
    }

    /// Handles one request.
    pub async fn handle(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        debug!("Handling {method}");
        match self.dispatch(&method, params).await {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                debug!("{method} failed: {e}");
                Response::err(id, &e)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Json) -> Result<Json> {
        match method {
            methods::PING => Ok(json!({ "pong": true })),
            methods::STATUS => encode_result(&self.status()),
            methods::REGISTER_SESSION => self.register_session(decode_params(method, params)?),
            methods::RUN_QUERY => self.run_query(decode_params(method, params)?),
            methods::GET_TAB_INFO => self.get_tab_info(decode_params(method, params)?),
            methods::LIST_SESSIONS => encode_result(&self.executor.sessions().list_sessions()),
            methods::CANCEL_QUERY => {
                let (session, tab_id) = required_tab(decode_params(method, params)?)?;
                let cancelled = self.executor.cancel(session.as_deref(), &tab_id)?;
                Ok(json!({ "cancelled": cancelled }))
            }
            methods::CLOSE_TAB => {
                let (session, tab_id) = required_tab(decode_params(method, params)?)?;
                let closed = self.executor.close_tab(session.as_deref(), &tab_id)?;
                Ok(json!({ "closed": closed }))
            }
            methods::TEST_CONNECTION => self.test_connection(decode_params(method, params)?).await,
            methods::SHUTDOWN => {
                info!("Shutdown requested");
                let token = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                    token.cancel();
                });
                Ok(json!({ "stopping": true }))
            }
            other => Err(QueryMuxError::invalid_request(format!(
                "Unknown method '{other}'"
            ))),
        }
    }

    /// Current daemon status.
    pub fn status(&self) -> DaemonStatus {
        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        DaemonStatus {
            status: "running".to_string(),
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            uptime_secs: self.started.elapsed().as_secs(),
            socket: endpoints.socket,
            http: endpoints.http,
            stdio: endpoints.stdio,
            sessions: self.executor.sessions().session_count(),
            running_queries: self.executor.tokens().active_count(),
            connectors: self.connector_ids.clone(),
        }
    }

    fn register_session(&self, params: RegisterSessionParams) -> Result<Json> {
        let session_id = params
            .session
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| QueryMuxError::invalid_request("Session ID is required"))?;
        let session = self.executor.sessions().register_session(
            session_id.trim(),
            params.display_name.as_deref().unwrap_or(""),
            params.client_type.as_deref().unwrap_or("client"),
        );
        encode_result(&session.snapshot())
    }

    fn run_query(&self, params: RunQueryParams) -> Result<Json> {
        let request = QueryRequest::from(params);
        let session_id = request.session_id.trim().to_string();
        let pages = self.pages.clone();
        let tab_id = self
            .executor
            .submit(request, move |session_id, tab_id, page| {
                let _ = pages.send(PageEvent {
                    session_id: session_id.to_string(),
                    tab_id: tab_id.to_string(),
                    rows: page.data.len(),
                    terminal: page.is_terminal(),
                });
            })?;

        encode_result(&RunQueryResult {
            resource_uri: resource_uri(&session_id, &tab_id),
            tab_id,
            session_id,
        })
    }

    fn get_tab_info(&self, params: TabInfoParams) -> Result<Json> {
        let session_id = params
            .session
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| QueryMuxError::invalid_request("Session ID is required"))?;
        let (_, tab_id) = required_tab(TabParams {
            session: None,
            tab_id: params.tab_id,
        })?;

        let sessions = self.executor.sessions();
        let session = sessions
            .get_session(&session_id)
            .ok_or_else(|| QueryMuxError::not_found(format!("Session '{session_id}' not found")))?;
        let tab = session.tab(&tab_id).ok_or_else(|| {
            QueryMuxError::not_found(format!(
                "Tab '{tab_id}' not found in session '{session_id}'"
            ))
        })?;
        sessions.touch_session(&session_id);

        encode_result(&TabInfo::from_tab(
            &session_id,
            tab,
            params.offset.unwrap_or(0),
            params.limit,
        ))
    }

    async fn test_connection(&self, params: TestConnectionParams) -> Result<Json> {
        let outcome = self
            .executor
            .test_connection(
                params.connection_id.as_deref(),
                params.connection_profile.as_ref(),
                params.auth_header.as_deref(),
            )
            .await?;
        encode_result(&outcome)
    }
}

/// The optional session and the required tab id of a tab-addressed call.
fn required_tab(params: TabParams) -> Result<(Option<String>, String)> {
    let tab_id = params
        .tab_id
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| QueryMuxError::invalid_request("Tab ID is required"))?;
    Ok((params.session, tab_id))
}

/// Serves newline-framed requests from `reader`, answering on `writer`, until
/// the reader ends.
pub async fn serve_lines<R, W>(
    service: Arc<ControlService>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(response) = service.handle_line(&line).await else {
            continue;
        };
        let mut body = match serde_json::to_string(&response) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode response: {e}");
                continue;
            }
        };
        body.push('\n');
        writer.write_all(body.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
