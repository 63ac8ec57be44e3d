//! Control protocol messages.
//!
//! Requests and responses are JSON objects; the socket and stdio transports
//! frame them one per line. A response carries either `result` or `error`.

use crate::connector::{ColumnDef, PageStats, Row};
use crate::error::{ErrorKind, QueryMuxError, Result};
use crate::profiles::ConnectionProfile;
use crate::query::QueryRequest;
use crate::session::{Tab, TabStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Method names understood by the dispatcher.
pub mod methods {
    pub const PING: &str = "ping";
    pub const STATUS: &str = "status";
    pub const REGISTER_SESSION: &str = "register_session";
    pub const RUN_QUERY: &str = "run_query";
    pub const GET_TAB_INFO: &str = "get_tab_info";
    pub const LIST_SESSIONS: &str = "list_sessions";
    pub const CANCEL_QUERY: &str = "cancel_query";
    pub const CLOSE_TAB: &str = "close_tab";
    pub const TEST_CONNECTION: &str = "test_connection";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Name reported by the liveness endpoint.
pub const SERVICE_NAME: &str = "querymux";

/// Prefix of the line a daemon prints once it accepts connections.
pub const READY_PREFIX: &str = "QUERYMUX_READY";

/// Address of a tab's result, as handed back by `run_query`.
pub fn resource_uri(session_id: &str, tab_id: &str) -> String {
    format!("querymux://sessions/{session_id}/tabs/{tab_id}")
}

/// An inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Json,
    pub method: String,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub params: Json,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Json) -> Self {
        Self {
            id: Json::from(id),
            method: method.to_string(),
            params,
        }
    }
}

/// Error body of a failed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&QueryMuxError> for WireError {
    fn from(err: &QueryMuxError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message(),
            details: err.details().map(str::to_string),
        }
    }
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(id: Json, result: Json) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Json, error: &QueryMuxError) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError::from(error)),
        }
    }

    /// Converts back into a crate result on the client side.
    pub fn into_result(self) -> Result<Json> {
        match self.error {
            Some(e) => Err(QueryMuxError::from_wire(e.kind, e.message, e.details)),
            None => Ok(self.result.unwrap_or(Json::Null)),
        }
    }
}

/// Parameters of `register_session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSessionParams {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub client_type: Option<String>,
}

/// Parameters of `run_query`. Missing fields are reported by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryParams {
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_profile: Option<ConnectionProfile>,
    #[serde(default)]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub auth_header: Option<String>,
}

impl From<RunQueryParams> for QueryRequest {
    fn from(params: RunQueryParams) -> Self {
        QueryRequest {
            sql: params.sql.unwrap_or_default(),
            session_id: params.session.unwrap_or_default(),
            connection_id: params.connection_id,
            connection_profile: params.connection_profile,
            tab_id: params.tab_id,
            auth_header: params.auth_header,
        }
    }
}

impl From<&QueryRequest> for RunQueryParams {
    fn from(request: &QueryRequest) -> Self {
        Self {
            sql: Some(request.sql.clone()),
            session: Some(request.session_id.clone()),
            connection_id: request.connection_id.clone(),
            connection_profile: request.connection_profile.clone(),
            tab_id: request.tab_id.clone(),
            auth_header: request.auth_header.clone(),
        }
    }
}

/// Result of `run_query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryResult {
    pub tab_id: String,
    pub session_id: String,
    pub resource_uri: String,
}

/// Parameters of `get_tab_info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfoParams {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub tab_id: Option<String>,
    /// First row to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Maximum rows to return; all remaining rows when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Parameters of methods that address a single tab.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabParams {
    /// Needed only when the tab id exists in more than one session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default)]
    pub tab_id: Option<String>,
}

/// Parameters of `test_connection`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionParams {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_profile: Option<ConnectionProfile>,
    #[serde(default)]
    pub auth_header: Option<String>,
}

/// Result of `get_tab_info`: a window of a tab's rows plus its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub session_id: String,
    pub tab_id: String,
    pub title: String,
    pub query: String,
    pub status: TabStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    /// Total rows held by the tab.
    pub row_count: usize,
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PageStats>,
    pub updated_at: DateTime<Utc>,
    pub resource_uri: String,
}

impl TabInfo {
    /// Builds the view of `tab`, keeping rows in `[offset, offset + limit)`.
    pub fn from_tab(session_id: &str, tab: Tab, offset: usize, limit: Option<usize>) -> Self {
        let row_count = tab.rows.len();
        let start = offset.min(row_count);
        let end = limit.map_or(row_count, |l| start.saturating_add(l).min(row_count));
        let rows = if start == 0 && end == row_count {
            tab.rows
        } else {
            tab.rows[start..end].to_vec()
        };

        Self {
            session_id: session_id.to_string(),
            resource_uri: resource_uri(session_id, &tab.id),
            tab_id: tab.id,
            title: tab.title,
            query: tab.query,
            status: tab.status,
            connection_id: tab.connection_id,
            columns: tab.columns,
            rows,
            row_count,
            offset: start,
            error: tab.error,
            error_details: tab.error_details,
            stats: tab.stats,
            updated_at: tab.updated_at,
        }
    }

    /// Returns true while the tab's run may still change it.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, TabStatus::Created | TabStatus::Loading)
    }
}

/// Result of `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    pub stdio: bool,
    pub sessions: usize,
    pub running_queries: usize,
    pub connectors: Vec<String>,
}

/// Per-page progress pushed to event subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEvent {
    pub session_id: String,
    pub tab_id: String,
    pub rows: usize,
    pub terminal: bool,
}

/// Payload of the readiness line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyInfo {
    pub pid: u32,
    pub socket: String,
    #[serde(default)]
    pub http: Option<String>,
}

impl ReadyInfo {
    /// Formats the readiness line.
    pub fn line(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{READY_PREFIX} {body}")
    }

    /// Parses a readiness line; other lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let body = line.trim().strip_prefix(READY_PREFIX)?;
        serde_json::from_str(body.trim()).ok()
    }
}

/// Decodes typed parameters. Absent params decode as the defaults.
pub fn decode_params<P>(method: &str, params: Json) -> Result<P>
where
    P: serde::de::DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(P::default());
    }
    serde_json::from_value(params)
        .map_err(|e| QueryMuxError::invalid_request(format!("Invalid params for {method}: {e}")))
}

/// Serializes a result body.
pub fn encode_result<T: Serialize>(value: &T) -> Result<Json> {
    serde_json::to_value(value)
        .map_err(|e| QueryMuxError::internal(format!("Failed to encode response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Value;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_error_response_shape() {
        let err = QueryMuxError::routing("No valid connection profile found");
        let response = Response::err(json!(7), &err);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "id": 7,
                "error": {"kind": "routing", "message": "No valid connection profile found"}
            })
        );

        let back = response.into_result().unwrap_err();
        assert_eq!(back.kind(), ErrorKind::Routing);
        assert_eq!(back.to_string(), "No valid connection profile found");
    }

    #[test]
    fn test_query_error_keeps_details_apart() {
        let err = QueryMuxError::query("line 1: mismatched input", "SELEC 1").with_details("trace");
        let wire = WireError::from(&err);
        assert_eq!(wire.message, "line 1: mismatched input");
        assert_eq!(wire.details.as_deref(), Some("trace"));
    }

    #[test]
    fn test_run_query_params_camel_case() {
        let params: RunQueryParams = decode_params(
            methods::RUN_QUERY,
            json!({"sql": "SELECT 1", "session": "s", "connectionId": "wh", "tabId": "t"}),
        )
        .unwrap();
        let request = QueryRequest::from(params);
        assert_eq!(request.session_id, "s");
        assert_eq!(request.connection_id.as_deref(), Some("wh"));
        assert_eq!(request.tab_id.as_deref(), Some("t"));
    }

    #[test]
    fn test_bad_params_are_invalid_requests() {
        let err = decode_params::<TabParams>(methods::CANCEL_QUERY, json!({"tabId": 5}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.to_string().starts_with("Invalid params for cancel_query"));
    }

    #[test]
    fn test_tab_info_window() {
        let mut tab = Tab::new("t1", "SELECT n");
        tab.rows = (0..10).map(|i| vec![Value::Int(i)]).collect();

        let info = TabInfo::from_tab("s1", tab.clone(), 8, Some(5));
        assert_eq!(info.rows, vec![vec![Value::Int(8)], vec![Value::Int(9)]]);
        assert_eq!(info.row_count, 10);
        assert_eq!(info.resource_uri, "querymux://sessions/s1/tabs/t1");

        let past_end = TabInfo::from_tab("s1", tab, 50, None);
        assert!(past_end.rows.is_empty());
        assert_eq!(past_end.offset, 10);
    }

    #[test]
    fn test_ready_line() {
        let info = ReadyInfo {
            pid: 42,
            socket: "/tmp/q/daemon.sock".into(),
            http: Some("127.0.0.1:4000".into()),
        };
        let line = info.line();
        assert!(line.starts_with("QUERYMUX_READY {"));
        assert_eq!(ReadyInfo::parse_line(&line), Some(info));
        assert_eq!(ReadyInfo::parse_line("starting"), None);
    }
}
