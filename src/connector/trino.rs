//! Trino connector implementation.
//!
//! Speaks the Trino client protocol over HTTP: POST the statement to
//! `/v1/statement`, then follow `nextUri` until it disappears. Each response
//! carrying data becomes a page.

use super::classify::{classify_message, FailureKind};
use super::{
    collect_rows, page_stream, ColumnDef, ConnectionTest, Connector, PageSink, PageStats,
    PageStream, QueryPage, Row,
};
use crate::error::{QueryMuxError, Result};
use crate::profiles::ConnectionProfile;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default timeout for a single protocol request.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Timeout for the best-effort DELETE sent on cancellation.
const CANCEL_TIMEOUT_SECS: u64 = 5;

/// Maximum attempts for a request the coordinator rejected as busy.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Error types Trino uses for authorization failures.
const PERMISSION_ERRORS: &[&str] = &["PERMISSION_DENIED", "UNAUTHORIZED", "ACCESS_DENIED"];

/// One response of the statement protocol.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub next_uri: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<TrinoColumn>>,
    #[serde(default)]
    pub data: Option<Vec<Row>>,
    #[serde(default)]
    pub stats: Option<TrinoStats>,
    #[serde(default)]
    pub error: Option<TrinoError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrinoColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinoStats {
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinoError {
    pub message: String,
    #[serde(default)]
    pub error_name: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailureInfo {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub stack: Vec<String>,
}

/// Parses a statement response body.
///
/// Integers outside ±(2^53 - 1) in `data` come back as decimal strings.
pub fn parse_statement_response(body: &str) -> Result<StatementResponse> {
    serde_json::from_str(body).map_err(|e| {
        QueryMuxError::connection(format!("Invalid response from Trino coordinator: {e}"))
            .with_details(body.chars().take(2000).collect::<String>())
    })
}

/// Connector for Trino coordinators.
#[derive(Debug, Clone)]
pub struct TrinoConnector {
    client: Client,
}

impl TrinoConnector {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build Trino HTTP client, using defaults: {e}");
                Client::new()
            });
        Self { client }
    }
}

impl Default for TrinoConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TrinoConnector {
    fn id(&self) -> &'static str {
        "trino"
    }

    fn validate_config(&self, profile: &ConnectionProfile) -> Option<String> {
        if profile.str_field("host").is_none() {
            return Some("Trino connection requires a host".to_string());
        }
        if profile.str_field("user").is_none() {
            return Some("Trino connection requires a user".to_string());
        }
        if profile.has_field("port")
            && profile
                .u64_field("port")
                .map_or(true, |p| p == 0 || p > 65535)
        {
            return Some("Trino port must be a number between 1 and 65535".to_string());
        }
        if profile.str_field("schema").is_some() && profile.str_field("catalog").is_none() {
            return Some("Trino schema requires a catalog".to_string());
        }
        None
    }

    fn run_query(
        &self,
        sql: &str,
        profile: &ConnectionProfile,
        auth_header: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> PageStream {
        let session = TrinoSession {
            client: self.client.clone(),
            base_url: base_url(profile),
            user: profile.str_field("user").unwrap_or("querymux").to_string(),
            source: profile.str_field("source").unwrap_or("querymux").to_string(),
            catalog: profile.str_field("catalog").map(str::to_string),
            schema: profile.str_field("schema").map(str::to_string),
            authorization: authorization(profile, auth_header),
        };
        let sql = sql.to_string();

        page_stream(cancel, move |sink| async move { session.run(&sql, &sink).await })
    }

    async fn test_connection(
        &self,
        profile: &ConnectionProfile,
        auth_header: Option<&str>,
    ) -> ConnectionTest {
        let probe = async {
            collect_rows(self.run_query("SELECT 1", profile, auth_header, None)).await?;

            if let Some(catalog) = profile.str_field("catalog") {
                let sql = format!("SHOW CATALOGS LIKE '{}'", escape_literal(catalog));
                let (_, rows) =
                    collect_rows(self.run_query(&sql, profile, auth_header, None)).await?;
                if rows.is_empty() {
                    return Err(QueryMuxError::query(
                        format!("Catalog '{catalog}' not found"),
                        sql,
                    ));
                }

                if let Some(schema) = profile.str_field("schema") {
                    let sql = format!(
                        "SHOW SCHEMAS FROM {} LIKE '{}'",
                        quote_ident(catalog),
                        escape_literal(schema)
                    );
                    let (_, rows) =
                        collect_rows(self.run_query(&sql, profile, auth_header, None)).await?;
                    if rows.is_empty() {
                        return Err(QueryMuxError::query(
                            format!("Schema '{schema}' not found in catalog '{catalog}'"),
                            sql,
                        ));
                    }
                }
            }
            Ok(())
        };

        match probe.await {
            Ok(()) => ConnectionTest::ok(),
            Err(e) => ConnectionTest::failed(e.to_string()),
        }
    }
}

/// Everything one run needs, owned by its producer task.
struct TrinoSession {
    client: Client,
    base_url: String,
    user: String,
    source: String,
    catalog: Option<String>,
    schema: Option<String>,
    authorization: Option<String>,
}

impl TrinoSession {
    async fn run(&self, sql: &str, sink: &PageSink) -> Result<()> {
        let submit = self
            .with_headers(self.client.post(format!("{}/v1/statement", self.base_url)))
            .body(sql.to_string());

        let mut response = tokio::select! {
            _ = sink.cancelled() => return Ok(()),
            response = self.send(submit, sql, sink) => match response? {
                Some(response) => response,
                None => return Ok(()),
            },
        };
        if let Some(id) = &response.id {
            debug!("Trino query {id} submitted");
        }

        let mut columns_sent = false;
        let mut rows = 0u64;

        loop {
            if let Some(error) = response.error.take() {
                return Err(map_trino_error(error, sql));
            }

            let mut page = QueryPage::new(response.data.take().unwrap_or_default());
            rows += page.data.len() as u64;
            if !columns_sent {
                if let Some(columns) = response.columns.take() {
                    page = page.with_columns(
                        columns
                            .into_iter()
                            .map(|c| ColumnDef::new(c.name, c.data_type))
                            .collect(),
                    );
                    columns_sent = true;
                }
            }
            if let Some(stats) = response.stats.take() {
                page = page.with_stats(PageStats::new(stats.state, Some(rows)));
            }

            let Some(next_uri) = response.next_uri.take() else {
                sink.send(page).await;
                return Ok(());
            };

            if !page.data.is_empty() || page.columns.is_some() {
                if !sink.send(page.with_next_token(next_uri.clone())).await {
                    self.cancel_remote(&next_uri).await;
                    return Ok(());
                }
            }

            let request = self.with_headers(self.client.get(&next_uri));
            response = tokio::select! {
                _ = sink.cancelled() => {
                    self.cancel_remote(&next_uri).await;
                    return Ok(());
                }
                response = self.send(request, sql, sink) => match response? {
                    Some(response) => response,
                    None => {
                        self.cancel_remote(&next_uri).await;
                        return Ok(());
                    }
                },
            };
        }
    }

    /// Sends a protocol request, retrying while the coordinator is busy.
    /// Returns `None` if cancelled during a retry wait.
    async fn send(
        &self,
        request: RequestBuilder,
        sql: &str,
        sink: &PageSink,
    ) -> Result<Option<StatementResponse>> {
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let attempt_request = request
                .try_clone()
                .ok_or_else(|| QueryMuxError::internal("Trino request body is not clonable"))?;
            let response = attempt_request.send().await.map_err(map_request_error)?;
            let status = response.status();

            if is_busy(status) && attempt < MAX_RETRY_ATTEMPTS {
                warn!(
                    "Trino coordinator busy (attempt {}), retrying in {:?}: {}",
                    attempt, delay, status
                );
                tokio::select! {
                    _ = sink.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay *= 2;
                continue;
            }

            let body = response.text().await.map_err(map_request_error)?;
            if !status.is_success() {
                return Err(map_status_error(status, &body, sql));
            }
            return parse_statement_response(&body).map(Some);
        }

        Err(QueryMuxError::connection("Trino coordinator stayed busy"))
    }

    /// Asks the coordinator to drop the query. Failures are only logged.
    async fn cancel_remote(&self, next_uri: &str) {
        let request = self
            .with_headers(self.client.delete(next_uri))
            .timeout(Duration::from_secs(CANCEL_TIMEOUT_SECS));
        match request.send().await {
            Ok(response) => debug!("Cancelled Trino query ({})", response.status()),
            Err(e) => debug!("Trino cancel request failed: {e}"),
        }
    }

    fn with_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        request = request
            .header("X-Trino-User", &self.user)
            .header("X-Trino-Source", &self.source);
        if let Some(catalog) = &self.catalog {
            request = request.header("X-Trino-Catalog", catalog);
        }
        if let Some(schema) = &self.schema {
            request = request.header("X-Trino-Schema", schema);
        }
        if let Some(auth) = &self.authorization {
            request = request.header("Authorization", auth);
        }
        request
    }
}

fn base_url(profile: &ConnectionProfile) -> String {
    let host = profile.str_field("host").unwrap_or("localhost");
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.trim_end_matches('/').to_string();
    }
    let ssl = profile.bool_field("ssl").unwrap_or(false);
    let port = profile
        .u64_field("port")
        .unwrap_or(if ssl { 443 } else { 8080 });
    let scheme = if ssl { "https" } else { "http" };
    format!("{scheme}://{host}:{port}")
}

/// An explicit auth header wins; otherwise Basic when a password is set.
fn authorization(profile: &ConnectionProfile, auth_header: Option<&str>) -> Option<String> {
    if let Some(header) = auth_header.filter(|h| !h.trim().is_empty()) {
        return Some(header.to_string());
    }
    let password = profile.str_field("password")?;
    let user = profile.str_field("user").unwrap_or_default();
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    Some(format!("Basic {encoded}"))
}

fn is_busy(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn map_request_error(error: reqwest::Error) -> QueryMuxError {
    if error.is_connect() || error.is_timeout() {
        QueryMuxError::connection(format!("Cannot reach Trino coordinator: {error}"))
    } else {
        match classify_message(&error.to_string()) {
            FailureKind::Authentication => QueryMuxError::authentication(error.to_string()),
            _ => QueryMuxError::connection(error.to_string()),
        }
    }
}

fn map_status_error(status: StatusCode, body: &str, sql: &str) -> QueryMuxError {
    let details = body.trim().chars().take(2000).collect::<String>();
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => QueryMuxError::authentication(
            format!("Trino rejected the credentials ({status})"),
        ),
        _ if status.is_client_error() => {
            QueryMuxError::query(format!("Trino rejected the request ({status})"), sql)
        }
        _ => QueryMuxError::connection(format!("Unexpected response from Trino ({status})")),
    };
    if details.is_empty() {
        err
    } else {
        err.with_details(details)
    }
}

/// Maps a coordinator error payload. Error names first, message second.
fn map_trino_error(error: TrinoError, sql: &str) -> QueryMuxError {
    let name = error.error_name.as_deref().unwrap_or_default();
    let kind = if PERMISSION_ERRORS.contains(&name) {
        FailureKind::Authentication
    } else if error.error_type.as_deref() == Some("USER_ERROR") {
        FailureKind::Query
    } else if error.error_type.is_some() {
        match classify_message(&error.message) {
            FailureKind::Authentication => FailureKind::Authentication,
            _ => FailureKind::Query,
        }
    } else {
        classify_message(&error.message)
    };

    let err = kind.into_error(error.message, sql);
    match error.failure_info {
        Some(info) if !info.stack.is_empty() => {
            let header = info.kind.unwrap_or_default();
            err.with_details(format!("{header}\n{}", info.stack.join("\n")).trim().to_string())
        }
        _ => err,
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Value;
    use pretty_assertions::assert_eq;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new("wh", "trino")
            .with_field("host", "trino.local")
            .with_field("user", "analyst")
    }

    #[test]
    fn test_validate_config() {
        let connector = TrinoConnector::new();
        assert!(connector.validate_config(&profile()).is_none());
        assert_eq!(
            connector.validate_config(&ConnectionProfile::new("x", "trino")),
            Some("Trino connection requires a host".to_string())
        );
        let schema_only = profile().with_field("schema", "default");
        assert_eq!(
            connector.validate_config(&schema_only),
            Some("Trino schema requires a catalog".to_string())
        );
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url(&profile()), "http://trino.local:8080");
        assert_eq!(
            base_url(&profile().with_field("ssl", true)),
            "https://trino.local:443"
        );
        assert_eq!(
            base_url(&profile().with_field("host", "https://gw.example.com/")),
            "https://gw.example.com"
        );
    }

    #[test]
    fn test_auth_header_wins_over_password() {
        let with_password = profile().with_field("password", "secret");
        assert_eq!(
            authorization(&with_password, Some("Bearer tok")),
            Some("Bearer tok".to_string())
        );
        assert_eq!(
            authorization(&with_password, None),
            Some("Basic YW5hbHlzdDpzZWNyZXQ=".to_string())
        );
        assert_eq!(authorization(&profile(), None), None);
    }

    #[test]
    fn test_large_integers_parse_as_strings() {
        let body = r#"{
            "id": "q1",
            "columns": [{"name": "big", "type": "bigint"}, {"name": "ratio", "type": "double"}],
            "data": [[9223372036854775807, 0.25], [42, 1.5]],
            "stats": {"state": "FINISHED"}
        }"#;
        let response = parse_statement_response(body).unwrap();
        let data = response.data.unwrap();
        assert_eq!(
            data[0],
            vec![Value::String("9223372036854775807".into()), Value::Float(0.25)]
        );
        assert_eq!(data[1], vec![Value::Int(42), Value::Float(1.5)]);
        assert!(response.next_uri.is_none());
    }

    #[test]
    fn test_integers_beyond_u64_are_not_rounded() {
        let response =
            parse_statement_response(r#"{"data":[[123456789012345678901234567890]]}"#).unwrap();
        assert_eq!(
            response.data.unwrap(),
            vec![vec![Value::String("123456789012345678901234567890".into())]]
        );
    }

    #[test]
    fn test_error_payload_classification() {
        let syntax = TrinoError {
            message: "line 1:1: mismatched input 'SELEC'".into(),
            error_name: Some("SYNTAX_ERROR".into()),
            error_type: Some("USER_ERROR".into()),
            failure_info: Some(FailureInfo {
                kind: Some("io.trino.sql.parser.ParsingException".into()),
                stack: vec!["at io.trino.sql.parser.SqlParser.invokeParser".into()],
            }),
        };
        let err = map_trino_error(syntax, "SELEC 1");
        assert!(matches!(err, QueryMuxError::Query { ref sql, .. } if sql == "SELEC 1"));
        assert!(err.details().unwrap().contains("ParsingException"));

        let denied = TrinoError {
            message: "Access Denied: Cannot select from table t".into(),
            error_name: Some("PERMISSION_DENIED".into()),
            error_type: Some("USER_ERROR".into()),
            failure_info: None,
        };
        assert!(matches!(
            map_trino_error(denied, "SELECT * FROM t"),
            QueryMuxError::Authentication { .. }
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            map_status_error(StatusCode::UNAUTHORIZED, "", "SELECT 1"),
            QueryMuxError::Authentication { .. }
        ));
        assert!(matches!(
            map_status_error(StatusCode::INTERNAL_SERVER_ERROR, "boom", "SELECT 1"),
            QueryMuxError::Connection { .. }
        ));
    }
}
