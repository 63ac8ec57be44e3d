//! Query execution against resolved connectors.
//!
//! Resolves the profile and connector for a submission, prepares its tab, and
//! drives the connector's pages into session state. Preparation is
//! synchronous so routing and validation failures reach the caller directly;
//! backend failures land on the tab.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::routing::{resolve_profile, Route};
use super::tokens::{QuerySessionRegistry, QueryToken};
use crate::connector::{ConnectionTest, Connector, ConnectorRegistry, QueryPage};
use crate::error::{QueryMuxError, Result};
use crate::profiles::{ConnectionProfile, ProfileStore};
use crate::session::{SessionManager, Tab, TabStatus};

/// Client type recorded for sessions created implicitly by a query.
pub const IMPLICIT_CLIENT_TYPE: &str = "agent";

/// A query submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub sql: String,
    pub session_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_profile: Option<ConnectionProfile>,
    /// Reuses an existing tab; its previous run is cancelled.
    #[serde(default)]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub auth_header: Option<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_profile(mut self, profile: ConnectionProfile) -> Self {
        self.connection_profile = Some(profile);
        self
    }

    pub fn with_tab(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }
}

/// A prepared run: its tab exists and its token is live.
pub struct PreparedQuery {
    pub session_id: String,
    pub tab_id: String,
    pub profile: ConnectionProfile,
    connector: Arc<dyn Connector>,
    token: QueryToken,
    sql: String,
    auth_header: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub tab_id: String,
    pub row_count: usize,
    pub cancelled: bool,
}

/// Ties submissions to connectors and session state.
pub struct QueryExecutor {
    connectors: Arc<ConnectorRegistry>,
    profiles: Arc<dyn ProfileStore>,
    sessions: Arc<SessionManager>,
    tokens: Arc<QuerySessionRegistry>,
}

impl QueryExecutor {
    pub fn new(
        connectors: Arc<ConnectorRegistry>,
        profiles: Arc<dyn ProfileStore>,
        sessions: Arc<SessionManager>,
        tokens: Arc<QuerySessionRegistry>,
    ) -> Self {
        // Evicted or removed sessions stop their runs.
        sessions.add_removal_listener(tokens.clone());
        Self {
            connectors,
            profiles,
            sessions,
            tokens,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tokens(&self) -> &Arc<QuerySessionRegistry> {
        &self.tokens
    }

    /// Resolves the profile and connector, and validates the profile.
    pub fn resolve(
        &self,
        sql: Option<&str>,
        connection_id: Option<&str>,
        inline: Option<&ConnectionProfile>,
    ) -> Result<(Route, Arc<dyn Connector>)> {
        let route = resolve_profile(sql, connection_id, inline, self.profiles.as_ref())?;
        let connector = self.connector_for(&route.profile)?;
        Ok((route, connector))
    }

    fn connector_for(&self, profile: &ConnectionProfile) -> Result<Arc<dyn Connector>> {
        let connector = self.connectors.get(&profile.kind).ok_or_else(|| {
            QueryMuxError::routing(format!("Connector '{}' not registered", profile.kind))
        })?;
        if let Some(message) = connector.validate_config(profile) {
            return Err(QueryMuxError::config(message));
        }
        Ok(connector)
    }

    /// Validates a submission and creates (or resets) its tab.
    pub fn prepare(&self, request: QueryRequest) -> Result<PreparedQuery> {
        let sql = request.sql.trim();
        if sql.is_empty() {
            return Err(QueryMuxError::invalid_request("SQL query is required"));
        }
        let session_id = request.session_id.trim();
        if session_id.is_empty() {
            return Err(QueryMuxError::invalid_request("Session ID is required"));
        }

        let (route, connector) = self.resolve(
            Some(sql),
            request.connection_id.as_deref(),
            request.connection_profile.as_ref(),
        )?;

        let session = match self.sessions.get_session(session_id) {
            Some(session) => session,
            None => self
                .sessions
                .register_session(session_id, "", IMPLICIT_CLIENT_TYPE),
        };

        let tab_id = request
            .tab_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reusing = session.tab(&tab_id).is_some();
        if !reusing && !self.sessions.can_add_tab(session_id) {
            return Err(QueryMuxError::capacity(format!(
                "Tab limit reached for session '{session_id}'"
            )));
        }

        // Replacing the token cancels any run still feeding this tab.
        let token = self.tokens.create_session(session_id, &tab_id);
        let tab = Tab::new(&tab_id, sql)
            .with_connection(Some(route.profile.id.clone()))
            .with_run(token.generation());
        if !self.sessions.add_tab(session_id, tab) {
            self.tokens.release(&token);
            return Err(QueryMuxError::capacity(format!(
                "Tab limit reached for session '{session_id}'"
            )));
        }

        debug!(
            "Prepared tab {tab_id} in session {session_id} on {}",
            route.profile.display_string()
        );
        Ok(PreparedQuery {
            session_id: session_id.to_string(),
            tab_id,
            profile: route.profile,
            connector,
            token,
            sql: sql.to_string(),
            auth_header: request.auth_header,
        })
    }

    /// Drives a prepared run to completion, feeding pages to its tab and to
    /// `on_page`. A cancelled run ends without an error.
    pub async fn run(
        &self,
        prepared: PreparedQuery,
        mut on_page: impl FnMut(&str, &str, &QueryPage) + Send,
    ) -> Result<ExecutionSummary> {
        let PreparedQuery {
            session_id,
            tab_id,
            profile,
            connector,
            token,
            sql,
            auth_header,
        } = prepared;

        // A tab is only written by the submission it currently belongs to.
        let run = token.generation();
        let owns = |tab: &Tab| tab.run == run && !token.is_cancelled();

        self.sessions.update_tab_with(&session_id, &tab_id, |tab| {
            if !owns(tab) {
                return false;
            }
            tab.status = TabStatus::Loading;
            true
        });

        let mut stream = connector.run_query(
            &sql,
            &profile,
            auth_header.as_deref(),
            Some(token.token().clone()),
        );
        let mut row_count = 0;

        while let Some(item) = stream.next().await {
            match item {
                Ok(page) => {
                    row_count += page.data.len();
                    let applied = self.sessions.update_tab_with(&session_id, &tab_id, |tab| {
                        if !owns(tab) {
                            return false;
                        }
                        tab.append_page(&page);
                        true
                    });
                    if applied {
                        on_page(&session_id, &tab_id, &page);
                    }
                }
                Err(e) => {
                    drop(stream);
                    let recorded = self.sessions.update_tab_with(&session_id, &tab_id, |tab| {
                        if !owns(tab) {
                            return false;
                        }
                        tab.fail(&e);
                        true
                    });
                    if !recorded {
                        self.settle_revoked(&token);
                    }
                    self.tokens.release(&token);
                    warn!("Query on tab {tab_id} failed: {e}");
                    return Err(e);
                }
            }
        }
        drop(stream);

        let completed = self.sessions.update_tab_with(&session_id, &tab_id, |tab| {
            if !owns(tab) {
                return false;
            }
            tab.status = TabStatus::Success;
            true
        });
        if !completed {
            self.settle_revoked(&token);
        }
        self.tokens.release(&token);

        if completed {
            info!("Query on tab {tab_id} finished with {row_count} rows");
        } else {
            info!("Query on tab {tab_id} was cancelled");
        }
        Ok(ExecutionSummary {
            tab_id,
            row_count,
            cancelled: !completed,
        })
    }

    /// Leaves a revoked run's tab `cancelled` unless a newer submission owns
    /// it or it already reached a terminal state.
    fn settle_revoked(&self, token: &QueryToken) {
        self.sessions
            .update_tab_with(token.session_id(), token.tab_id(), |tab| {
                if tab.run != token.generation() || tab.status.is_terminal() {
                    return false;
                }
                tab.status = TabStatus::Cancelled;
                true
            });
    }

    /// Prepares and runs a query, waiting for it to finish.
    pub async fn execute(&self, request: QueryRequest) -> Result<ExecutionSummary> {
        let prepared = self.prepare(request)?;
        self.run(prepared, |_, _, _| {}).await
    }

    /// Prepares a query and runs it in the background. Returns the tab id.
    pub fn submit(
        self: &Arc<Self>,
        request: QueryRequest,
        on_page: impl FnMut(&str, &str, &QueryPage) + Send + 'static,
    ) -> Result<String> {
        let prepared = self.prepare(request)?;
        let tab_id = prepared.tab_id.clone();
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            // Failures are recorded on the tab.
            let _ = executor.run(prepared, on_page).await;
        });
        Ok(tab_id)
    }

    /// Resolves the session holding `tab_id`. Without an explicit session the
    /// tab id must be unique across sessions.
    fn owner_of(&self, session_id: Option<&str>, tab_id: &str) -> Result<Option<String>> {
        if let Some(session_id) = session_id.map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(Some(session_id.to_string()));
        }
        let mut owners = self.sessions.sessions_with_tab(tab_id);
        if owners.len() > 1 {
            return Err(QueryMuxError::invalid_request(format!(
                "Tab '{tab_id}' exists in sessions {}; name the session",
                owners.join(", ")
            )));
        }
        Ok(owners.pop())
    }

    /// Cancels the run on a tab. A tab still in flight becomes `cancelled`.
    pub fn cancel(&self, session_id: Option<&str>, tab_id: &str) -> Result<bool> {
        let Some(session_id) = self.owner_of(session_id, tab_id)? else {
            return Ok(false);
        };
        let cancelled = self.tokens.cancel_session(&session_id, tab_id);
        self.sessions.update_tab_with(&session_id, tab_id, |tab| {
            if tab.status.is_terminal() {
                return false;
            }
            tab.status = TabStatus::Cancelled;
            true
        });
        if cancelled {
            info!("Cancelled query on tab {tab_id} in session {session_id}");
        }
        Ok(cancelled)
    }

    /// Cancels any run on a tab and removes the tab.
    pub fn close_tab(&self, session_id: Option<&str>, tab_id: &str) -> Result<bool> {
        let Some(session_id) = self.owner_of(session_id, tab_id)? else {
            return Ok(false);
        };
        self.tokens.cancel_session(&session_id, tab_id);
        Ok(self.sessions.remove_tab(&session_id, tab_id).is_some())
    }

    /// Probes a connection without touching session state.
    pub async fn test_connection(
        &self,
        connection_id: Option<&str>,
        inline: Option<&ConnectionProfile>,
        auth_header: Option<&str>,
    ) -> Result<ConnectionTest> {
        let (route, connector) = self.resolve(None, connection_id, inline)?;
        Ok(connector.test_connection(&route.profile, auth_header).await)
    }

    /// Probes an explicit profile of the given connector type.
    pub async fn test_profile(
        &self,
        profile: &ConnectionProfile,
        auth_header: Option<&str>,
    ) -> Result<ConnectionTest> {
        let connector = self.connector_for(profile)?;
        Ok(connector.test_connection(profile, auth_header).await)
    }
}
