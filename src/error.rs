//! Error types for querymux.
//!
//! Defines the main error enum used throughout the daemon, the connectors
//! and the client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for querymux operations.
#[derive(Error, Debug)]
pub enum QueryMuxError {
    /// Transport failures (host unreachable, connection refused, TLS, etc.)
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        details: Option<String>,
    },

    /// Credential rejection or backend-reported authorization failure.
    #[error("Authentication error: {message}")]
    Authentication {
        message: String,
        details: Option<String>,
    },

    /// Syntax, semantic or runtime failure reported by the backend.
    #[error("Query error: {message}")]
    Query {
        message: String,
        /// The SQL that was submitted.
        sql: String,
        details: Option<String>,
    },

    /// A connection profile failed validation before any backend call.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No connection profile or connector could be resolved.
    #[error("{0}")]
    Routing(String),

    /// Tab or session quota rejection.
    #[error("{0}")]
    Capacity(String),

    /// The daemon failed to spawn or to become ready.
    #[error("Process error: {0}")]
    Process(String),

    /// A control request was missing or had malformed arguments.
    #[error("{0}")]
    InvalidRequest(String),

    /// Unknown session or tab.
    #[error("{0}")]
    NotFound(String),

    /// Local I/O failures (markers, sockets, files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryMuxError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            details: None,
        }
    }

    /// Creates an authentication error with the given message.
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication {
            message: msg.into(),
            details: None,
        }
    }

    /// Creates a query error carrying the offending SQL.
    pub fn query(msg: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: msg.into(),
            sql: sql.into(),
            details: None,
        }
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a routing error with the given message.
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// Creates a capacity error with the given message.
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    /// Creates a process error with the given message.
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Creates an invalid-request error with the given message.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates a not-found error with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Attaches a details blob (original backend message, stack) to errors
    /// that carry one. Other kinds are returned unchanged.
    pub fn with_details(mut self, blob: impl Into<String>) -> Self {
        let blob = blob.into();
        match &mut self {
            Self::Connection { details, .. }
            | Self::Authentication { details, .. }
            | Self::Query { details, .. } => *details = Some(blob),
            _ => {}
        }
        self
    }

    /// Returns the details blob, if any.
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Connection { details, .. }
            | Self::Authentication { details, .. }
            | Self::Query { details, .. } => details.as_deref(),
            _ => None,
        }
    }

    /// Returns the primary message without the category prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Connection { message, .. }
            | Self::Authentication { message, .. }
            | Self::Query { message, .. } => message.clone(),
            Self::Config(msg)
            | Self::Routing(msg)
            | Self::Capacity(msg)
            | Self::Process(msg)
            | Self::InvalidRequest(msg)
            | Self::NotFound(msg)
            | Self::Internal(msg) => msg.clone(),
            Self::Io(e) => e.to_string(),
        }
    }

    /// Returns the stable machine-readable kind used on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Query { .. } => ErrorKind::Query,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Routing(_) => ErrorKind::Routing,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::Process(_) => ErrorKind::Process,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection Error",
            Self::Authentication { .. } => "Authentication Error",
            Self::Query { .. } => "Query Error",
            Self::Config(_) => "Configuration Error",
            Self::Routing(_) => "Routing Error",
            Self::Capacity(_) => "Capacity Error",
            Self::Process(_) => "Process Error",
            Self::InvalidRequest(_) => "Invalid Request",
            Self::NotFound(_) => "Not Found",
            Self::Io(_) => "I/O Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Rebuilds an error from its wire form (used by the daemon client).
    pub fn from_wire(kind: ErrorKind, message: String, details: Option<String>) -> Self {
        let err = match kind {
            ErrorKind::Connection => Self::connection(message),
            ErrorKind::Authentication => Self::authentication(message),
            ErrorKind::Query => Self::query(message, String::new()),
            ErrorKind::Configuration => Self::Config(message),
            ErrorKind::Routing => Self::Routing(message),
            ErrorKind::Capacity => Self::Capacity(message),
            ErrorKind::Process => Self::Process(message),
            ErrorKind::InvalidRequest => Self::InvalidRequest(message),
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::Internal => Self::Internal(message),
        };
        match details {
            Some(d) => err.with_details(d),
            None => err,
        }
    }
}

/// Machine-readable error kind carried by protocol error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    Query,
    Configuration,
    Routing,
    Capacity,
    Process,
    InvalidRequest,
    NotFound,
    Internal,
}

/// Result type alias using QueryMuxError.
pub type Result<T> = std::result::Result<T, QueryMuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connection() {
        let err = QueryMuxError::connection("Cannot connect to localhost:8080");
        assert_eq!(
            err.to_string(),
            "Connection error: Cannot connect to localhost:8080"
        );
        assert_eq!(err.category(), "Connection Error");
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_error_display_query_keeps_sql() {
        let err = QueryMuxError::query("column \"emal\" does not exist", "SELECT emal FROM users");
        assert_eq!(
            err.to_string(),
            "Query error: column \"emal\" does not exist"
        );
        match err {
            QueryMuxError::Query { sql, .. } => assert_eq!(sql, "SELECT emal FROM users"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_routing_message_is_verbatim() {
        let err = QueryMuxError::routing("No valid connection profile found");
        assert_eq!(err.to_string(), "No valid connection profile found");
        assert_eq!(err.category(), "Routing Error");
    }

    #[test]
    fn test_details_are_separate_from_message() {
        let err = QueryMuxError::query("line 1:8: mismatched input", "SELEC 1")
            .with_details("io.trino.sql.parser.ParsingException: ...");
        assert_eq!(err.message(), "line 1:8: mismatched input");
        assert_eq!(
            err.details(),
            Some("io.trino.sql.parser.ParsingException: ...")
        );
    }

    #[test]
    fn test_with_details_ignored_for_plain_kinds() {
        let err = QueryMuxError::capacity("Tab limit reached").with_details("ignored");
        assert!(err.details().is_none());
    }

    #[test]
    fn test_wire_round_trip_preserves_kind() {
        let err = QueryMuxError::from_wire(
            ErrorKind::Authentication,
            "bad password".to_string(),
            Some("401".to_string()),
        );
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.details(), Some("401"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<QueryMuxError>();
    }
}
