//! Failure classification shared by the connectors.
//!
//! Backends report failures as status codes where they can; when they don't,
//! the message text is the only signal left. Connectors consult their codes
//! first and fall back to [`classify_message`].

use crate::error::QueryMuxError;

/// The three kinds a backend failure is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Authentication,
    Connection,
    Query,
}

impl FailureKind {
    /// Builds the crate error for this kind. Query failures keep the SQL.
    pub fn into_error(self, message: impl Into<String>, sql: &str) -> QueryMuxError {
        match self {
            FailureKind::Authentication => QueryMuxError::authentication(message),
            FailureKind::Connection => QueryMuxError::connection(message),
            FailureKind::Query => QueryMuxError::query(message, sql),
        }
    }
}

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "password authentication",
    "invalid credentials",
    "access denied",
    "permission denied",
    "not authorized",
    "unauthorized",
    "forbidden",
];

const CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "could not connect",
    "connection reset",
    "connection closed",
    "broken pipe",
    "timed out",
    "timeout",
    "unreachable",
    "no route to host",
    "name or service not known",
    "failed to lookup address",
    "dns error",
    "certificate",
    "tls",
    "ssl",
    "unable to open database",
];

/// Classifies a failure from its message text alone.
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureKind::Authentication
    } else if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureKind::Connection
    } else {
        FailureKind::Query
    }
}

/// Classifies the non-database sqlx failures (transport, TLS, pool).
///
/// Returns `None` for `sqlx::Error::Database`, which carries a backend code
/// the connector should read itself.
pub fn classify_sqlx_transport(error: &sqlx::Error) -> Option<FailureKind> {
    match error {
        sqlx::Error::Database(_) => None,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Some(FailureKind::Connection),
        sqlx::Error::Configuration(_) => Some(FailureKind::Connection),
        other => Some(classify_message(&other.to_string())),
    }
}

/// Determines if a connect failure is transient and worth retrying.
pub fn is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();

    if lower.contains("authentication failed")
        || lower.contains("does not exist")
        || lower.contains("ssl")
        || lower.contains("tls")
    {
        return false;
    }

    lower.contains("connection refused")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("temporarily unavailable")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
}
