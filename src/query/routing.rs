//! Connection profile resolution.
//!
//! Order: an inline profile, then a path literal in the SQL (always the
//! embedded engine), then the named connection, then the only stored profile
//! when exactly one exists.

use crate::connector::files::references_path_literal;
use crate::error::{QueryMuxError, Result};
use crate::profiles::{ConnectionProfile, ProfileStore};
use tracing::debug;

/// Id of the profile file queries are routed to.
pub const FILE_AUTO_PROFILE_ID: &str = "file-auto";

/// Message for the case where nothing resolves.
pub const NO_PROFILE_MESSAGE: &str = "No valid connection profile found";

/// Why a profile was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Supplied with the request.
    Inline,
    /// The SQL reads from a file path.
    PathLiteral,
    /// Named by connection id.
    Named,
    /// The only stored profile.
    SoleProfile,
}

/// A resolved profile.
#[derive(Debug, Clone)]
pub struct Route {
    pub profile: ConnectionProfile,
    pub source: RouteSource,
}

/// The in-memory embedded-engine profile used for file queries.
pub fn file_auto_profile() -> ConnectionProfile {
    let mut profile =
        ConnectionProfile::new(FILE_AUTO_PROFILE_ID, "sqlite").with_field("path", ":memory:");
    profile.name = "Files".to_string();
    profile
}

/// Resolves the profile a query runs against.
///
/// `sql` is `None` for connection tests, which skip path-literal routing.
pub fn resolve_profile(
    sql: Option<&str>,
    connection_id: Option<&str>,
    inline: Option<&ConnectionProfile>,
    store: &dyn ProfileStore,
) -> Result<Route> {
    if let Some(profile) = inline {
        let mut profile = profile.clone();
        if profile.id.is_empty() {
            profile.id = "inline".to_string();
        }
        if profile.name.is_empty() {
            profile.name = profile.id.clone();
        }
        return Ok(Route {
            profile,
            source: RouteSource::Inline,
        });
    }

    if sql.is_some_and(references_path_literal) {
        if let Some(requested) = connection_id {
            debug!("Query reads from a file path; ignoring requested connection '{requested}'");
        }
        return Ok(Route {
            profile: file_auto_profile(),
            source: RouteSource::PathLiteral,
        });
    }

    let connection_id = connection_id.map(str::trim).filter(|id| !id.is_empty());
    if let Some(id) = connection_id {
        return match store.get(id) {
            Some(profile) => Ok(Route {
                profile,
                source: RouteSource::Named,
            }),
            None => Err(QueryMuxError::routing(format!(
                "{NO_PROFILE_MESSAGE} (connection '{id}' does not exist)"
            ))),
        };
    }

    let mut profiles = store.list();
    if profiles.len() == 1 {
        if let Some(profile) = profiles.pop() {
            return Ok(Route {
                profile,
                source: RouteSource::SoleProfile,
            });
        }
    }

    Err(QueryMuxError::routing(NO_PROFILE_MESSAGE))
}
