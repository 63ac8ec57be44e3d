//! Connection profiles and the stores they are read from.
//!
//! Profiles are created by configuration (the TOML config file or an inline
//! override sent with a request) and are read-only to the query core. Each
//! connector validates its own type-specific fields.

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

/// A named connection to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Stable identifier.
    #[serde(default)]
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Connector id this profile targets ("trino", "postgres", ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific fields.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionProfile {
    /// Creates a profile with no type-specific fields.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: kind.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Sets a type-specific field.
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Returns a non-empty string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns a numeric field, accepting numbers or numeric strings.
    pub fn u64_field(&self, key: &str) -> Option<u64> {
        match self.fields.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns a boolean field, accepting booleans or "true"/"false".
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        match self.fields.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns true if the field is present at all (even if malformed).
    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Returns a display-safe string (no password) for logs.
    pub fn display_string(&self) -> String {
        format!("{} ({})", self.name, self.kind)
    }
}

/// Read access to stored connection profiles.
pub trait ProfileStore: Send + Sync {
    /// Looks up a profile by id.
    fn get(&self, id: &str) -> Option<ConnectionProfile>;

    /// Lists all stored profiles.
    fn list(&self) -> Vec<ConnectionProfile>;
}

/// Profiles held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryProfileStore {
    profiles: BTreeMap<String, ConnectionProfile>,
}

impl MemoryProfileStore {
    pub fn new(profiles: impl IntoIterator<Item = ConnectionProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, id: &str) -> Option<ConnectionProfile> {
        self.profiles.get(id).cloned()
    }

    fn list(&self) -> Vec<ConnectionProfile> {
        self.profiles.values().cloned().collect()
    }
}

/// Profiles read from the `[connections]` tables of the config file.
///
/// The file is re-read on every lookup so edits are picked up by a running
/// daemon without a restart.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Vec<ConnectionProfile> {
        match Config::load_from_file(&self.path) {
            Ok(config) => config.profiles(),
            Err(e) => {
                warn!("Could not read connection profiles: {e}");
                Vec::new()
            }
        }
    }
}

impl ProfileStore for FileProfileStore {
    fn get(&self, id: &str) -> Option<ConnectionProfile> {
        self.load().into_iter().find(|p| p.id == id)
    }

    fn list(&self) -> Vec<ConnectionProfile> {
        self.load()
    }
}
