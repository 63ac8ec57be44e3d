//! Per-tab cancellation tokens.
//!
//! Tabs belong to sessions, so tokens are keyed by `(session id, tab id)`
//! and two sessions may use the same tab id without touching each other.
//! At most one live token exists per key. Creating a token for a tab that
//! already has one cancels the old token first, so a resubmitted query stops
//! the run it replaces.

use crate::session::RemovalListener;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type TabKey = (String, String);

fn key(session_id: &str, tab_id: &str) -> TabKey {
    (session_id.to_string(), tab_id.to_string())
}

/// A cancellation token issued for one submission on one tab.
#[derive(Debug, Clone)]
pub struct QueryToken {
    session_id: String,
    tab_id: String,
    generation: u64,
    token: CancellationToken,
}

impl QueryToken {
    /// The session owning the tab.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The tab this token was issued for.
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Unique per submission, increasing.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The underlying token, handed to connectors.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true once this submission has been cancelled or replaced.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_generation: u64,
    tokens: HashMap<TabKey, (u64, CancellationToken)>,
}

/// Issues and tracks one cancellation token per active tab.
///
/// All operations take a short internal lock, so a cancel request racing a
/// completing run leaves no dangling token either way round.
#[derive(Debug, Default)]
pub struct QuerySessionRegistry {
    inner: Mutex<Inner>,
}

impl QuerySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issues a fresh token for a tab, cancelling any previous one.
    pub fn create_session(&self, session_id: &str, tab_id: &str) -> QueryToken {
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let token = CancellationToken::new();

        if let Some((_, previous)) = inner
            .tokens
            .insert(key(session_id, tab_id), (generation, token.clone()))
        {
            previous.cancel();
        }

        QueryToken {
            session_id: session_id.to_string(),
            tab_id: tab_id.to_string(),
            generation,
            token,
        }
    }

    /// Cancels and removes the token for a tab.
    ///
    /// Returns true if a token was live.
    pub fn cancel_session(&self, session_id: &str, tab_id: &str) -> bool {
        let removed = self.lock().tokens.remove(&key(session_id, tab_id));
        match removed {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the token for a tab without cancelling it.
    pub fn clear_session(&self, session_id: &str, tab_id: &str) -> bool {
        self.lock().tokens.remove(&key(session_id, tab_id)).is_some()
    }

    /// Removes `token` without cancelling it, but only while it is still the
    /// current token for its tab. A finished run therefore never clears the
    /// token of the submission that replaced it.
    pub fn release(&self, token: &QueryToken) -> bool {
        let mut inner = self.lock();
        let key = key(&token.session_id, &token.tab_id);
        match inner.tokens.get(&key) {
            Some((generation, _)) if *generation == token.generation => {
                inner.tokens.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Returns true if the tab has a live token.
    pub fn is_active(&self, session_id: &str, tab_id: &str) -> bool {
        self.lock().tokens.contains_key(&key(session_id, tab_id))
    }

    /// Number of live tokens.
    pub fn active_count(&self) -> usize {
        self.lock().tokens.len()
    }

    /// Cancels every live token of one session. Returns how many.
    pub fn cancel_owned_by(&self, session_id: &str) -> usize {
        let mut inner = self.lock();
        let keys: Vec<TabKey> = inner
            .tokens
            .keys()
            .filter(|(owner, _)| owner == session_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some((_, token)) = inner.tokens.remove(key) {
                token.cancel();
            }
        }
        keys.len()
    }

    /// Cancels every live token (daemon shutdown). Returns how many.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().tokens.drain().collect();
        for (_, (_, token)) in &drained {
            token.cancel();
        }
        drained.len()
    }
}

impl RemovalListener for QuerySessionRegistry {
    fn session_removed(&self, session_id: &str) {
        let cancelled = self.cancel_owned_by(session_id);
        if cancelled > 0 {
            debug!("Session {session_id} removed; cancelled {cancelled} running queries");
        }
    }
}
