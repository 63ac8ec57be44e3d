//! Session and tab state, with capacity-based eviction.
//!
//! The session map sits behind a short-held `RwLock`; each session guards its
//! own state with a `Mutex`, so work on two sessions never contends beyond the
//! map lookup. Changes are announced on a broadcast channel. Removals are also
//! delivered synchronously to registered [`RemovalListener`]s, which never
//! miss one the way a lagging subscriber can.

use super::tab::{Tab, TabSummary};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Global session ceiling.
pub const MAX_SESSIONS: usize = 50;

/// Per-session tab ceiling.
pub const MAX_TABS_PER_SESSION: usize = 20;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// A change to session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    TabAdded { session_id: String, tab: TabSummary },
    #[serde(rename_all = "camelCase")]
    TabUpdated { session_id: String, tab: TabSummary },
    #[serde(rename_all = "camelCase")]
    TabRemoved { session_id: String, tab_id: String },
    #[serde(rename_all = "camelCase")]
    SessionRemoved {
        session_id: String,
        tab_ids: Vec<String>,
    },
}

/// Told about every session that leaves the manager, evicted or removed.
///
/// Called on the removing thread after the session is out of the map and
/// before the removal event is broadcast.
pub trait RemovalListener: Send + Sync {
    fn session_removed(&self, session_id: &str);
}

/// A logical client identity holding zero or more tabs.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
}

#[derive(Debug)]
struct SessionState {
    display_name: String,
    client_type: String,
    connected_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    /// Ordered by creation.
    tabs: Vec<Tab>,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_activity_at = stamp();
    }

    fn tab_mut(&mut self, tab_id: &str) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.id == tab_id)
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub display_name: String,
    pub client_type: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub tabs: Vec<TabSummary>,
}

impl Session {
    fn new(id: &str, display_name: &str, client_type: &str) -> Self {
        let now = stamp();
        Self {
            id: id.to_string(),
            state: Mutex::new(SessionState {
                display_name: display_name.to_string(),
                client_type: client_type.to_string(),
                connected_at: now,
                last_activity_at: now,
                tabs: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> String {
        self.lock().display_name.clone()
    }

    pub fn client_type(&self) -> String {
        self.lock().client_type.clone()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.lock().connected_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.lock().last_activity_at
    }

    pub fn tab_count(&self) -> usize {
        self.lock().tabs.len()
    }

    /// Returns a copy of a tab, rows included.
    pub fn tab(&self, tab_id: &str) -> Option<Tab> {
        self.lock().tabs.iter().find(|t| t.id == tab_id).cloned()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            id: self.id.clone(),
            display_name: state.display_name.clone(),
            client_type: state.client_type.clone(),
            connected_at: state.connected_at,
            last_activity_at: state.last_activity_at,
            tabs: state.tabs.iter().map(Tab::summary).collect(),
        }
    }

    fn refresh(&self, display_name: &str, client_type: &str) {
        let mut state = self.lock();
        if !display_name.is_empty() {
            state.display_name = display_name.to_string();
        }
        if !client_type.is_empty() {
            state.client_type = client_type.to_string();
        }
        state.connected_at = stamp();
        state.touch();
    }
}

/// Returns a timestamp strictly later than any previously returned, so
/// activity ordering never ties even when the clock does.
pub(crate) fn stamp() -> DateTime<Utc> {
    static LAST: Mutex<Option<DateTime<Utc>>> = Mutex::new(None);
    let mut last = LAST.lock().unwrap_or_else(|e| e.into_inner());
    let now = Utc::now();
    let next = match *last {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    };
    *last = Some(next);
    next
}

/// Tracks client sessions and their tabs.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    listeners: RwLock<Vec<Arc<dyn RemovalListener>>>,
    events: broadcast::Sender<SessionEvent>,
    max_sessions: usize,
    max_tabs: usize,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_limits(MAX_SESSIONS, MAX_TABS_PER_SESSION)
    }

    /// Creates a manager with custom ceilings.
    pub fn with_limits(max_sessions: usize, max_tabs: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            events,
            max_sessions: max_sessions.max(1),
            max_tabs,
        }
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Registers a listener for session removals.
    pub fn add_removal_listener(&self, listener: Arc<dyn RemovalListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn announce_removed(&self, session: &Session) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.session_removed(&session.id);
        }
        let tab_ids = session.lock().tabs.iter().map(|t| t.id.clone()).collect();
        self.emit(SessionEvent::SessionRemoved {
            session_id: session.id.clone(),
            tab_ids,
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Registers a session, or refreshes and returns the existing one.
    ///
    /// Registering beyond capacity first evicts `ceil(count / 10)` sessions,
    /// least recently active first.
    pub fn register_session(
        &self,
        id: &str,
        display_name: &str,
        client_type: &str,
    ) -> Arc<Session> {
        if let Some(existing) = self.get(id) {
            existing.refresh(display_name, client_type);
            return existing;
        }

        let (session, evicted) = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = sessions.get(id).cloned() {
                drop(sessions);
                existing.refresh(display_name, client_type);
                return existing;
            }

            let evicted = if sessions.len() >= self.max_sessions {
                evict_oldest(&mut sessions)
            } else {
                Vec::new()
            };

            let name = if display_name.is_empty() { id } else { display_name };
            let session = Arc::new(Session::new(id, name, client_type));
            sessions.insert(id.to_string(), Arc::clone(&session));
            (session, evicted)
        };

        if !evicted.is_empty() {
            info!(
                "Session capacity reached, evicted {} least recently active sessions",
                evicted.len()
            );
        }
        for old in evicted {
            self.announce_removed(&old);
        }
        debug!("Registered session {id}");
        session
    }

    /// Returns true if the session exists and is below its tab ceiling.
    pub fn can_add_tab(&self, session_id: &str) -> bool {
        self.get(session_id)
            .map(|s| s.tab_count() < self.max_tabs)
            .unwrap_or(false)
    }

    /// Adds a tab, or replaces the tab with the same id.
    ///
    /// Returns false (and emits nothing) if the session does not exist or a
    /// new tab would exceed the ceiling.
    pub fn add_tab(&self, session_id: &str, tab: Tab) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let event = {
            let mut state = session.lock();
            let summary = tab.summary();
            if let Some(existing) = state.tab_mut(&tab.id) {
                *existing = tab;
                state.touch();
                SessionEvent::TabUpdated {
                    session_id: session_id.to_string(),
                    tab: summary,
                }
            } else {
                if state.tabs.len() >= self.max_tabs {
                    return false;
                }
                state.tabs.push(tab);
                state.touch();
                SessionEvent::TabAdded {
                    session_id: session_id.to_string(),
                    tab: summary,
                }
            }
        };
        self.emit(event);
        true
    }

    /// Mutates a tab. Returns false if the session or tab does not exist.
    pub fn update_tab(&self, session_id: &str, tab_id: &str, f: impl FnOnce(&mut Tab)) -> bool {
        self.update_tab_with(session_id, tab_id, |tab| {
            f(tab);
            true
        })
    }

    /// Mutates a tab under the session lock; `f` returns whether it changed
    /// anything. Only changes are timestamped and announced.
    pub fn update_tab_with(
        &self,
        session_id: &str,
        tab_id: &str,
        f: impl FnOnce(&mut Tab) -> bool,
    ) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let summary = {
            let mut state = session.lock();
            let Some(tab) = state.tab_mut(tab_id) else {
                return false;
            };
            if !f(tab) {
                return false;
            }
            tab.updated_at = stamp();
            let summary = tab.summary();
            state.touch();
            summary
        };
        self.emit(SessionEvent::TabUpdated {
            session_id: session_id.to_string(),
            tab: summary,
        });
        true
    }

    /// Removes a tab, returning it.
    pub fn remove_tab(&self, session_id: &str, tab_id: &str) -> Option<Tab> {
        let session = self.get(session_id)?;
        let removed = {
            let mut state = session.lock();
            let index = state.tabs.iter().position(|t| t.id == tab_id)?;
            state.touch();
            state.tabs.remove(index)
        };
        self.emit(SessionEvent::TabRemoved {
            session_id: session_id.to_string(),
            tab_id: tab_id.to_string(),
        });
        Some(removed)
    }

    /// Refreshes a session's activity timestamp.
    pub fn touch_session(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.lock().touch();
                true
            }
            None => false,
        }
    }

    /// Removes a session and its tabs.
    pub fn remove_session(&self, id: &str) -> Option<SessionSnapshot> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)?;
        self.announce_removed(&session);
        Some(session.snapshot())
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.get(id)
    }

    /// Returns a copy of one tab, rows included.
    pub fn get_tab(&self, session_id: &str, tab_id: &str) -> Option<Tab> {
        self.get(session_id)?.tab(tab_id)
    }

    /// Ids of the sessions holding a tab called `tab_id`, sorted.
    pub fn sessions_with_tab(&self, tab_id: &str) -> Vec<String> {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut owners: Vec<String> = sessions
            .into_iter()
            .filter(|s| s.lock().tabs.iter().any(|t| t.id == tab_id))
            .map(|s| s.id.clone())
            .collect();
        owners.sort();
        owners
    }

    /// Snapshots of all sessions, oldest connection first.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = sessions.iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes `ceil(len / 10)` sessions with the oldest activity.
fn evict_oldest(sessions: &mut HashMap<String, Arc<Session>>) -> Vec<Arc<Session>> {
    let count = sessions.len().div_ceil(10).max(1);
    let mut by_activity: Vec<(DateTime<Utc>, String)> = sessions
        .values()
        .map(|s| (s.last_activity_at(), s.id.clone()))
        .collect();
    by_activity.sort();

    by_activity
        .into_iter()
        .take(count)
        .filter_map(|(_, id)| sessions.remove(&id))
        .collect()
}
