//! Client sessions and their result tabs.

mod manager;
mod tab;

pub use manager::{
    RemovalListener, Session, SessionEvent, SessionManager, SessionSnapshot, MAX_SESSIONS,
    MAX_TABS_PER_SESSION,
};
pub use tab::{Tab, TabStatus, TabSummary};
