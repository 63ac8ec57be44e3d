//! querymux - a background SQL daemon with session-scoped result tabs.
//!
//! This library exposes the core modules for the binary and for integration
//! tests.

pub mod cli;
pub mod config;
pub mod connector;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod profiles;
pub mod query;
pub mod session;
