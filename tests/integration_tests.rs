//! Integration tests for querymux.
//!
//! These run against the embedded engine, an in-process daemon, the built
//! binary and a fake Trino coordinator. No external database is needed.
//!
//! Run with: `cargo test --test integration_tests`

mod integration;
