//! Integration tests for querymux.

pub mod cancellation_test;
pub mod daemon_test;
pub mod round_trip_test;
pub mod routing_test;
pub mod trino_test;
