//! The background daemon, its transports and its client.
//!
//! One [`ControlService`] answers requests for every transport: the local
//! socket, stdin/stdout and HTTP with server-sent events. Clients find a
//! daemon through the markers in its runtime directory, or spawn one.

pub mod client;
pub mod dispatch;
pub mod http;
pub mod markers;
pub mod protocol;
pub mod server;
pub mod stdio;
pub mod unix;

pub use client::DaemonClient;
pub use dispatch::ControlService;
pub use markers::RuntimePaths;
pub use protocol::{ReadyInfo, Request, Response, TabInfo};
pub use server::{Daemon, DaemonHandle, DaemonOptions};
