//! Standard input/output transport for supervised daemons.
//!
//! Stdout carries responses only; logs and the readiness line go to stderr.
//! End of input stops the daemon.

use super::dispatch::{serve_lines, ControlService};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Serves requests from stdin until it closes, then requests shutdown.
pub async fn serve(service: Arc<ControlService>, shutdown: CancellationToken) {
    let result = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = serve_lines(service, tokio::io::stdin(), tokio::io::stdout()) => result,
    };
    match result {
        Ok(()) => info!("Stdin closed"),
        Err(e) => warn!("Stdio transport failed: {e}"),
    }
    shutdown.cancel();
}
