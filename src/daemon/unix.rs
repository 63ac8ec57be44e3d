//! Local socket transport.

use super::dispatch::{serve_lines, ControlService};
use crate::error::{QueryMuxError, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Binds the control socket, owner-only.
pub fn bind(path: &Path) -> Result<UnixListener> {
    let listener = UnixListener::bind(path).map_err(|e| {
        QueryMuxError::process(format!("Failed to bind socket {}: {e}", path.display()))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Accepts connections until `shutdown` fires. Each connection is served on
/// its own task.
pub async fn serve(
    listener: UnixListener,
    service: Arc<ControlService>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let service = Arc::clone(&service);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = serve_lines(service, reader, writer) => {
                                if let Err(e) = result {
                                    debug!("Socket client error: {e}");
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!("Accept error: {e}"),
            },
        }
    }
    debug!("Socket transport stopped");
}
