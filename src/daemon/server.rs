//! Daemon process lifecycle.
//!
//! Startup: take the runtime directory lock, reap stale markers, bind the
//! transports, then write the PID marker and announce readiness. Shutdown:
//! cancel all running queries, remove the markers, release the lock.

use super::dispatch::{ControlService, Endpoints};
use super::markers::{DaemonLock, MarkerState, RuntimePaths};
use super::protocol::ReadyInfo;
use super::{http, stdio, unix};
use crate::config::DaemonConfig;
use crate::connector::ConnectorRegistry;
use crate::error::{QueryMuxError, Result};
use crate::profiles::ProfileStore;
use crate::query::{QueryExecutor, QuerySessionRegistry};
use crate::session::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a daemon instance is hosted.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub runtime_dir: PathBuf,
    /// Serve the protocol on stdin/stdout as well.
    pub stdio: bool,
    /// HTTP transport address; `None` disables it.
    pub http_addr: Option<String>,
    pub page_size: usize,
}

impl DaemonOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            runtime_dir: config.resolve_runtime_dir(),
            stdio: false,
            http_addr: config.http.then(|| config.http_addr.clone()),
            page_size: config.page_size,
        }
    }
}

/// An unstarted daemon: its service graph and where it will listen.
pub struct Daemon {
    options: DaemonOptions,
    paths: RuntimePaths,
    service: Arc<ControlService>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Builds a daemon with the built-in connectors.
    pub fn new(options: DaemonOptions, profiles: Arc<dyn ProfileStore>) -> Self {
        let connectors = ConnectorRegistry::with_defaults(options.page_size);
        Self::with_connectors(options, profiles, connectors)
    }

    /// Builds a daemon over an explicit connector set.
    pub fn with_connectors(
        options: DaemonOptions,
        profiles: Arc<dyn ProfileStore>,
        connectors: ConnectorRegistry,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let executor = Arc::new(QueryExecutor::new(
            Arc::new(connectors.clone()),
            profiles,
            Arc::new(SessionManager::new()),
            Arc::new(QuerySessionRegistry::new()),
        ));
        let service = Arc::new(ControlService::new(executor, &connectors, shutdown.clone()));
        Self {
            paths: RuntimePaths::new(&options.runtime_dir),
            options,
            service,
            shutdown,
        }
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn service(&self) -> &Arc<ControlService> {
        &self.service
    }

    /// Binds every transport and starts serving.
    pub async fn start(self) -> Result<DaemonHandle> {
        let paths = self.paths.clone();
        paths.ensure_dir()?;

        let already_running = || {
            QueryMuxError::process(format!(
                "A daemon is already running on {}",
                paths.socket.display()
            ))
        };
        let Some(lock) = paths.try_lock()? else {
            return Err(already_running());
        };

        // Whoever left these markers no longer holds the lock.
        match paths.reap_stale().await {
            MarkerState::Live => return Err(already_running()),
            MarkerState::Starting(pid) => {
                warn!("Daemon pid {pid} left markers without holding the lock");
                paths.remove_markers();
            }
            _ => {}
        }

        let listener = unix::bind(&paths.socket)?;
        let http = match &self.options.http_addr {
            Some(addr) => match http::bind(addr).await {
                Ok(bound) => Some(bound),
                Err(e) => {
                    let _ = std::fs::remove_file(&paths.socket);
                    return Err(e);
                }
            },
            None => None,
        };

        let pid = std::process::id();
        if let Err(e) = paths.write_pid(pid) {
            let _ = std::fs::remove_file(&paths.socket);
            return Err(e);
        }
        let http_addr = http.as_ref().map(|(_, addr)| addr.to_string());

        self.service.set_endpoints(Endpoints {
            socket: Some(paths.socket.display().to_string()),
            http: http_addr.clone(),
            stdio: self.options.stdio,
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(unix::serve(
            listener,
            Arc::clone(&self.service),
            self.shutdown.clone(),
        ));
        if let Some((listener, _)) = http {
            tasks.spawn(http::serve(
                listener,
                Arc::clone(&self.service),
                self.shutdown.clone(),
            ));
        }
        if self.options.stdio {
            tasks.spawn(stdio::serve(
                Arc::clone(&self.service),
                self.shutdown.clone(),
            ));
        }

        let ready = ReadyInfo {
            pid,
            socket: paths.socket.display().to_string(),
            http: http_addr,
        };
        info!(
            "Daemon ready (pid {pid}, socket {}, http {})",
            ready.socket,
            ready.http.as_deref().unwrap_or("disabled")
        );

        Ok(DaemonHandle {
            ready,
            paths,
            service: self.service,
            shutdown: self.shutdown,
            tasks,
            _lock: lock,
        })
    }

    /// Runs in the foreground until a shutdown request, SIGINT, SIGTERM or
    /// (in stdio mode) the end of stdin.
    pub async fn run(self) -> Result<()> {
        let stdio = self.options.stdio;
        let handle = self.start().await?;

        let line = handle.ready.line();
        if stdio {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }

        let shutdown = handle.shutdown_token();
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = termination_signal() => info!("Received termination signal"),
        }

        handle.stop().await;
        Ok(())
    }
}

/// A running daemon.
pub struct DaemonHandle {
    pub ready: ReadyInfo,
    paths: RuntimePaths,
    service: Arc<ControlService>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    _lock: DaemonLock,
}

impl DaemonHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn service(&self) -> &Arc<ControlService> {
        &self.service
    }

    /// Stops every transport, cancels running queries and removes markers.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let cancelled = self.service.executor().tokens().cancel_all();
        if cancelled > 0 {
            info!("Cancelled {cancelled} running queries");
        }
        while self.tasks.join_next().await.is_some() {}
        self.paths.remove_markers_of(self.ready.pid);
        info!("Daemon stopped");
    }
}

async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockConnector;
    use crate::daemon::markers::socket_answers;
    use crate::profiles::{ConnectionProfile, MemoryProfileStore};

    fn options(dir: &std::path::Path) -> DaemonOptions {
        DaemonOptions {
            runtime_dir: dir.to_path_buf(),
            stdio: false,
            http_addr: None,
            page_size: 100,
        }
    }

    fn daemon(dir: &std::path::Path) -> Daemon {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(MockConnector::new()));
        Daemon::with_connectors(
            options(dir),
            Arc::new(MemoryProfileStore::new([ConnectionProfile::new("m", "mock")])),
            registry,
        )
    }

    #[tokio::test]
    async fn test_start_writes_markers_and_stop_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let handle = daemon(dir.path()).start().await.unwrap();
        let paths = RuntimePaths::new(dir.path());

        assert_eq!(paths.read_pid(), Some(std::process::id()));
        assert!(socket_answers(&paths.socket).await);
        assert_eq!(handle.ready.socket, paths.socket.display().to_string());

        handle.stop().await;
        assert!(!paths.has_markers());
    }

    #[tokio::test]
    async fn test_second_daemon_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let first = daemon(dir.path()).start().await.unwrap();

        let err = daemon(dir.path()).start().await.err().unwrap();
        assert!(err.to_string().contains("already running"));

        first.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_leave_one_reachable_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());

        let (a, b) = tokio::join!(daemon(dir.path()).start(), daemon(dir.path()).start());
        let (winner, loser) = match (a, b) {
            (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
            (Ok(_), Ok(_)) => panic!("both daemons started"),
            (Err(a), Err(b)) => panic!("neither daemon started: {a}; {b}"),
        };

        assert!(loser.to_string().contains("already running"));
        assert!(socket_answers(&paths.socket).await);
        assert_eq!(paths.read_pid(), Some(winner.ready.pid));

        winner.stop().await;
        assert!(!paths.has_markers());
    }

    #[tokio::test]
    async fn test_lock_is_released_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let first = daemon(dir.path()).start().await.unwrap();
        first.stop().await;

        let second = daemon(dir.path()).start().await.unwrap();
        assert!(socket_answers(&second.paths.socket).await);
        second.stop().await;
    }

    #[tokio::test]
    async fn test_stale_markers_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        std::fs::write(&paths.socket, b"").unwrap();
        paths.write_pid(u32::MAX).unwrap();

        let handle = daemon(dir.path()).start().await.unwrap();
        assert_eq!(paths.read_pid(), Some(std::process::id()));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_evicted_session_tabs_are_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let handle = daemon(dir.path()).start().await.unwrap();
        let executor = Arc::clone(handle.service().executor());

        let mut idle = executor.sessions().subscribe();
        let token = executor.tokens().create_session("s1", "t1");
        executor.sessions().register_session("s1", "", "test");
        executor
            .sessions()
            .add_tab("s1", crate::session::Tab::new("t1", "SELECT 1"));
        executor.sessions().remove_session("s1");

        assert!(token.is_cancelled());
        assert!(matches!(
            idle.try_recv(),
            Ok(crate::session::SessionEvent::TabAdded { .. })
        ));
        handle.stop().await;
    }
}
