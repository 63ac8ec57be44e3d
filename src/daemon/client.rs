//! Daemon discovery and the client side of the control protocol.
//!
//! `start()` connects to a running daemon or spawns one. A spawned daemon
//! runs detached in its own process group so it outlives the client.

use super::markers::{process_alive, MarkerState, RuntimePaths};
use super::protocol::{
    methods, DaemonStatus, Request, Response, RunQueryParams, RunQueryResult, TabInfo,
    TabInfoParams, TabParams, TestConnectionParams,
};
use crate::config::RUNTIME_DIR_ENV;
use crate::connector::ConnectionTest;
use crate::error::{QueryMuxError, Result};
use crate::profiles::ConnectionProfile;
use crate::query::QueryRequest;
use crate::session::SessionSnapshot;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value as Json};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(400);
const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(paths: &RuntimePaths) -> std::io::Result<Self> {
        let stream = UnixStream::connect(&paths.socket).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn call(&mut self, request: &Request) -> Result<Response> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| QueryMuxError::internal(format!("Failed to encode request: {e}")))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let reply = self.lines.next_line().await?.ok_or_else(|| {
            QueryMuxError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Daemon closed the connection",
            ))
        })?;
        serde_json::from_str(&reply)
            .map_err(|e| QueryMuxError::internal(format!("Malformed daemon response: {e}")))
    }
}

/// Talks to the daemon for one runtime directory.
pub struct DaemonClient {
    paths: RuntimePaths,
    program: Option<PathBuf>,
    daemon_args: Vec<OsString>,
    spawn_timeout: Duration,
    connection: Option<Connection>,
    next_id: u64,
}

impl DaemonClient {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: RuntimePaths::new(runtime_dir),
            program: None,
            daemon_args: Vec::new(),
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            connection: None,
            next_id: 1,
        }
    }

    /// Binary to spawn; defaults to the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Global arguments placed before the `daemon` subcommand.
    pub fn with_daemon_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.daemon_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Connects to the daemon, spawning one if none answers.
    pub async fn start(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        if let Ok(connection) = Connection::open(&self.paths).await {
            debug!("Connected to running daemon");
            self.connection = Some(connection);
            return Ok(());
        }

        if let MarkerState::Starting(pid) = self.paths.reap_stale().await {
            debug!("Daemon pid {pid} is starting; waiting for its socket");
            if let Some(connection) = self.poll_socket(None).await? {
                self.connection = Some(connection);
                return Ok(());
            }
            warn!("Daemon pid {pid} never accepted connections; replacing it");
            self.paths.remove_markers();
        }

        self.spawn().await
    }

    /// Connects only if a daemon is already running. Never spawns.
    pub async fn connect_existing(&mut self) -> Result<bool> {
        if self.connection.is_some() {
            return Ok(true);
        }
        match Connection::open(&self.paths).await {
            Ok(connection) => {
                self.connection = Some(connection);
                Ok(true)
            }
            Err(_) => {
                self.paths.reap_stale().await;
                Ok(false)
            }
        }
    }

    async fn spawn(&mut self) -> Result<()> {
        self.paths.ensure_dir()?;
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| QueryMuxError::process(format!("Cannot locate executable: {e}")))?,
        };

        let mut command = Command::new(&program);
        command
            .args(&self.daemon_args)
            .arg("daemon")
            .arg("--log-file")
            .arg(&self.paths.log)
            .env(RUNTIME_DIR_ENV, &self.paths.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let mut child = command.spawn().map_err(|e| {
            QueryMuxError::process(format!(
                "Failed to spawn daemon ({}): {e}",
                program.display()
            ))
        })?;
        let pid = child.id();
        info!("Spawned daemon pid {}", pid.unwrap_or_default());

        let outcome = self.poll_socket(Some(&mut child)).await;
        if !matches!(outcome, Ok(Some(_))) {
            if let Err(e) = child.kill().await {
                debug!("Could not kill spawned daemon: {e}");
            }
            if let Some(pid) = pid {
                self.paths.remove_markers_if_dead(pid);
            }
        }

        match outcome {
            // The daemon outlives `child`; the runtime reaps it once it exits.
            Ok(Some(connection)) => {
                self.connection = Some(connection);
                Ok(())
            }
            Ok(None) => Err(QueryMuxError::process(format!(
                "Daemon did not become ready within {}s (log: {})",
                self.spawn_timeout.as_secs_f32(),
                self.paths.log.display()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Polls the socket with exponential backoff until the spawn deadline.
    /// Fails early if `child` exits.
    async fn poll_socket(&self, mut child: Option<&mut Child>) -> Result<Option<Connection>> {
        let deadline = Instant::now() + self.spawn_timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Ok(connection) = Connection::open(&self.paths).await {
                return Ok(Some(connection));
            }
            if let Some(child) = child.as_deref_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(QueryMuxError::process(format!(
                        "Daemon exited during startup ({status}); see {}",
                        self.paths.log.display()
                    )));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Sends one request. An I/O failure reconnects (spawning if needed) and
    /// retries once.
    pub async fn call(&mut self, method: &str, params: Json) -> Result<Json> {
        match self.call_once(method, params.clone()).await {
            Err(QueryMuxError::Io(e)) => {
                debug!("{method} failed with {e}; reconnecting");
                self.connection = None;
                self.start().await?;
                self.call_once(method, params).await
            }
            other => other,
        }
    }

    async fn call_once(&mut self, method: &str, params: Json) -> Result<Json> {
        self.start().await?;
        let id = self.next_id;
        self.next_id += 1;
        let request = Request::new(id, method, params);

        let Some(connection) = self.connection.as_mut() else {
            return Err(QueryMuxError::internal("Not connected"));
        };
        let response = match connection.call(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.connection = None;
                return Err(e);
            }
        };
        if response.id != request.id {
            warn!("Response id {} does not match request {id}", response.id);
        }
        response.into_result()
    }

    async fn call_typed<P: Serialize, T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: &P,
    ) -> Result<T> {
        let params = serde_json::to_value(params)
            .map_err(|e| QueryMuxError::internal(format!("Failed to encode params: {e}")))?;
        let result = self.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| QueryMuxError::internal(format!("Unexpected {method} result: {e}")))
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.call(methods::PING, Json::Null).await.map(|_| ())
    }

    pub async fn status(&mut self) -> Result<DaemonStatus> {
        self.call_typed(methods::STATUS, &Json::Null).await
    }

    pub async fn register_session(
        &mut self,
        session: &str,
        display_name: &str,
        client_type: &str,
    ) -> Result<SessionSnapshot> {
        let params = json!({
            "session": session,
            "displayName": display_name,
            "clientType": client_type,
        });
        self.call_typed(methods::REGISTER_SESSION, &params).await
    }

    /// Submits a query. Returns as soon as the daemon has created the tab.
    pub async fn run_query(&mut self, request: &QueryRequest) -> Result<RunQueryResult> {
        self.call_typed(methods::RUN_QUERY, &RunQueryParams::from(request))
            .await
    }

    pub async fn get_tab_info(
        &mut self,
        session: &str,
        tab_id: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<TabInfo> {
        let params = TabInfoParams {
            session: Some(session.to_string()),
            tab_id: Some(tab_id.to_string()),
            offset,
            limit,
        };
        self.call_typed(methods::GET_TAB_INFO, &params).await
    }

    /// Polls a tab until its run finishes or `timeout` passes.
    pub async fn wait_for_tab(
        &mut self,
        session: &str,
        tab_id: &str,
        timeout: Duration,
    ) -> Result<TabInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let info = self.get_tab_info(session, tab_id, None, None).await?;
            if !info.is_pending() || Instant::now() >= deadline {
                return Ok(info);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSnapshot>> {
        self.call_typed(methods::LIST_SESSIONS, &Json::Null).await
    }

    /// Cancels a tab's run. `session` may be omitted when the tab id is
    /// unique across sessions.
    pub async fn cancel_query(&mut self, session: Option<&str>, tab_id: &str) -> Result<bool> {
        let params = TabParams {
            session: session.map(str::to_string),
            tab_id: Some(tab_id.to_string()),
        };
        let result = self.call(methods::CANCEL_QUERY, json!(params)).await?;
        Ok(result["cancelled"].as_bool().unwrap_or(false))
    }

    pub async fn close_tab(&mut self, session: Option<&str>, tab_id: &str) -> Result<bool> {
        let params = TabParams {
            session: session.map(str::to_string),
            tab_id: Some(tab_id.to_string()),
        };
        let result = self.call(methods::CLOSE_TAB, json!(params)).await?;
        Ok(result["closed"].as_bool().unwrap_or(false))
    }

    pub async fn test_connection(
        &mut self,
        connection_id: Option<&str>,
        profile: Option<&ConnectionProfile>,
        auth_header: Option<&str>,
    ) -> Result<ConnectionTest> {
        let params = TestConnectionParams {
            connection_id: connection_id.map(str::to_string),
            connection_profile: profile.cloned(),
            auth_header: auth_header.map(str::to_string),
        };
        self.call_typed(methods::TEST_CONNECTION, &params).await
    }

    /// Asks a running daemon to stop and waits for its process to exit.
    /// Returns false if no daemon was running.
    pub async fn shutdown(&mut self) -> Result<bool> {
        if !self.connect_existing().await? {
            return Ok(false);
        }
        let pid = self.paths.read_pid();
        self.call_once(methods::SHUTDOWN, Json::Null).await?;
        self.connection = None;

        if let Some(pid) = pid {
            let deadline = Instant::now() + self.spawn_timeout;
            while process_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        Ok(true)
    }
}
