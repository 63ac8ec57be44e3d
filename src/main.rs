//! querymux - a background SQL daemon with session-scoped result tabs.

use querymux::cli::{Cli, Command};
use querymux::config::Config;
use querymux::daemon::{Daemon, DaemonClient, DaemonOptions};
use querymux::error::{QueryMuxError, Result};
use querymux::logging;
use querymux::profiles::FileProfileStore;
use querymux::query::QueryRequest;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// How long `run --wait` polls before printing whatever the tab holds.
const WAIT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn main() {
    let cli = Cli::parse_args();

    match &cli.command {
        Command::Daemon {
            log_file: Some(path),
            ..
        } => logging::init_file_logging(path),
        _ => logging::init_stderr_logging(),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}: {}", e.category(), e);
            1
        }
    };

    // A blocked stdin reader must not hold the process open.
    runtime.shutdown_timeout(Duration::from_millis(250));
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    debug!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;
    let runtime_dir = cli
        .runtime_dir
        .clone()
        .unwrap_or_else(|| config.daemon.resolve_runtime_dir());

    if let Command::Daemon {
        stdio,
        no_http,
        http_addr,
        ..
    } = &cli.command
    {
        let mut options = DaemonOptions::from_config(&config.daemon);
        options.runtime_dir = runtime_dir;
        options.stdio = *stdio;
        if *no_http {
            options.http_addr = None;
        } else if let Some(addr) = http_addr {
            options.http_addr = Some(addr.clone());
        }
        let profiles = Arc::new(FileProfileStore::new(config_path));
        return Daemon::new(options, profiles).run().await;
    }

    let mut client = DaemonClient::new(runtime_dir)
        .with_daemon_args(cli.daemon_args())
        .with_spawn_timeout(config.daemon.spawn_timeout());

    match cli.command {
        Command::Daemon { .. } => Ok(()),
        Command::Run {
            sql,
            session,
            connection,
            tab,
            wait,
        } => {
            let mut request = QueryRequest::new(sql, session.clone());
            request.connection_id = connection;
            request.tab_id = tab;
            let submitted = client.run_query(&request).await?;
            if wait {
                let info = client
                    .wait_for_tab(&session, &submitted.tab_id, WAIT_TIMEOUT)
                    .await?;
                print_json(&info)
            } else {
                print_json(&submitted)
            }
        }
        Command::Tab {
            session,
            tab_id,
            offset,
            limit,
        } => {
            let info = client.get_tab_info(&session, &tab_id, offset, limit).await?;
            print_json(&info)
        }
        Command::Sessions => {
            let sessions = client.list_sessions().await?;
            print_json(&sessions)
        }
        Command::Cancel { tab_id, session } => {
            let cancelled = client.cancel_query(session.as_deref(), &tab_id).await?;
            print_json(&serde_json::json!({ "tabId": tab_id, "cancelled": cancelled }))
        }
        Command::Close { tab_id, session } => {
            let closed = client.close_tab(session.as_deref(), &tab_id).await?;
            print_json(&serde_json::json!({ "tabId": tab_id, "closed": closed }))
        }
        Command::TestConnection { connection } => {
            let outcome = client
                .test_connection(connection.as_deref(), None, None)
                .await?;
            print_json(&outcome)
        }
        Command::Status => {
            if client.connect_existing().await? {
                let status = client.status().await?;
                print_json(&status)
            } else {
                print_json(&serde_json::json!({ "status": "stopped" }))
            }
        }
        Command::Stop => {
            let stopped = client.shutdown().await?;
            print_json(&serde_json::json!({ "stopped": stopped }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| QueryMuxError::internal(format!("Failed to encode output: {e}")))?;
    println!("{body}");
    Ok(())
}
