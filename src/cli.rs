//! Command-line argument parsing for querymux.

use crate::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// A background SQL daemon with session-scoped result tabs.
#[derive(Parser, Debug)]
#[command(name = "querymux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for the daemon's PID marker, socket and log
    #[arg(long, global = true, value_name = "DIR", env = "QUERYMUX_RUNTIME_DIR")]
    pub runtime_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon in the foreground
    Daemon {
        /// Also serve requests on stdin/stdout
        #[arg(long)]
        stdio: bool,

        /// Disable the HTTP transport
        #[arg(long)]
        no_http: bool,

        /// HTTP transport address (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        http_addr: Option<String>,

        /// Log to this file instead of stderr
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Submit a query and print its tab id
    Run {
        /// SQL text
        sql: String,

        /// Session the result tab belongs to
        #[arg(short, long, default_value = "cli")]
        session: String,

        /// Named connection from the config file
        #[arg(short, long, value_name = "ID")]
        connection: Option<String>,

        /// Reuse this tab id
        #[arg(long, value_name = "TAB_ID")]
        tab: Option<String>,

        /// Wait for the query to finish and print the result
        #[arg(short, long)]
        wait: bool,
    },

    /// Print a tab's state and rows
    Tab {
        session: String,
        tab_id: String,

        /// First row to print
        #[arg(long)]
        offset: Option<usize>,

        /// Maximum rows to print
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List sessions and their tabs
    Sessions,

    /// Cancel a running query
    Cancel {
        tab_id: String,

        /// Session owning the tab, if the id is used by several
        #[arg(long)]
        session: Option<String>,
    },

    /// Cancel a query and remove its tab
    Close {
        tab_id: String,

        /// Session owning the tab, if the id is used by several
        #[arg(long)]
        session: Option<String>,
    },

    /// Check that a named connection is reachable
    TestConnection { connection: Option<String> },

    /// Print daemon status, without starting one
    Status,

    /// Stop the running daemon
    Stop,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Arguments a spawned daemon needs to see the same configuration.
    pub fn daemon_args(&self) -> Vec<std::ffi::OsString> {
        match &self.config {
            Some(path) => vec!["--config".into(), path.clone().into_os_string()],
            None => Vec::new(),
        }
    }
}
