//! Local analytical engine connector.
//!
//! Drives the `duckdb` command line shell: the statement goes in on stdin,
//! results come back as CSV with a header row on stdout and are parsed as
//! they stream. Cancelling a run kills the child process.
//!
//! The shell quotes empty strings and prints NULL as a bare empty field, so
//! the two stay distinct only in the raw record text.

use super::files::expand_home;
use super::{
    infer_column_types, page_stream, ConnectionGauge, ConnectionTest, Connector, PageSink,
    PageStream, Paginator, Row, Value,
};
use crate::connector::collect_rows;
use crate::error::{QueryMuxError, Result};
use crate::profiles::ConnectionProfile;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default executable name.
const DEFAULT_BINARY: &str = "duckdb";

/// Error prefixes DuckDB uses for statement failures.
const QUERY_ERRORS: &[&str] = &[
    "Parser Error",
    "Binder Error",
    "Catalog Error",
    "Conversion Error",
    "Constraint Error",
    "Invalid Input Error",
    "Not implemented Error",
    "Out of Range Error",
    "Type Error",
];

/// Connector for the DuckDB shell.
#[derive(Debug, Clone)]
pub struct DuckDbConnector {
    page_size: usize,
    gauge: ConnectionGauge,
}

impl DuckDbConnector {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            gauge: ConnectionGauge::default(),
        }
    }

    /// Running-process gauge, one lease per live child.
    pub fn gauge(&self) -> ConnectionGauge {
        self.gauge.clone()
    }
}

#[async_trait]
impl Connector for DuckDbConnector {
    fn id(&self) -> &'static str {
        "duckdb"
    }

    fn validate_config(&self, profile: &ConnectionProfile) -> Option<String> {
        if profile.has_field("binary") && profile.str_field("binary").is_none() {
            return Some("DuckDB binary must not be empty".to_string());
        }
        if profile.has_field("path") && profile.str_field("path").is_none() {
            return Some("DuckDB database path must not be empty".to_string());
        }
        None
    }

    fn run_query(
        &self,
        sql: &str,
        profile: &ConnectionProfile,
        _auth_header: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> PageStream {
        let sql = sql.to_string();
        let binary = profile
            .str_field("binary")
            .unwrap_or(DEFAULT_BINARY)
            .to_string();
        let database = profile
            .str_field("path")
            .map(|p| {
                if p == ":memory:" {
                    p.to_string()
                } else {
                    expand_home(p).to_string_lossy().into_owned()
                }
            })
            .unwrap_or_else(|| ":memory:".to_string());
        let page_size = self.page_size;
        let gauge = self.gauge.clone();

        page_stream(cancel, move |sink| async move {
            let mut child = spawn_shell(&binary, &database)?;
            let _lease = gauge.lease();

            let result = stream_output(&mut child, &sink, &sql, page_size).await;
            if result.is_err() || sink.is_cancelled() {
                let _ = child.start_kill();
            }
            let _ = child.wait().await;
            result
        })
    }

    async fn test_connection(
        &self,
        profile: &ConnectionProfile,
        auth_header: Option<&str>,
    ) -> ConnectionTest {
        match collect_rows(self.run_query("SELECT 1", profile, auth_header, None)).await {
            Ok(_) => ConnectionTest::ok(),
            Err(e) => ConnectionTest::failed(e.to_string()),
        }
    }
}

fn spawn_shell(binary: &str, database: &str) -> Result<Child> {
    Command::new(binary)
        .args(["-csv", "-header", "-bail", "-nullvalue", "", database])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                QueryMuxError::connection(format!("DuckDB CLI not found (looked for '{binary}')"))
            } else {
                QueryMuxError::connection(format!("Failed to start DuckDB CLI: {e}"))
            }
        })
}

async fn stream_output(
    child: &mut Child,
    sink: &PageSink,
    sql: &str,
    page_size: usize,
) -> Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        let statement = sql.trim_end().trim_end_matches(';');
        stdin.write_all(statement.as_bytes()).await?;
        stdin.write_all(b";\n").await?;
        // Dropping stdin closes it so the shell exits after the statement.
    }

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        })
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| QueryMuxError::internal("DuckDB stdout was not captured"))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut names: Option<Vec<String>> = None;
    let mut pending: Vec<Row> = Vec::new();
    let mut paginator = Paginator::new(page_size);
    let mut record = String::new();

    loop {
        let line = tokio::select! {
            biased;
            _ = sink.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        if !record.is_empty() {
            record.push('\n');
        }
        record.push_str(&line);
        if !record_complete(&record) {
            continue;
        }
        let fields = parse_record(&std::mem::take(&mut record));

        let Some(columns) = &names else {
            names = Some(header(fields));
            continue;
        };
        if fields.len() != columns.len() && !paginator.has_columns() {
            // A later statement's result set replaces an earlier one.
            names = Some(header(fields));
            pending.clear();
            continue;
        }

        let row: Row = (0..columns.len())
            .map(|i| match fields.get(i) {
                Some(Some(text)) if text.is_empty() => Value::String(String::new()),
                Some(Some(text)) => Value::infer(text),
                _ => Value::Null,
            })
            .collect();

        if paginator.has_columns() {
            if let Some(page) = paginator.push(row) {
                if !sink.send(page).await {
                    return Ok(());
                }
            }
            continue;
        }

        pending.push(row);
        if pending.len() >= page_size {
            paginator.set_columns(infer_column_types(columns, &pending));
            for row in pending.drain(..) {
                if let Some(page) = paginator.push(row) {
                    if !sink.send(page).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = sink.cancelled() => return Ok(()),
        status = child.wait() => status?,
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        return Err(classify_stderr(&stderr, sql));
    }
    if !stderr.trim().is_empty() {
        debug!("DuckDB stderr: {}", stderr.trim());
    }

    if let Some(columns) = &names {
        if !paginator.has_columns() {
            paginator.set_columns(infer_column_types(columns, &pending));
        }
    }
    for row in pending {
        if let Some(page) = paginator.push(row) {
            if !sink.send(page).await {
                return Ok(());
            }
        }
    }
    sink.send(paginator.finish()).await;
    Ok(())
}

/// A CSV record is complete once its quotes are balanced.
fn record_complete(text: &str) -> bool {
    text.bytes().filter(|b| *b == b'"').count() % 2 == 0
}

/// Splits one record into cells. `None` marks a NULL.
fn parse_record(text: &str) -> Vec<Option<String>> {
    if text.is_empty() {
        return vec![None];
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let Some(Ok(record)) = reader.records().next() else {
        return Vec::new();
    };
    record
        .iter()
        .zip(bare_empty_fields(text))
        .map(|(cell, is_null)| (!is_null).then(|| cell.to_string()))
        .collect()
}

/// Flags the fields of a raw record that are empty and unquoted.
fn bare_empty_fields(text: &str) -> Vec<bool> {
    let mut flags = Vec::new();
    let mut in_quotes = false;
    let mut width = 0;
    for c in text.chars() {
        match c {
            ',' if !in_quotes => {
                flags.push(width == 0);
                width = 0;
            }
            '"' => {
                in_quotes = !in_quotes;
                width += 1;
            }
            _ => width += 1,
        }
    }
    flags.push(width == 0);
    flags
}

fn header(fields: Vec<Option<String>>) -> Vec<String> {
    fields.into_iter().map(Option::unwrap_or_default).collect()
}

/// Classifies a failed run from the shell's stderr.
fn classify_stderr(stderr: &str, sql: &str) -> QueryMuxError {
    let message = stderr
        .lines()
        .map(str::trim)
        .find(|l| l.contains("Error"))
        .or_else(|| stderr.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("DuckDB exited with an error")
        .trim_start_matches("Error: ")
        .to_string();
    let details = stderr.trim().to_string();

    let err = if QUERY_ERRORS.iter().any(|p| message.contains(p)) {
        QueryMuxError::query(message, sql)
    } else if message.contains("IO Error") || message.to_lowercase().contains("lock") {
        QueryMuxError::connection(message)
    } else if message.contains("Permission Error") {
        QueryMuxError::authentication(message)
    } else {
        QueryMuxError::query(message, sql)
    };
    if details.is_empty() {
        err
    } else {
        err.with_details(details)
    }
}
