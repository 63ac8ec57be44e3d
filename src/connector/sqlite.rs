//! Embedded file database connector.
//!
//! Runs statements on a SQLite database file (or `:memory:`) through sqlx.
//! Path literals naming CSV/TSV/JSON/NDJSON files are loaded into temporary
//! tables first and the statement is rewritten to read from them.

use super::classify::{classify_message, classify_sqlx_transport, FailureKind};
use super::files::{expand_home, find_path_literals, read_table, FileTable};
use super::{
    page_stream, ColumnDef, ConnectionGauge, ConnectionTest, Connector, PageSink, PageStream,
    Paginator, Row, Value,
};
use crate::error::{QueryMuxError, Result};
use crate::profiles::ConnectionProfile;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row as SqlxRow, Statement, TypeInfo, ValueRef};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Rows inserted between cancellation checks while loading a file.
const LOAD_CHECK_INTERVAL: usize = 1000;

/// SQLite primary result codes (the low byte of extended codes).
const SQLITE_PERM: i64 = 3;
const SQLITE_CANTOPEN: i64 = 14;
const SQLITE_NOTADB: i64 = 26;
const SQLITE_AUTH: i64 = 23;

/// Connector for the embedded file database.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    page_size: usize,
    gauge: ConnectionGauge,
}

impl SqliteConnector {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            gauge: ConnectionGauge::default(),
        }
    }

    /// Open-connection gauge, one lease per active run.
    pub fn gauge(&self) -> ConnectionGauge {
        self.gauge.clone()
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn id(&self) -> &'static str {
        "sqlite"
    }

    fn validate_config(&self, profile: &ConnectionProfile) -> Option<String> {
        match profile.str_field("path") {
            None => Some("SQLite connection requires a database path".to_string()),
            Some(_) => None,
        }
    }

    fn run_query(
        &self,
        sql: &str,
        profile: &ConnectionProfile,
        _auth_header: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> PageStream {
        let sql = sql.to_string();
        let path = profile.str_field("path").unwrap_or(":memory:").to_string();
        let page_size = self.page_size;
        let gauge = self.gauge.clone();

        page_stream(cancel, move |sink| async move {
            let options = connect_options(&path)?;
            let mut conn = tokio::select! {
                _ = sink.cancelled() => return Ok(()),
                conn = options.connect() => conn.map_err(|e| map_sqlite_error(e, &sql))?,
            };
            let _lease = gauge.lease();
            debug!("Opened SQLite database {path}");

            let result = stream_rows(&mut conn, &sink, &sql, page_size).await;
            let _ = conn.close().await;
            result
        })
    }

    async fn test_connection(
        &self,
        profile: &ConnectionProfile,
        _auth_header: Option<&str>,
    ) -> ConnectionTest {
        let path = profile.str_field("path").unwrap_or(":memory:");
        let probe = async {
            let mut conn = connect_options(path)?
                .connect()
                .await
                .map_err(|e| map_sqlite_error(e, "SELECT 1"))?;
            let result = sqlx::query("SELECT 1")
                .execute(&mut conn)
                .await
                .map_err(|e| map_sqlite_error(e, "SELECT 1"));
            let _ = conn.close().await;
            result.map(|_| ())
        };
        match probe.await {
            Ok(()) => ConnectionTest::ok(),
            Err(e) => ConnectionTest::failed(e.to_string()),
        }
    }
}

fn connect_options(path: &str) -> Result<SqliteConnectOptions> {
    if path == ":memory:" {
        return SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| QueryMuxError::connection(e.to_string()));
    }

    let file = expand_home(path);
    if !file.exists() {
        return Err(QueryMuxError::connection(format!(
            "Database file not found: {}",
            file.display()
        )));
    }
    Ok(SqliteConnectOptions::new()
        .filename(file)
        .create_if_missing(false))
}

async fn stream_rows(
    conn: &mut SqliteConnection,
    sink: &PageSink,
    sql: &str,
    page_size: usize,
) -> Result<()> {
    let Some(statement) = attach_files(conn, sink, sql).await? else {
        return Ok(());
    };

    let mut paginator = Paginator::new(page_size);
    {
        let mut rows = sqlx::query(&statement).fetch(&mut *conn);
        loop {
            let next = tokio::select! {
                biased;
                _ = sink.cancelled() => return Ok(()),
                next = rows.try_next() => next.map_err(|e| map_sqlite_error(e, sql))?,
            };
            let Some(row) = next else { break };
            if !paginator.has_columns() {
                paginator.set_columns(columns_of(&row));
            }
            if let Some(page) = paginator.push(convert_row(&row)) {
                if !sink.send(page).await {
                    return Ok(());
                }
            }
        }
    }

    if !paginator.has_columns() {
        // Zero rows: describe the statement so the terminal page still
        // carries its columns. Best effort.
        if let Ok(prepared) = (&mut *conn).prepare(statement.as_str()).await {
            paginator.set_columns(
                prepared
                    .columns()
                    .iter()
                    .map(|c| ColumnDef::new(c.name(), c.type_info().name()))
                    .collect(),
            );
        }
    }

    sink.send(paginator.finish()).await;
    Ok(())
}

/// Loads every path literal into a temporary table and returns the rewritten
/// statement, or `None` if the run was cancelled while loading.
async fn attach_files(
    conn: &mut SqliteConnection,
    sink: &PageSink,
    sql: &str,
) -> Result<Option<String>> {
    let literals = find_path_literals(sql);
    if literals.is_empty() {
        return Ok(Some(sql.to_string()));
    }

    let mut statement = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (i, literal) in literals.iter().enumerate() {
        let table = format!("qm_file_{i}");
        let path = expand_home(&literal.path);
        let owned_sql = sql.to_string();
        let data = tokio::task::spawn_blocking(move || read_table(&path, &owned_sql))
            .await
            .map_err(|e| QueryMuxError::internal(format!("File loader failed: {e}")))??;

        if !load_table(conn, sink, &table, &data, sql).await? {
            return Ok(None);
        }
        debug!("Loaded {} rows from {} into {table}", data.rows.len(), literal.path);

        statement.push_str(&sql[cursor..literal.range.start]);
        statement.push_str(&table);
        cursor = literal.range.end;
    }
    statement.push_str(&sql[cursor..]);
    Ok(Some(statement))
}

async fn load_table(
    conn: &mut SqliteConnection,
    sink: &PageSink,
    table: &str,
    data: &FileTable,
    sql: &str,
) -> Result<bool> {
    if data.columns.is_empty() {
        return Err(QueryMuxError::query("Data file has no columns", sql));
    }

    let definitions = data
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{} {}", quote_ident(name), data.column_affinity(i)))
        .collect::<Vec<_>>()
        .join(", ");
    sqlx::query(&format!("CREATE TEMP TABLE {table} ({definitions})"))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlite_error(e, sql))?;

    let placeholders = vec!["?"; data.columns.len()].join(", ");
    let insert = format!("INSERT INTO {table} VALUES ({placeholders})");

    let mut tx = conn.begin().await.map_err(|e| map_sqlite_error(e, sql))?;
    for (n, row) in data.rows.iter().enumerate() {
        if n % LOAD_CHECK_INTERVAL == 0 && sink.is_cancelled() {
            return Ok(false);
        }
        let query = row
            .iter()
            .fold(sqlx::query(&insert), |query, value| bind_value(query, value));
        query
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlite_error(e, sql))?;
    }
    tx.commit().await.map_err(|e| map_sqlite_error(e, sql))?;
    Ok(true)
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn columns_of(row: &SqliteRow) -> Vec<ColumnDef> {
    row.columns()
        .iter()
        .map(|col| ColumnDef::new(col.name(), col.type_info().name()))
        .collect()
}

/// Converts a sqlx SqliteRow to our Row type.
fn convert_row(row: &SqliteRow) -> Row {
    (0..row.len()).map(|i| convert_value(row, i)).collect()
}

/// Decodes by the value's storage class, which SQLite tracks per cell.
fn convert_value(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_uppercase(),
        Err(_) => return Value::Null,
    };

    match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "INT8" => row
            .try_get::<i64, _>(index)
            .map(|v| Value::from_json(&serde_json::Value::from(v)))
            .unwrap_or(Value::Null),

        "BOOLEAN" => row
            .try_get::<bool, _>(index)
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row
            .try_get::<f64, _>(index)
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<String, _>(index)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps sqlx errors from SQLite to the crate's failure kinds.
fn map_sqlite_error(error: sqlx::Error, sql: &str) -> QueryMuxError {
    let message = error.to_string();

    let kind = match &error {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_AUTH) | Some(SQLITE_PERM) => FailureKind::Authentication,
                Some(SQLITE_CANTOPEN) | Some(SQLITE_NOTADB) => FailureKind::Connection,
                Some(_) => FailureKind::Query,
                None => classify_message(db.message()),
            }
        }
        other => classify_sqlx_transport(other).unwrap_or(FailureKind::Query),
    };

    let message = match &error {
        sqlx::Error::Database(db) => db.message().to_string(),
        _ => message,
    };
    kind.into_error(message, sql)
}
