//! PostgreSQL connector implementation.
//!
//! Each run opens its own `PgConnection` through sqlx, streams rows with
//! `fetch`, and closes the connection however the run ends.

use super::classify::{classify_message, classify_sqlx_transport, is_transient, FailureKind};
use super::{
    page_stream, ColumnDef, ConnectionGauge, ConnectionTest, Connector, PageSink, PageStream,
    Paginator, Row, Value,
};
use crate::error::{QueryMuxError, Result};
use crate::profiles::ConnectionProfile;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::types::{Oid, PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode, PgTypeInfo, PgTypeKind};
use chrono::SecondsFormat;
use sqlx::types::chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, Uuid};
use sqlx::{
    Column, ConnectOptions, Connection, Executor, Row as SqlxRow, Statement, TypeInfo, ValueRef,
};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deadline for a single connection attempt.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Connector for PostgreSQL servers.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    page_size: usize,
    gauge: ConnectionGauge,
}

impl PostgresConnector {
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
impl Connector for PostgresConnector {
    fn id(&self) -> &'static str {
        "postgres"
    }

    fn validate_config(&self, profile: &ConnectionProfile) -> Option<String> {
        if profile.str_field("database").is_none() {
            return Some("PostgreSQL connection requires a database".to_string());
        }
        let port = profile.u64_field("port");
        if profile.has_field("port") && !matches!(port, Some(1..=65535)) {
            return Some("PostgreSQL port must be a number between 1 and 65535".to_string());
        }
        if let Some(mode) = profile.str_field("sslmode") {
            if PgSslMode::from_str(mode).is_err() {
                return Some(format!("Unknown sslmode '{mode}'"));
            }
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
        let profile = profile.clone();
        let page_size = self.page_size;
        let gauge = self.gauge.clone();

        page_stream(cancel, move |sink| async move {
            let Some(mut conn) = connect(&profile, &sink).await? else {
                return Ok(());
            };
            let _lease = gauge.lease();

            let result = stream_rows(&mut conn, &sink, &sql, page_size).await;
            if let Err(e) = conn.close().await {
                debug!("Error closing PostgreSQL connection: {e}");
            }
            result
        })
    }

    async fn test_connection(
        &self,
        profile: &ConnectionProfile,
        _auth_header: Option<&str>,
    ) -> ConnectionTest {
        let probe = async {
            let options = connect_options(profile)?;
            let mut conn = connect_with_timeout(&options, profile).await?;
            let result = probe_schema(&mut conn, profile).await;
            let _ = conn.close().await;
            result
        };
        match probe.await {
            Ok(()) => ConnectionTest::ok(),
            Err(e) => ConnectionTest::failed(e.to_string()),
        }
    }
}

async fn probe_schema(conn: &mut PgConnection, profile: &ConnectionProfile) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(&mut *conn)
        .await
        .map_err(|e| map_query_error(e, "SELECT 1"))?;

    if let Some(schema) = profile.str_field("schema") {
        let sql = "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1";
        let found = sqlx::query(sql)
            .bind(schema)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_query_error(e, sql))?;
        if found.is_none() {
            return Err(QueryMuxError::query(
                format!("Schema '{schema}' does not exist"),
                sql,
            ));
        }
    }
    Ok(())
}

fn connect_options(profile: &ConnectionProfile) -> Result<PgConnectOptions> {
    let host = profile.str_field("host").unwrap_or("localhost");
    let port = profile.u64_field("port").unwrap_or(5432) as u16;
    let database = profile
        .str_field("database")
        .ok_or_else(|| QueryMuxError::config("PostgreSQL connection requires a database"))?;

    let mut options = PgConnectOptions::new()
        .host(host)
        .port(port)
        .database(database)
        .application_name("querymux");

    if let Some(user) = profile.str_field("user") {
        options = options.username(user);
    }
    if let Some(password) = profile.str_field("password") {
        options = options.password(password);
    }
    if let Some(mode) = profile.str_field("sslmode") {
        let mode = PgSslMode::from_str(mode)
            .map_err(|_| QueryMuxError::config(format!("Unknown sslmode '{mode}'")))?;
        options = options.ssl_mode(mode);
    }
    if let Some(schema) = profile.str_field("schema") {
        options = options.options([("search_path", schema)]);
    }
    Ok(options)
}

/// Connects with retry on transient failures. Returns `None` if cancelled.
async fn connect(profile: &ConnectionProfile, sink: &PageSink) -> Result<Option<PgConnection>> {
    let options = connect_options(profile)?;
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

        let result = tokio::select! {
            _ = sink.cancelled() => return Ok(None),
            result = connect_with_timeout(&options, profile) => result,
        };

        match result {
            Ok(conn) => return Ok(Some(conn)),
            Err(e) if attempt < MAX_RETRY_ATTEMPTS && is_transient(&e.to_string()) => {
                warn!(
                    "Connection attempt {} failed (transient error), retrying in {:?}",
                    attempt, delay
                );
                tokio::select! {
                    _ = sink.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay *= 2; // Exponential backoff
            }
            Err(e) => return Err(e),
        }
    }

    Err(QueryMuxError::connection(
        "Connection attempts exhausted".to_string(),
    ))
}

async fn connect_with_timeout(
    options: &PgConnectOptions,
    profile: &ConnectionProfile,
) -> Result<PgConnection> {
    match tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), options.connect()).await
    {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(map_connection_error(e, profile)),
        Err(_) => {
            let host = profile.str_field("host").unwrap_or("localhost");
            let port = profile.u64_field("port").unwrap_or(5432);
            Err(QueryMuxError::connection(format!(
                "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
            )))
        }
    }
}

async fn stream_rows(
    conn: &mut PgConnection,
    sink: &PageSink,
    sql: &str,
    page_size: usize,
) -> Result<()> {
    let mut paginator = Paginator::new(page_size);
    {
        let mut rows = sqlx::query(sql).fetch(&mut *conn);
        loop {
            let next = tokio::select! {
                biased;
                _ = sink.cancelled() => return Ok(()),
                next = rows.try_next() => next.map_err(|e| map_query_error(e, sql))?,
            };
            let Some(row) = next else { break };
            if !paginator.has_columns() {
                paginator.set_columns(columns_of(&row));
            }
            if let Some(page) = paginator.push(convert_row(&row, sql)?) {
                if !sink.send(page).await {
                    return Ok(());
                }
            }
        }
    }

    if !paginator.has_columns() {
        // Empty result: the prepared statement still describes its columns.
        if let Ok(statement) = (&mut *conn).prepare(sql).await {
            paginator.set_columns(
                statement
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

fn columns_of(row: &PgRow) -> Vec<ColumnDef> {
    row.columns()
        .iter()
        .map(|col| ColumnDef::new(col.name(), col.type_info().name()))
        .collect()
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow, sql: &str) -> Result<Row> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            convert_value(row, i, col.type_info()).map_err(|e| {
                QueryMuxError::query(
                    format!(
                        "Cannot read column '{}' of type {}",
                        col.name(),
                        col.type_info().name()
                    ),
                    sql,
                )
                .with_details(e.to_string())
            })
        })
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
///
/// Types without a decoder here are an error, never a silent NULL.
fn convert_value(row: &PgRow, index: usize, type_info: &PgTypeInfo) -> sqlx::Result<Value> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_info.name() {
        "VOID" => Value::Null,
        "BOOL" => Value::Bool(row.try_get(index)?),
        "INT2" => Value::Int(row.try_get::<i16, _>(index)?.into()),
        "INT4" => Value::Int(row.try_get::<i32, _>(index)?.into()),
        "OID" => Value::Int(row.try_get::<Oid, _>(index)?.0.into()),
        // Wider than a JSON double: may become a decimal string.
        "INT8" => Value::from_json(&serde_json::Value::from(row.try_get::<i64, _>(index)?)),
        "FLOAT4" => Value::Float(row.try_get::<f32, _>(index)?.into()),
        "FLOAT8" => Value::Float(row.try_get(index)?),
        // Kept as text so no digit is lost.
        "NUMERIC" => Value::String(row.try_get::<Decimal, _>(index)?.to_string()),
        "MONEY" => Value::String(row.try_get::<PgMoney, _>(index)?.to_decimal(2).to_string()),
        "BYTEA" => Value::Bytes(row.try_get(index)?),
        "JSON" | "JSONB" => {
            Value::String(row.try_get::<serde_json::Value, _>(index)?.to_string())
        }
        "UUID" => Value::String(row.try_get::<Uuid, _>(index)?.to_string()),
        "DATE" => Value::String(row.try_get::<NaiveDate, _>(index)?.to_string()),
        "TIME" => Value::String(row.try_get::<NaiveTime, _>(index)?.to_string()),
        "TIMETZ" => {
            let time: PgTimeTz<NaiveTime, FixedOffset> = row.try_get(index)?;
            Value::String(format!("{}{}", time.time, time.offset))
        }
        "TIMESTAMP" => Value::String(row.try_get::<NaiveDateTime, _>(index)?.to_string()),
        "TIMESTAMPTZ" => Value::String(
            row.try_get::<DateTime<Utc>, _>(index)?
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ),
        "INTERVAL" => Value::String(format_interval(&row.try_get(index)?)),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => {
            json_text(row.try_get::<Vec<Option<String>>, _>(index)?)
        }
        "INT4[]" => json_text(row.try_get::<Vec<Option<i32>>, _>(index)?),
        "INT8[]" => json_text(row.try_get::<Vec<Option<i64>>, _>(index)?),
        "FLOAT8[]" => json_text(row.try_get::<Vec<Option<f64>>, _>(index)?),
        "BOOL[]" => json_text(row.try_get::<Vec<Option<bool>>, _>(index)?),
        // Enum labels travel as text in both wire formats.
        _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => {
            Value::String(row.try_get_unchecked(index)?)
        }
        _ => Value::String(row.try_get(index)?),
    };
    Ok(value)
}

fn json_text<T: serde::Serialize>(items: Vec<T>) -> Value {
    Value::String(serde_json::to_string(&items).unwrap_or_default())
}

/// Renders an interval like `1 year 2 mons 01:02:03`.
fn format_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    let (years, months) = (interval.months / 12, interval.months % 12);
    for (amount, unit) in [(years, "year"), (months, "mon"), (interval.days, "day")] {
        if amount != 0 {
            let plural = if amount.abs() == 1 { "" } else { "s" };
            parts.push(format!("{amount} {unit}{plural}"));
        }
    }

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let micros = micros.unsigned_abs();
        let secs = micros / 1_000_000;
        let mut clock = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        if micros % 1_000_000 != 0 {
            clock.push_str(&format!(".{:06}", micros % 1_000_000));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

/// Classifies a PostgreSQL error by SQLSTATE.
fn sqlstate_kind(code: &str) -> FailureKind {
    if code.starts_with("28") || code == "42501" {
        FailureKind::Authentication
    } else if code.starts_with("08") || code == "3D000" || code.starts_with("57P") {
        FailureKind::Connection
    } else {
        FailureKind::Query
    }
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, profile: &ConnectionProfile) -> QueryMuxError {
    let host = profile.str_field("host").unwrap_or("localhost");
    let port = profile.u64_field("port").unwrap_or(5432);
    let user = profile.str_field("user").unwrap_or("unknown");
    let database = profile.str_field("database").unwrap_or("unknown");

    let kind = match &error {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| sqlstate_kind(&code))
            .unwrap_or_else(|| classify_message(db.message())),
        other => classify_sqlx_transport(other).unwrap_or(FailureKind::Connection),
    };
    let error_str = error.to_string().to_lowercase();
    let details = error.to_string();

    let err = if kind == FailureKind::Authentication {
        QueryMuxError::authentication(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("connection refused") || error_str.contains("could not connect") {
        QueryMuxError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        QueryMuxError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("ssl") || error_str.contains("tls") {
        QueryMuxError::connection(
            "Server requires SSL. Set sslmode = \"require\" on the connection.".to_string(),
        )
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        QueryMuxError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        QueryMuxError::connection(details.clone())
    };
    err.with_details(details)
}

/// Maps a query failure, keeping detail and hint as the details blob.
fn map_query_error(error: sqlx::Error, sql: &str) -> QueryMuxError {
    let Some(db_error) = error.as_database_error() else {
        let kind = classify_sqlx_transport(&error).unwrap_or(FailureKind::Query);
        return kind.into_error(error.to_string(), sql);
    };

    let kind = db_error
        .code()
        .map(|code| sqlstate_kind(&code))
        .unwrap_or_else(|| classify_message(db_error.message()));
    let err = kind.into_error(db_error.message(), sql);

    match format_details(db_error) {
        Some(details) => err.with_details(details),
        None => err,
    }
}

/// Collects PostgreSQL's DETAIL/HINT/TABLE/COLUMN/CONSTRAINT fields.
fn format_details(db_error: &dyn sqlx::error::DatabaseError) -> Option<String> {
    let pg_error = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>()?;
    let mut result = String::new();

    let fields = [
        ("DETAIL", pg_error.detail()),
        ("HINT", pg_error.hint()),
        ("TABLE", pg_error.table()),
        ("COLUMN", pg_error.column()),
        ("CONSTRAINT", pg_error.constraint()),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(label);
            result.push_str(": ");
            result.push_str(value);
        }
    }

    (!result.is_empty()).then_some(result)
}
