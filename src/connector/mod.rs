//! Connector abstraction layer for querymux.
//!
//! Provides a trait-based interface over backend kinds, allowing the query
//! executor to drive any backend's paginated results the same way.

pub mod classify;
mod duckdb;
pub mod files;
mod mock;
mod postgres;
mod sqlite;
mod trino;
mod types;

pub use duckdb::DuckDbConnector;
pub use mock::{MockConnector, MockStep};
pub use postgres::PostgresConnector;
pub use sqlite::SqliteConnector;
pub use trino::{parse_statement_response, TrinoConnector};
pub use types::{
    infer_column_types, ColumnDef, PageStats, QueryPage, Row, Value, MAX_SAFE_INTEGER,
};

use crate::error::Result;
use crate::profiles::ConnectionProfile;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Default rows per page for row-streaming connectors.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Pages buffered between a producer task and its consumer.
const PAGE_BUFFER: usize = 1;

/// A lazy sequence of result pages.
pub type PageStream = BoxStream<'static, Result<QueryPage>>;

/// Outcome of a connection probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTest {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Trait defining the interface for backend connectors.
///
/// Implementations must be thread-safe; one instance serves every query of
/// its backend kind.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable backend-type identifier, matched against `ConnectionProfile::kind`.
    fn id(&self) -> &'static str;

    /// Validates the profile's type-specific fields. Pure, no I/O.
    ///
    /// Returns a human-readable message when the profile is unusable.
    fn validate_config(&self, profile: &ConnectionProfile) -> Option<String>;

    /// Starts a query and returns its pages.
    ///
    /// Nothing is sent to the backend until the stream is first polled. The
    /// stream ends without an error once `cancel` fires, and the backend
    /// connection is released however the stream stops, including when the
    /// consumer drops it early.
    fn run_query(
        &self,
        sql: &str,
        profile: &ConnectionProfile,
        auth_header: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> PageStream;

    /// Runs a minimal probe plus catalog/schema presence checks.
    async fn test_connection(
        &self,
        profile: &ConnectionProfile,
        auth_header: Option<&str>,
    ) -> ConnectionTest;
}

/// Maps backend-type identifiers to connector instances.
///
/// Populated once at startup, then shared read-only.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in connector registered.
    pub fn with_defaults(page_size: usize) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TrinoConnector::new()));
        registry.register(Arc::new(PostgresConnector::new(page_size)));
        registry.register(Arc::new(SqliteConnector::new(page_size)));
        registry.register(Arc::new(DuckDbConnector::new(page_size)));
        registry
    }

    /// Registers a connector under its id, replacing any previous one.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.id().to_string(), connector);
    }

    /// Looks up a connector by backend-type id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(id).cloned()
    }

    /// Returns the registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }
}

/// Write side of a page stream, handed to connector producers.
pub struct PageSink {
    tx: mpsc::Sender<Result<QueryPage>>,
    cancel: CancellationToken,
}

impl PageSink {
    /// Returns true once the query was cancelled or the consumer went away.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the query is cancelled or the consumer goes away.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Delivers a page. Returns false if the producer should stop.
    pub async fn send(&self, page: QueryPage) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(page)) => sent.is_ok(),
        }
    }
}

/// Builds a lazy page stream around a producer task.
///
/// The producer is spawned on first poll and writes pages into a bounded
/// channel. The stream stops as soon as `cancel` fires, even when a page is
/// already buffered, and dropping the stream cancels the producer. Producer
/// errors are yielded as the final item unless the run was cancelled.
pub fn page_stream<F, Fut>(cancel: Option<CancellationToken>, producer: F) -> PageStream
where
    F: FnOnce(PageSink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let external = cancel.unwrap_or_default();
    let scope = external.child_token();
    let guard = scope.clone().drop_guard();
    let (tx, rx) = mpsc::channel(PAGE_BUFFER);

    let start = async move {
        let error_tx = tx.clone();
        let sink = PageSink {
            tx,
            cancel: scope.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = producer(sink).await {
                if !scope.is_cancelled() {
                    let _ = error_tx.send(Err(e)).await;
                }
            }
        });
        ReceiverStream::new(rx)
    };

    futures::stream::once(start)
        .flatten()
        .take_until(external.cancelled_owned())
        .map(move |item| {
            let _ = &guard;
            item
        })
        .boxed()
}

/// Groups streamed rows into pages of a fixed size.
///
/// The first emitted page carries the columns; `finish` always yields a
/// terminal page, empty when the rows divided evenly or there were none.
#[derive(Debug)]
pub struct Paginator {
    page_size: usize,
    columns: Option<Vec<ColumnDef>>,
    columns_sent: bool,
    buffer: Vec<Row>,
    pages: u64,
    rows: u64,
}

impl Paginator {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            columns: None,
            columns_sent: false,
            buffer: Vec::new(),
            pages: 0,
            rows: 0,
        }
    }

    /// Returns true once column metadata is known.
    pub fn has_columns(&self) -> bool {
        self.columns.is_some()
    }

    /// Records the column metadata if none is known yet.
    pub fn set_columns(&mut self, columns: Vec<ColumnDef>) {
        if self.columns.is_none() {
            self.columns = Some(columns);
        }
    }

    /// Total rows pushed so far.
    pub fn row_count(&self) -> u64 {
        self.rows
    }

    /// Buffers a row, returning a full page when one is ready.
    pub fn push(&mut self, row: Row) -> Option<QueryPage> {
        self.buffer.push(row);
        self.rows += 1;
        if self.buffer.len() >= self.page_size {
            let page = self.take_page("RUNNING");
            Some(page.with_next_token((self.pages).to_string()))
        } else {
            None
        }
    }

    /// Returns the terminal page.
    pub fn finish(mut self) -> QueryPage {
        self.take_page("FINISHED")
    }

    fn take_page(&mut self, state: &str) -> QueryPage {
        self.pages += 1;
        let mut page = QueryPage::new(std::mem::take(&mut self.buffer))
            .with_stats(PageStats::new(state, Some(self.rows)));
        if !self.columns_sent {
            if let Some(columns) = self.columns.clone() {
                page = page.with_columns(columns);
                self.columns_sent = true;
            }
        }
        page
    }
}

/// Counts backend connections a connector currently holds open.
///
/// Each run takes a lease when it opens its connection; dropping the lease
/// marks the connection released.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    open: AtomicUsize,
    released: AtomicU64,
}

impl ConnectionGauge {
    /// Records an opened connection.
    pub fn lease(&self) -> ConnectionLease {
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        ConnectionLease {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Connections currently open.
    pub fn open_count(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Connections released since creation.
    pub fn released_count(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }
}

/// An open backend connection, released on drop.
#[derive(Debug)]
pub struct ConnectionLease {
    inner: Arc<GaugeInner>,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
        self.inner.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drains a page stream into one list of rows (probes, tests, CLI).
pub async fn collect_rows(mut stream: PageStream) -> Result<(Vec<ColumnDef>, Vec<Row>)> {
    let mut columns = Vec::new();
    let mut rows = Vec::new();
    while let Some(page) = stream.next().await {
        let page = page?;
        if let Some(cols) = page.columns {
            if columns.is_empty() {
                columns = cols;
            }
        }
        rows.extend(page.data);
    }
    Ok((columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryMuxError;
    use std::time::Duration;

    #[test]
    fn test_registry_lookup() {
        let registry = ConnectorRegistry::with_defaults(DEFAULT_PAGE_SIZE);
        assert!(registry.get("trino").is_some());
        assert!(registry.get("postgres").is_some());
        assert!(registry.get("sqlite").is_some());
        assert!(registry.get("duckdb").is_some());
        assert!(registry.get("oracle").is_none());
        assert_eq!(registry.ids(), vec!["duckdb", "postgres", "sqlite", "trino"]);
    }

    #[test]
    fn test_paginator_splits_rows_and_sends_columns_once() {
        let mut paginator = Paginator::new(2);
        paginator.set_columns(vec![ColumnDef::new("n", "integer")]);

        assert!(paginator.push(vec![Value::Int(1)]).is_none());
        let first = paginator.push(vec![Value::Int(2)]).unwrap();
        assert_eq!(first.data.len(), 2);
        assert!(first.columns.is_some());
        assert!(!first.is_terminal());

        paginator.push(vec![Value::Int(3)]);
        let last = paginator.finish();
        assert!(last.is_terminal());
        assert!(last.columns.is_none());
        assert_eq!(last.data, vec![vec![Value::Int(3)]]);
        assert_eq!(last.stats.unwrap().row_count, Some(3));
    }

    #[test]
    fn test_paginator_zero_rows_still_has_columns() {
        let mut paginator = Paginator::new(10);
        paginator.set_columns(vec![ColumnDef::new("id", "integer")]);
        let page = paginator.finish();
        assert!(page.is_terminal());
        assert!(page.data.is_empty());
        assert_eq!(page.columns.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_page_stream_is_lazy() {
        let started = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&started);
        let stream = page_stream(None, move |sink| async move {
            flag.fetch_add(1, Ordering::SeqCst);
            sink.send(QueryPage::new(vec![])).await;
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0);

        let (_, rows) = collect_rows(stream).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_page_stream_forwards_errors() {
        let stream = page_stream(None, |_sink| async move {
            Err(QueryMuxError::query("boom", "SELECT boom"))
        });
        let result = collect_rows(stream).await;
        assert!(matches!(result, Err(QueryMuxError::Query { .. })));
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_producer() {
        let gauge = ConnectionGauge::default();
        let producer_gauge = gauge.clone();
        let mut stream = page_stream(None, move |sink| async move {
            let _lease = producer_gauge.lease();
            let mut n = 0;
            while sink.send(QueryPage::new(vec![vec![Value::Int(n)]]).with_next_token("more")).await {
                n += 1;
            }
            Ok(())
        });

        assert!(stream.next().await.is_some());
        assert_eq!(gauge.open_count(), 1);
        drop(stream);

        for _ in 0..50 {
            if gauge.open_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gauge.open_count(), 0);
        assert_eq!(gauge.released_count(), 1);
    }
}
