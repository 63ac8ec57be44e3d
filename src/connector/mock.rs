//! Mock connector for testing.
//!
//! Plays back scripted pages (with an optional delay before each) so the
//! executor, the daemon and cancellation can be exercised without a backend.

use super::classify::FailureKind;
use super::{
    page_stream, ColumnDef, ConnectionGauge, ConnectionTest, Connector, PageStream, QueryPage,
    Value,
};
use crate::profiles::ConnectionProfile;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted step of a mock run.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Yield this page.
    Page(QueryPage),
    /// Fail with this kind and message.
    Fail(FailureKind, String),
}

/// A query the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub sql: String,
    pub profile_id: String,
    pub auth_header: Option<String>,
}

/// A mock connector that returns predefined results.
pub struct MockConnector {
    id: &'static str,
    steps: Vec<MockStep>,
    delay: Duration,
    config_error: Option<String>,
    probe: ConnectionTest,
    gauge: ConnectionGauge,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockConnector {
    /// Creates a mock registered as `mock`.
    pub fn new() -> Self {
        Self::with_id("mock")
    }

    /// Creates a mock that stands in for another backend type.
    pub fn with_id(id: &'static str) -> Self {
        Self {
            id,
            steps: Vec::new(),
            delay: Duration::ZERO,
            config_error: None,
            probe: ConnectionTest::ok(),
            gauge: ConnectionGauge::default(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Scripts the run. Without steps a run echoes the SQL as one row.
    pub fn with_steps(mut self, steps: Vec<MockStep>) -> Self {
        self.steps = steps;
        self
    }

    /// Scripts a run that yields these pages in order.
    pub fn with_pages(self, pages: Vec<QueryPage>) -> Self {
        self.with_steps(pages.into_iter().map(MockStep::Page).collect())
    }

    /// Waits this long before each step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes `validate_config` reject every profile with this message.
    pub fn with_config_error(mut self, message: impl Into<String>) -> Self {
        self.config_error = Some(message.into());
        self
    }

    /// Sets the `test_connection` outcome.
    pub fn with_probe(mut self, probe: ConnectionTest) -> Self {
        self.probe = probe;
        self
    }

    /// Open-connection gauge; a run holds one lease while it is active.
    pub fn gauge(&self) -> ConnectionGauge {
        self.gauge.clone()
    }

    /// Queries received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn echo_steps(sql: &str) -> Vec<MockStep> {
        let page = QueryPage::new(vec![vec![Value::String(format!("Mock result for: {sql}"))]])
            .with_columns(vec![ColumnDef::new("result", "text")]);
        vec![MockStep::Page(page)]
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn id(&self) -> &'static str {
        self.id
    }

    fn validate_config(&self, _profile: &ConnectionProfile) -> Option<String> {
        self.config_error.clone()
    }

    fn run_query(
        &self,
        sql: &str,
        profile: &ConnectionProfile,
        auth_header: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> PageStream {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                sql: sql.to_string(),
                profile_id: profile.id.clone(),
                auth_header: auth_header.map(str::to_string),
            });
        }

        let steps = if self.steps.is_empty() {
            Self::echo_steps(sql)
        } else {
            self.steps.clone()
        };
        let delay = self.delay;
        let gauge = self.gauge.clone();
        let sql = sql.to_string();

        page_stream(cancel, move |sink| async move {
            let _lease = gauge.lease();
            for step in steps {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = sink.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                match step {
                    MockStep::Page(page) => {
                        if !sink.send(page).await {
                            return Ok(());
                        }
                    }
                    MockStep::Fail(kind, message) => return Err(kind.into_error(message, &sql)),
                }
            }
            Ok(())
        })
    }

    async fn test_connection(
        &self,
        _profile: &ConnectionProfile,
        _auth_header: Option<&str>,
    ) -> ConnectionTest {
        self.probe.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::collect_rows;
    use crate::error::QueryMuxError;
    use futures::StreamExt;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new("m", "mock")
    }

    #[tokio::test]
    async fn test_mock_echoes_sql() {
        let mock = MockConnector::new();
        let stream = mock.run_query("SELECT 1", &profile(), Some("Bearer t"), None);
        let (columns, rows) = collect_rows(stream).await.unwrap();
        assert_eq!(columns[0].name, "result");
        assert_eq!(rows, vec![vec![Value::String("Mock result for: SELECT 1".into())]]);
        assert_eq!(mock.calls()[0].auth_header.as_deref(), Some("Bearer t"));
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let mock = MockConnector::new().with_steps(vec![
            MockStep::Page(QueryPage::new(vec![vec![Value::Int(1)]]).with_next_token("1")),
            MockStep::Fail(FailureKind::Query, "division by zero".into()),
        ]);
        let mut stream = mock.run_query("SELECT 1/0", &profile(), None, None);
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, QueryMuxError::Query { ref sql, .. } if sql == "SELECT 1/0"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_cancel_between_pages_releases_connection() {
        let pages = (0..10)
            .map(|i| QueryPage::new(vec![vec![Value::Int(i)]]).with_next_token(i.to_string()))
            .collect();
        let mock = MockConnector::new()
            .with_pages(pages)
            .with_delay(Duration::from_millis(20));
        let gauge = mock.gauge();
        let token = CancellationToken::new();
        let mut stream = mock.run_query("SELECT n", &profile(), None, Some(token.clone()));

        assert!(stream.next().await.is_some());
        token.cancel();
        assert!(stream.next().await.is_none());

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
