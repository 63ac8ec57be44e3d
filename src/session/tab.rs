//! Tabs: one query submission and its evolving result.

use crate::connector::{ColumnDef, PageStats, QueryPage, Row};
use crate::error::QueryMuxError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest tab title derived from the query text.
const MAX_TITLE_CHARS: usize = 40;

/// Lifecycle of a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Created,
    Loading,
    Success,
    Error,
    Cancelled,
}

impl TabStatus {
    /// Returns true once no further mutation happens for this submission.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One query execution and its result state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: String,
    pub title: String,
    pub query: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub rows: Vec<Row>,
    pub status: TabStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PageStats>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Submission currently feeding this tab.
    #[serde(skip)]
    pub run: u64,
}

impl Tab {
    /// Creates a tab in the `created` state.
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        let query = query.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title_for(&query),
            query,
            connection_id: None,
            columns: Vec::new(),
            rows: Vec::new(),
            status: TabStatus::Created,
            error: None,
            error_details: None,
            stats: None,
            created_at: now,
            updated_at: now,
            run: 0,
        }
    }

    /// Sets the connection the tab runs against.
    pub fn with_connection(mut self, connection_id: Option<String>) -> Self {
        self.connection_id = connection_id;
        self
    }

    /// Marks the tab as fed by submission `run`.
    pub fn with_run(mut self, run: u64) -> Self {
        self.run = run;
        self
    }

    /// Clears results for a new submission of `query`.
    pub fn reset(&mut self, query: &str) {
        self.title = title_for(query);
        self.query = query.to_string();
        self.columns.clear();
        self.rows.clear();
        self.status = TabStatus::Created;
        self.error = None;
        self.error_details = None;
        self.stats = None;
    }

    /// Appends a page of results.
    pub fn append_page(&mut self, page: &QueryPage) {
        if let Some(columns) = &page.columns {
            if self.columns.is_empty() {
                self.columns = columns.clone();
            }
        }
        self.rows.extend(page.data.iter().cloned());
        if page.stats.is_some() {
            self.stats = page.stats.clone();
        }
    }

    /// Records a failure.
    pub fn fail(&mut self, error: &QueryMuxError) {
        self.status = TabStatus::Error;
        self.error = Some(error.to_string());
        self.error_details = error.details().map(str::to_string);
    }

    /// Compact form without rows, for listings and events.
    pub fn summary(&self) -> TabSummary {
        TabSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            connection_id: self.connection_id.clone(),
            column_count: self.columns.len(),
            row_count: self.rows.len(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// A tab without its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSummary {
    pub id: String,
    pub title: String,
    pub status: TabStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub column_count: usize,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Title from the first line of the query that is not blank or a comment.
fn title_for(query: &str) -> String {
    let line = query
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("--"))
        .unwrap_or("Query");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > MAX_TITLE_CHARS {
        let truncated: String = collapsed.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{truncated}...")
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Value;

    #[test]
    fn test_title_skips_comments_and_truncates() {
        assert_eq!(title_for("-- daily\n  SELECT   1"), "SELECT 1");
        let long = format!("SELECT {}", "x, ".repeat(30));
        let title = title_for(&long);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.ends_with("..."));
        assert_eq!(title_for(""), "Query");
    }

    #[test]
    fn test_append_keeps_first_columns() {
        let mut tab = Tab::new("t1", "SELECT n");
        tab.append_page(
            &QueryPage::new(vec![vec![Value::Int(1)]])
                .with_columns(vec![ColumnDef::new("n", "integer")]),
        );
        tab.append_page(
            &QueryPage::new(vec![vec![Value::Int(2)]])
                .with_columns(vec![ColumnDef::new("other", "integer")]),
        );
        assert_eq!(tab.columns[0].name, "n");
        assert_eq!(tab.rows.len(), 2);
    }

    #[test]
    fn test_fail_keeps_details_separate() {
        let mut tab = Tab::new("t1", "SELEC 1");
        tab.fail(&QueryMuxError::query("syntax error", "SELEC 1").with_details("stack"));
        assert_eq!(tab.status, TabStatus::Error);
        assert_eq!(tab.error.as_deref(), Some("Query error: syntax error"));
        assert_eq!(tab.error_details.as_deref(), Some("stack"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TabStatus::Success).unwrap(),
            "\"success\""
        );
        assert!(TabStatus::Cancelled.is_terminal());
        assert!(!TabStatus::Loading.is_terminal());
    }
}
