//! Path literals in SQL text and the data files they name.
//!
//! A path literal is a quoted string in a `FROM` or `JOIN` position that
//! starts like a filesystem path (`./`, `../`, `~/`, `/` or a drive letter).
//! Such queries are routed to the embedded engine, which loads the files
//! into temporary tables before running the statement.

use crate::connector::types::{Row, Value};
use crate::error::{QueryMuxError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// A path literal found in a SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLiteral {
    /// The path with surrounding whitespace removed.
    pub path: String,
    /// Byte range of the literal in the statement, quotes included.
    pub range: Range<usize>,
}

fn path_literal_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(?:from|join)\s+(?P<lit>'\s*(?P<sq>(?:\.{1,2}/|~/|/|[a-z]:[\\/])[^']*?)\s*'|"\s*(?P<dq>(?:\.{1,2}/|~/|/|[a-z]:[\\/])[^"]*?)\s*")"#,
        )
        .ok()
    })
    .as_ref()
}

/// Finds every path literal in `sql`, ignoring ones inside comments.
pub fn find_path_literals(sql: &str) -> Vec<PathLiteral> {
    let Some(re) = path_literal_regex() else {
        return Vec::new();
    };
    let visible = blank_comments(sql);

    re.captures_iter(&visible)
        .filter_map(|caps| {
            let lit = caps.name("lit")?;
            let path = caps.name("sq").or_else(|| caps.name("dq"))?;
            Some(PathLiteral {
                path: path.as_str().trim().to_string(),
                range: lit.range(),
            })
        })
        .collect()
}

/// Returns true if the statement reads from a path literal.
pub fn references_path_literal(sql: &str) -> bool {
    !find_path_literals(sql).is_empty()
}

/// Replaces comments with spaces so byte offsets still match the input.
///
/// Quoted strings and identifiers are skipped, so `--` inside a literal is
/// left alone.
fn blank_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out[i] = b' ';
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut depth_end = i + 2;
                while depth_end < bytes.len()
                    && !(bytes[depth_end] == b'*' && bytes.get(depth_end + 1) == Some(&b'/'))
                {
                    depth_end += 1;
                }
                let end = (depth_end + 2).min(bytes.len());
                for b in &mut out[i..end] {
                    if *b != b'\n' {
                        *b = b' ';
                    }
                }
                i = end;
            }
            _ => i += 1,
        }
    }

    // Only ASCII bytes were replaced, and always whole comment spans.
    String::from_utf8(out).unwrap_or_else(|_| sql.to_string())
}

/// Expands a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Data file formats the embedded engine can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Tsv,
    Json,
    NdJson,
}

impl FileFormat {
    /// Detects the format from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            "json" => Some(Self::Json),
            "ndjson" | "jsonl" => Some(Self::NdJson),
            _ => None,
        }
    }
}

/// Rows read from a data file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl FileTable {
    /// Returns the SQLite storage class for a column, from its values.
    pub fn column_affinity(&self, index: usize) -> &'static str {
        let mut affinity = None;
        for value in self.rows.iter().filter_map(|r| r.get(index)) {
            let next = match value {
                Value::Null => continue,
                Value::Int(_) | Value::Bool(_) => "INTEGER",
                Value::Float(_) => "REAL",
                Value::Bytes(_) => "BLOB",
                Value::String(_) => return "TEXT",
            };
            affinity = match (affinity, next) {
                (None, n) => Some(n),
                (Some("INTEGER"), "REAL") | (Some("REAL"), "INTEGER") => Some("REAL"),
                (Some(a), n) if a == n => Some(a),
                _ => return "TEXT",
            };
        }
        affinity.unwrap_or("TEXT")
    }
}

/// Reads a data file into memory.
///
/// A missing file is a connection failure (the source is unreachable);
/// malformed content is a query failure against `sql`.
pub fn read_table(path: &Path, sql: &str) -> Result<FileTable> {
    if !path.exists() {
        return Err(QueryMuxError::connection(format!(
            "File not found: {}",
            path.display()
        )));
    }

    let format = FileFormat::from_path(path).ok_or_else(|| {
        QueryMuxError::query(
            format!(
                "Unsupported file type for '{}' (expected csv, tsv, json, ndjson or jsonl)",
                path.display()
            ),
            sql,
        )
    })?;

    let parse_error = |e: String| {
        QueryMuxError::query(format!("Failed to read {}: {e}", path.display()), sql)
    };

    match format {
        FileFormat::Csv => read_delimited(path, b',').map_err(|e| parse_error(e.to_string())),
        FileFormat::Tsv => read_delimited(path, b'\t').map_err(|e| parse_error(e.to_string())),
        FileFormat::Json | FileFormat::NdJson => {
            let content = fs::read_to_string(path)?;
            let values = if format == FileFormat::Json {
                match serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))? {
                    serde_json::Value::Array(items) => items,
                    other => vec![other],
                }
            } else {
                content
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(serde_json::from_str)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| parse_error(e.to_string()))?
            };
            Ok(table_from_json(values))
        }
    }
}

fn read_delimited(path: &Path, delimiter: u8) -> std::result::Result<FileTable, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let columns = unique_names(headers);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = (0..columns.len())
            .map(|i| record.get(i).map(Value::infer).unwrap_or(Value::Null))
            .collect();
        rows.push(row);
    }

    Ok(FileTable { columns, rows })
}

fn table_from_json(values: Vec<serde_json::Value>) -> FileTable {
    let mut columns: Vec<String> = Vec::new();
    let mut seen = HashSet::new();

    for value in &values {
        match value {
            serde_json::Value::Object(map) => {
                for key in map.keys() {
                    if seen.insert(key.clone()) {
                        columns.push(key.clone());
                    }
                }
            }
            _ => {
                if seen.insert("value".to_string()) {
                    columns.push("value".to_string());
                }
            }
        }
    }

    let rows = values
        .iter()
        .map(|value| {
            columns
                .iter()
                .map(|col| match value {
                    serde_json::Value::Object(map) => {
                        map.get(col).map(Value::from_json).unwrap_or(Value::Null)
                    }
                    scalar if col == "value" => Value::from_json(scalar),
                    _ => Value::Null,
                })
                .collect()
        })
        .collect();

    FileTable { columns, rows }
}

/// Names blank headers `column<N>` and suffixes duplicates.
fn unique_names(headers: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    headers
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let base = if name.trim().is_empty() {
                format!("column{}", i + 1)
            } else {
                name.trim().to_string()
            };
            let mut candidate = base.clone();
            let mut n = 2;
            while !seen.insert(candidate.to_lowercase()) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            candidate
        })
        .collect()
}
