//! Remote source over a table in a SQLite database.
//!
//! Filter and sort directives are rendered into SQL; rows are read page by
//! page as the stream is polled, so an early stop never scans the rest of
//! the table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, TryStreamExt};
use rusqlite::types::{FromSql, ToSql, Value as SqlValue};
use rusqlite::{Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::query::{Capabilities, RemoteQuery};
use super::{ItemStream, RemoteSource};
use crate::cache::Timestamp;
use crate::error::{Result, SyncError};
use crate::record::Record;

/// Table layout of a SQLite remote source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteSourceConfig {
  /// Table (or rowid table) to mirror
  pub table: String,

  /// Column holding the persistent key
  #[serde(default = "default_key_column")]
  pub key_column: String,

  /// Column holding the last-modified value
  #[serde(default = "default_timestamp_column")]
  pub timestamp_column: String,

  /// Optional column with the JSON payload
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data_column: Option<String>,

  /// Rows fetched per round trip
  #[serde(default = "default_page_size")]
  pub page_size: usize,
}

fn default_key_column() -> String {
  "id".to_string()
}

fn default_timestamp_column() -> String {
  "updated_at".to_string()
}

fn default_page_size() -> usize {
  500
}

impl SqliteSourceConfig {
  pub fn new(table: impl Into<String>) -> Self {
    Self {
      table: table.into(),
      key_column: default_key_column(),
      timestamp_column: default_timestamp_column(),
      data_column: None,
      page_size: default_page_size(),
    }
  }

  fn validate(&self) -> Result<()> {
    validate_identifier(&self.table)?;
    validate_identifier(&self.key_column)?;
    validate_identifier(&self.timestamp_column)?;
    if let Some(data) = &self.data_column {
      validate_identifier(data)?;
    }
    if self.page_size == 0 {
      return Err(SyncError::config("page_size must be greater than zero"));
    }
    Ok(())
  }
}

fn validate_identifier(name: &str) -> Result<()> {
  let mut chars = name.chars();
  let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

  if valid {
    Ok(())
  } else {
    Err(SyncError::config(format!("Invalid SQL identifier: '{}'", name)))
  }
}

/// Timestamp types a SQLite source can filter and sort on.
pub trait SqlTimestamp: Timestamp + ToSql + FromSql {
  /// Wrap a column or parameter so SQLite compares it in timestamp order.
  fn comparable(operand: &str) -> String {
    operand.to_string()
  }
}

impl SqlTimestamp for i64 {}

impl SqlTimestamp for DateTime<Utc> {
  // Stored text may use 'T' or ' ' and 'Z' or '+00:00'; julian days ignore layout
  fn comparable(operand: &str) -> String {
    format!("julianday({})", operand)
  }
}

/// SQL rendered for one remote query.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SqlPlan {
  first_page: String,
  next_page: String,
  filtered: bool,
  sorted: bool,
}

impl SqlPlan {
  fn render<Ts: SqlTimestamp>(
    config: &SqliteSourceConfig,
    query: &RemoteQuery<Ts>,
  ) -> Result<Self> {
    let column = format!("\"{}\"", config.timestamp_column);
    let ts = Ts::comparable(&column);
    let key = format!("\"{}\"", config.key_column);
    let data = config
      .data_column
      .as_ref()
      .map(|c| format!("\"{}\"", c))
      .unwrap_or_else(|| "NULL".to_string());

    let mut conditions = Vec::new();
    if let Some(predicate) = &query.filter {
      if predicate.field != config.timestamp_column {
        return Err(SyncError::unsupported(format!(
          "filter on column '{}'",
          predicate.field
        )));
      }
      conditions.push(format!(
        "{} {} {}",
        ts,
        predicate.op.sql_operator(),
        Ts::comparable(":watermark")
      ));
    }

    if let Some(sort) = &query.sort {
      if sort.field != config.timestamp_column {
        return Err(SyncError::unsupported(format!("sort on column '{}'", sort.field)));
      }
    }
    let sorted = query.is_sorted();

    let (keyset, order) = if sorted {
      (
        format!(
          "({ts} > {after} OR ({ts} = {after} AND {key} > :after_key))",
          ts = ts,
          after = Ts::comparable(":after_ts"),
          key = key
        ),
        format!("ORDER BY {} ASC, {} ASC", ts, key),
      )
    } else {
      ("rowid > :after_rowid".to_string(), "ORDER BY rowid ASC".to_string())
    };

    let select = format!(
      "SELECT {}, {}, {}, rowid FROM \"{}\"",
      key, column, data, config.table
    );
    let build = |conditions: &[String]| {
      let filter = if conditions.is_empty() {
        String::new()
      } else {
        format!(" WHERE {}", conditions.join(" AND "))
      };
      format!("{}{} {} LIMIT {}", select, filter, order, config.page_size)
    };

    let first_page = build(&conditions);
    conditions.push(keyset);
    let next_page = build(&conditions);

    Ok(Self {
      first_page,
      next_page,
      filtered: query.filter.is_some(),
      sorted,
    })
  }
}

/// Position of the page reader.
#[derive(Debug, Clone)]
enum PageCursor<Ts> {
  Start,
  AfterSorted { updated: Ts, key: SqlValue },
  AfterRowid(i64),
  Exhausted,
}

struct FetchedRow<Ts> {
  record: Record<Ts>,
  raw_key: SqlValue,
  rowid: i64,
}

struct PageReader<Ts> {
  conn: Arc<Mutex<Connection>>,
  plan: Arc<SqlPlan>,
  watermark: Option<Ts>,
  page_size: usize,
}

impl<Ts> PageReader<Ts>
where
  Ts: SqlTimestamp,
{
  fn read_page(&self, cursor: &PageCursor<Ts>) -> Result<Vec<FetchedRow<Ts>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| SyncError::remote(format!("Lock poisoned: {}", e)))?;

    let sql = match cursor {
      PageCursor::Start => &self.plan.first_page,
      _ => &self.plan.next_page,
    };

    let mut params: Vec<(&str, &dyn ToSql)> = Vec::new();
    if let (true, Some(watermark)) = (self.plan.filtered, &self.watermark) {
      params.push((":watermark", watermark as &dyn ToSql));
    }
    match cursor {
      PageCursor::AfterSorted { updated, key } => {
        params.push((":after_ts", updated as &dyn ToSql));
        params.push((":after_key", key as &dyn ToSql));
      }
      PageCursor::AfterRowid(rowid) => params.push((":after_rowid", rowid as &dyn ToSql)),
      PageCursor::Start | PageCursor::Exhausted => {}
    }

    let mut stmt = conn
      .prepare_cached(sql)
      .map_err(|e| SyncError::remote_with_source("Failed to prepare source query", e))?;

    let rows = stmt
      .query_map(params.as_slice(), decode_row::<Ts>)
      .map_err(|e| SyncError::remote_with_source("Failed to query source table", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| SyncError::remote_with_source("Failed to read source row", e))?;

    rows.into_iter().collect()
  }

  fn next_cursor(&self, rows: &[FetchedRow<Ts>]) -> PageCursor<Ts> {
    match rows.last() {
      Some(last) if rows.len() >= self.page_size => {
        if self.plan.sorted {
          PageCursor::AfterSorted {
            updated: last.record.updated.clone(),
            key: last.raw_key.clone(),
          }
        } else {
          PageCursor::AfterRowid(last.rowid)
        }
      }
      _ => PageCursor::Exhausted,
    }
  }
}

fn decode_row<Ts: FromSql>(row: &Row<'_>) -> rusqlite::Result<Result<FetchedRow<Ts>>> {
  let raw_key: SqlValue = row.get(0)?;
  let updated: Ts = row.get(1)?;
  let data: SqlValue = row.get(2)?;
  let rowid: i64 = row.get(3)?;

  let fetched = key_to_string(&raw_key).and_then(|key| {
    Ok(FetchedRow {
      record: Record::new(key, updated, payload_to_json(data)?),
      raw_key,
      rowid,
    })
  });
  Ok(fetched)
}

fn key_to_string(value: &SqlValue) -> Result<String> {
  match value {
    SqlValue::Text(s) => Ok(s.clone()),
    SqlValue::Integer(i) => Ok(i.to_string()),
    other => Err(SyncError::remote(format!(
      "Unsupported key value in source row: {:?}",
      other
    ))),
  }
}

fn payload_to_json(value: SqlValue) -> Result<Value> {
  match value {
    SqlValue::Null => Ok(Value::Null),
    SqlValue::Integer(i) => Ok(Value::from(i)),
    SqlValue::Real(f) => Ok(Value::from(f)),
    // Plain text that is not JSON is carried as a string
    SqlValue::Text(s) => Ok(serde_json::from_str(&s).unwrap_or(Value::String(s))),
    SqlValue::Blob(bytes) => serde_json::from_slice(&bytes)
      .map_err(|e| SyncError::remote_with_source("Source payload blob is not JSON", e)),
  }
}

/// SQLite table exposed as a sortable remote source of `Record`s.
pub struct SqliteSource<Ts> {
  conn: Arc<Mutex<Connection>>,
  config: SqliteSourceConfig,
  description: String,
  _timestamp: PhantomData<fn() -> Ts>,
}

impl<Ts> SqliteSource<Ts>
where
  Ts: SqlTimestamp,
{
  /// Open the database at `path` read-only.
  pub fn open(path: &Path, config: SqliteSourceConfig) -> Result<Self> {
    config.validate()?;
    let conn = Connection::open_with_flags(
      path,
      OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| {
      SyncError::remote_with_source(
        format!("Failed to open source database at {}", path.display()),
        e,
      )
    })?;

    let description = format!("sqlite:{}:{}", path.display(), config.table);
    Ok(Self::build(conn, config, description))
  }

  /// Use an existing connection (e.g. an in-memory database).
  pub fn from_connection(conn: Connection, config: SqliteSourceConfig) -> Result<Self> {
    config.validate()?;
    let description = format!("sqlite:memory:{}", config.table);
    Ok(Self::build(conn, config, description))
  }

  fn build(conn: Connection, config: SqliteSourceConfig, description: String) -> Self {
    Self {
      conn: Arc::new(Mutex::new(conn)),
      config,
      description,
      _timestamp: PhantomData,
    }
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  /// Stable cache namespace for this source (hex SHA-256 of its description)
  pub fn cache_namespace(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Name of the column the engine must filter and sort on
  pub fn timestamp_column(&self) -> &str {
    &self.config.timestamp_column
  }
}

#[async_trait]
impl<Ts> RemoteSource<Record<Ts>, Ts> for SqliteSource<Ts>
where
  Ts: SqlTimestamp,
{
  fn capabilities(&self) -> Capabilities {
    Capabilities::sortable()
  }

  async fn query(&self, query: RemoteQuery<Ts>) -> Result<ItemStream<Record<Ts>>> {
    let plan = SqlPlan::render(&self.config, &query)?;
    debug!(source = %self.description, sql = %plan.first_page, "Rendered source query");

    let reader = Arc::new(PageReader {
      conn: Arc::clone(&self.conn),
      plan: Arc::new(plan),
      watermark: query.filter.map(|p| p.value),
      page_size: self.config.page_size,
    });

    let pages = stream::try_unfold(
      (reader, PageCursor::Start),
      |(reader, cursor)| async move {
        if matches!(cursor, PageCursor::Exhausted) {
          return Ok(None);
        }

        let (rows, reader) = tokio::task::spawn_blocking(move || {
          let rows = reader.read_page(&cursor);
          (rows, reader)
        })
        .await
        .map_err(|e| SyncError::remote_with_source("Source page reader panicked", e))?;
        let rows = rows?;

        if rows.is_empty() {
          return Ok(None);
        }

        trace!(rows = rows.len(), "Fetched source page");
        let next = reader.next_cursor(&rows);
        let records: Vec<Result<Record<Ts>>> = rows.into_iter().map(|r| Ok(r.record)).collect();
        Ok(Some((stream::iter(records), (reader, next))))
      },
    )
    .try_flatten();

    Ok(Box::pin(pages))
  }

  fn name(&self) -> &'static str {
    "sqlite_source"
  }
}
