//! SQLite-backed cache store.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::store::CacheStore;
use crate::error::{Result, SyncError};

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Mirrored items, serialized as JSON, one row per persistent key
CREATE TABLE IF NOT EXISTS entity_cache (
    namespace TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, entity_key)
);
"#;

/// SQLite-based cache store.
///
/// Every mirror gets its own namespace inside the shared `entity_cache`
/// table, so one database file can hold several caches. Statements run on
/// the blocking pool; calls from concurrent tasks queue on the connection.
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
  namespace: Arc<str>,
}

impl SqliteStore {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path, namespace: impl Into<String>) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|e| {
          SyncError::storage_with_source(
            format!("Failed to create cache directory {}", parent.display()),
            e,
          )
        })?;
      }
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::storage_with_source(
        format!("Failed to open cache database at {}", path.display()),
        e,
      )
    })?;

    Self::from_connection(conn, namespace)
  }

  /// Open the cache database at the default location.
  pub fn open_default(namespace: impl Into<String>) -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path, namespace)
  }

  /// Open a throwaway in-memory cache.
  pub fn open_in_memory(namespace: impl Into<String>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::storage_with_source("Failed to open in-memory cache", e))?;
    Self::from_connection(conn, namespace)
  }

  fn from_connection(conn: Connection, namespace: impl Into<String>) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| SyncError::storage_with_source("Failed to run cache migrations", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      namespace: Arc::from(namespace.into()),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::config("Could not determine data directory"))?;

    Ok(data_dir.join("tidemark").join("cache.db"))
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&Connection, &str) -> Result<R> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    let namespace = Arc::clone(&self.namespace);

    tokio::task::spawn_blocking(move || {
      let conn = conn
        .lock()
        .map_err(|e| SyncError::storage(format!("Lock poisoned: {}", e)))?;
      f(&conn, &namespace)
    })
    .await
    .map_err(|e| SyncError::storage_with_source("Cache task panicked", e))?
  }
}

#[async_trait]
impl<T> CacheStore<T> for SqliteStore
where
  T: Serialize + DeserializeOwned + Send + Sync,
{
  async fn list_keys(&self) -> Result<HashSet<String>> {
    self
      .with_conn(|conn, namespace| {
        let mut stmt = conn
          .prepare_cached("SELECT entity_key FROM entity_cache WHERE namespace = ?")
          .map_err(|e| SyncError::storage_with_source("Failed to prepare key listing", e))?;

        let keys = stmt
          .query_map(params![namespace], |row| row.get::<_, String>(0))
          .map_err(|e| SyncError::storage_with_source("Failed to list cache keys", e))?
          .collect::<rusqlite::Result<HashSet<String>>>()
          .map_err(|e| SyncError::storage_with_source("Failed to read cache key", e))?;
        Ok(keys)
      })
      .await
  }

  async fn read_item(&self, key: &str) -> Result<T> {
    let owned_key = key.to_string();
    let data = self
      .with_conn(move |conn, namespace| {
        conn
          .query_row(
            "SELECT data FROM entity_cache WHERE namespace = ? AND entity_key = ?",
            params![namespace, owned_key],
            |row| row.get::<_, Vec<u8>>(0),
          )
          .optional()
          .map_err(|e| {
            SyncError::storage_with_source(format!("Failed to read entry {}", owned_key), e)
          })
      })
      .await?;

    let data = data.ok_or_else(|| SyncError::not_found(key))?;
    serde_json::from_slice(&data)
      .map_err(|e| SyncError::storage_with_source(format!("Failed to deserialize entry {}", key), e))
  }

  async fn write_item(&self, key: &str, item: &T) -> Result<()> {
    let data = serde_json::to_vec(item)
      .map_err(|e| SyncError::storage_with_source(format!("Failed to serialize entry {}", key), e))?;

    let owned_key = key.to_string();
    self
      .with_conn(move |conn, namespace| {
        conn
          .execute(
            "INSERT OR REPLACE INTO entity_cache (namespace, entity_key, data, cached_at)
             VALUES (?, ?, ?, datetime('now'))",
            params![namespace, owned_key, data],
          )
          .map_err(|e| {
            SyncError::storage_with_source(format!("Failed to store entry {}", owned_key), e)
          })?;
        Ok(())
      })
      .await
  }

  fn name(&self) -> &'static str {
    "sqlite_store"
  }
}
