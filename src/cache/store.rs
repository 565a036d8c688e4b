//! Cache store capability and the in-memory implementation.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, SyncError};

/// Key-addressed item store the engine mirrors into.
///
/// Only per-call atomicity is expected; the engine assumes it is the single
/// writer for the duration of a reconciliation cycle.
#[async_trait]
pub trait CacheStore<T>: Send + Sync {
  /// List every persistent key currently stored.
  async fn list_keys(&self) -> Result<HashSet<String>>;

  /// Read one item. Fails with `NotFound` if the key is absent.
  async fn read_item(&self, key: &str) -> Result<T>;

  /// Write one item, replacing any previous value under the key.
  async fn write_item(&self, key: &str, item: &T) -> Result<()>;

  /// Store name for logs
  fn name(&self) -> &'static str;
}

struct MemoryEntries<T> {
  items: HashMap<String, T>,
  writes: HashMap<String, usize>,
}

/// In-memory cache store.
///
/// Counts writes per key and can be switched into a failing state, which
/// makes it the store of choice for exercising the engine.
pub struct MemoryStore<T> {
  entries: Mutex<MemoryEntries<T>>,
  unavailable: AtomicBool,
}

impl<T: Clone> MemoryStore<T> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(MemoryEntries {
        items: HashMap::new(),
        writes: HashMap::new(),
      }),
      unavailable: AtomicBool::new(false),
    }
  }

  /// Create a store pre-populated with items (not counted as writes)
  pub fn with_items(items: impl IntoIterator<Item = (String, T)>) -> Self {
    let store = Self::new();
    if let Ok(mut entries) = store.entries.lock() {
      entries.items.extend(items);
    }
    store
  }

  /// Make every subsequent call fail with `StorageUnavailable`
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  pub fn len(&self) -> usize {
    self.lock().map(|e| e.items.len()).unwrap_or_default()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn get(&self, key: &str) -> Option<T> {
    self.lock().ok().and_then(|e| e.items.get(key).cloned())
  }

  /// Drop an entry behind the engine's back
  pub fn remove(&self, key: &str) -> Option<T> {
    self.lock().ok().and_then(|mut e| e.items.remove(key))
  }

  /// Number of `write_item` calls that targeted `key`
  pub fn write_count(&self, key: &str) -> usize {
    self
      .lock()
      .ok()
      .and_then(|e| e.writes.get(key).copied())
      .unwrap_or_default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, MemoryEntries<T>>> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(SyncError::storage("memory store marked unavailable"));
    }
    self
      .entries
      .lock()
      .map_err(|e| SyncError::storage(format!("Lock poisoned: {}", e)))
  }
}

impl<T: Clone> Default for MemoryStore<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl<T: Clone + Send + Sync> CacheStore<T> for MemoryStore<T> {
  async fn list_keys(&self) -> Result<HashSet<String>> {
    Ok(self.lock()?.items.keys().cloned().collect())
  }

  async fn read_item(&self, key: &str) -> Result<T> {
    self
      .lock()?
      .items
      .get(key)
      .cloned()
      .ok_or_else(|| SyncError::not_found(key))
  }

  async fn write_item(&self, key: &str, item: &T) -> Result<()> {
    let mut entries = self.lock()?;
    entries.items.insert(key.to_string(), item.clone());
    *entries.writes.entry(key.to_string()).or_default() += 1;
    Ok(())
  }

  fn name(&self) -> &'static str {
    "memory_store"
  }
}
