//! In-memory remote source.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use super::query::{Capabilities, RemoteQuery};
use super::{ItemStream, RemoteSource};
use crate::cache::{Projector, Timestamp};
use crate::error::{Result, SyncError};

const NO_FAILURE: usize = usize::MAX;

/// Remote collection held in memory.
///
/// Useful for tests and for mirroring data already loaded by the caller.
/// Tracks how many items its streams actually produced, so callers can
/// check that consumption stayed lazy.
pub struct MemorySource<T, Ts> {
  items: Arc<Mutex<Vec<T>>>,
  projector: Projector<T, Ts>,
  capabilities: Capabilities,
  pulled: Arc<AtomicUsize>,
  unavailable: AtomicBool,
  fail_after: AtomicUsize,
}

impl<T, Ts> MemorySource<T, Ts>
where
  T: Clone + Send + Sync + 'static,
  Ts: Timestamp,
{
  /// Source that can sort on the last-modified field
  pub fn sortable(projector: Projector<T, Ts>) -> Self {
    Self::with_capabilities(projector, Capabilities::sortable())
  }

  /// Source that can filter but not sort
  pub fn unsortable(projector: Projector<T, Ts>) -> Self {
    Self::with_capabilities(projector, Capabilities::filter_only())
  }

  fn with_capabilities(projector: Projector<T, Ts>, capabilities: Capabilities) -> Self {
    Self {
      items: Arc::new(Mutex::new(Vec::new())),
      projector,
      capabilities,
      pulled: Arc::new(AtomicUsize::new(0)),
      unavailable: AtomicBool::new(false),
      fail_after: AtomicUsize::new(NO_FAILURE),
    }
  }

  /// Append an item, keeping any earlier version with the same key
  pub fn push(&self, item: T) {
    if let Ok(mut items) = self.items.lock() {
      items.push(item);
    }
  }

  /// Replace the item with the same key, or append it
  pub fn upsert(&self, item: T) {
    let key = self.projector.key_of(&item);
    if let Ok(mut items) = self.items.lock() {
      match items.iter_mut().find(|i| self.projector.key_of(i) == key) {
        Some(existing) => *existing = item,
        None => items.push(item),
      }
    }
  }

  pub fn extend(&self, items: impl IntoIterator<Item = T>) {
    for item in items {
      self.push(item);
    }
  }

  /// Total items produced by all streams so far
  pub fn pulled(&self) -> usize {
    self.pulled.load(Ordering::SeqCst)
  }

  /// Make `query` fail with `RemoteUnavailable`
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Make the next streams fail after producing `count` items
  pub fn fail_after(&self, count: usize) {
    self.fail_after.store(count, Ordering::SeqCst);
  }

  fn snapshot(&self, query: &RemoteQuery<Ts>) -> Result<Vec<T>> {
    let items = self
      .items
      .lock()
      .map_err(|e| SyncError::remote(format!("Lock poisoned: {}", e)))?;

    let mut matched: Vec<T> = match &query.filter {
      Some(predicate) => items
        .iter()
        .filter(|item| {
          predicate
            .op
            .evaluate(&self.projector.last_modified_of(item), &predicate.value)
        })
        .cloned()
        .collect(),
      None => items.clone(),
    };

    if query.is_sorted() {
      // Stable, so equal timestamps keep insertion order
      matched.sort_by_key(|item| self.projector.last_modified_of(item));
    }

    Ok(matched)
  }

  fn validate(&self, query: &RemoteQuery<Ts>) -> Result<()> {
    if let Some(predicate) = &query.filter {
      if predicate.field != self.projector.field() {
        return Err(SyncError::unsupported(format!(
          "filter on field '{}'",
          predicate.field
        )));
      }
    }
    if let Some(sort) = &query.sort {
      if !self.capabilities.sort {
        return Err(SyncError::unsupported("sort"));
      }
      if sort.field != self.projector.field() {
        return Err(SyncError::unsupported(format!("sort on field '{}'", sort.field)));
      }
    }
    Ok(())
  }
}

#[async_trait]
impl<T, Ts> RemoteSource<T, Ts> for MemorySource<T, Ts>
where
  T: Clone + Send + Sync + 'static,
  Ts: Timestamp,
{
  fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  async fn query(&self, query: RemoteQuery<Ts>) -> Result<ItemStream<T>> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(SyncError::remote("memory source marked unavailable"));
    }
    self.validate(&query)?;

    let mut matched = self.snapshot(&query)?;
    trace!(matched = matched.len(), sorted = query.is_sorted(), "Memory source query");

    let fail_after = self.fail_after.load(Ordering::SeqCst);
    let failure = (fail_after != NO_FAILURE).then(|| {
      Err(SyncError::remote(format!(
        "memory source failed after {} items",
        fail_after
      )))
    });
    matched.truncate(fail_after);

    let pulled = Arc::clone(&self.pulled);
    let stream = stream::iter(matched)
      .map(move |item| {
        pulled.fetch_add(1, Ordering::SeqCst);
        Ok(item)
      })
      .chain(stream::iter(failure));

    Ok(stream.boxed())
  }

  fn name(&self) -> &'static str {
    "memory_source"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{doc_projector, Doc};
  use futures::TryStreamExt;

  fn keys(docs: &[Doc]) -> Vec<&str> {
    docs.iter().map(|d| d.key.as_str()).collect()
  }

  #[tokio::test]
  async fn test_filter_and_sort() {
    let source = MemorySource::sortable(doc_projector());
    source.extend([Doc::new("c", 3), Doc::new("a", 1), Doc::new("b", 2)]);

    let query = RemoteQuery::all()
      .modified_after("updated", 1)
      .sort_ascending("updated");
    let docs: Vec<Doc> = source.query(query).await.unwrap().try_collect().await.unwrap();

    assert_eq!(keys(&docs), vec!["b", "c"]);
  }

  #[tokio::test]
  async fn test_unsortable_rejects_sort() {
    let source = MemorySource::unsortable(doc_projector());
    let err = source
      .query(RemoteQuery::all().sort_ascending("updated"))
      .await
      .err()
      .unwrap();
    assert!(matches!(err, SyncError::Unsupported { .. }));
  }

  #[tokio::test]
  async fn test_unknown_field_rejected() {
    let source = MemorySource::sortable(doc_projector());
    let err = source
      .query(RemoteQuery::all().modified_after("created", 0))
      .await
      .err()
      .unwrap();
    assert!(matches!(err, SyncError::Unsupported { .. }));
  }

  #[tokio::test]
  async fn test_pulled_counts_only_consumed_items() {
    let source = MemorySource::sortable(doc_projector());
    source.extend((1..=5).map(|i| Doc::new(format!("k{}", i), i)));

    let mut stream = source.query(RemoteQuery::all()).await.unwrap();
    stream.try_next().await.unwrap();
    stream.try_next().await.unwrap();
    drop(stream);

    assert_eq!(source.pulled(), 2);
  }

  #[tokio::test]
  async fn test_upsert_replaces_by_key() {
    let source = MemorySource::sortable(doc_projector());
    source.push(Doc::new("a", 1));
    source.upsert(Doc::new("a", 9));

    let docs: Vec<Doc> = source
      .query(RemoteQuery::all())
      .await
      .unwrap()
      .try_collect()
      .await
      .unwrap();
    assert_eq!(docs, vec![Doc::new("a", 9)]);
  }

  #[tokio::test]
  async fn test_fail_after() {
    let source = MemorySource::sortable(doc_projector());
    source.extend([Doc::new("a", 1), Doc::new("b", 2)]);
    source.fail_after(1);

    let mut stream = source.query(RemoteQuery::all()).await.unwrap();
    assert_eq!(stream.try_next().await.unwrap(), Some(Doc::new("a", 1)));
    assert!(stream.try_next().await.unwrap_err().is_remote());
  }
}
