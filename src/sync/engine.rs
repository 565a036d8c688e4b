//! Incremental reconciliation between a remote source and the cache.
//!
//! Every cycle starts by resolving the watermark (the newest last-modified
//! value already cached) and asks the remote only for items strictly newer
//! than it. Two strategies exist:
//!
//! - **ordered**: the remote sorts ascending; items are written to the cache
//!   one by one as the caller consumes them, so stopping early persists
//!   exactly what was consumed.
//! - **eager**: the remote cannot sort; the whole delta is materialized and
//!   written before anything is yielded, in whatever order the remote chose.
//!
//! `reconcile_with_cache` wraps either one and, once the remote pass is
//! done, re-emits cached items the remote did not touch this cycle.
//!
//! Strict `>` filtering means a remote item whose last-modified value ties
//! the watermark exactly is never fetched. Sources with coarse clocks can
//! lose such an item; this is a known limitation, not compensated here.

use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::cursor::ObservingCursor;
use super::observer::{NoopObserver, SyncObserver};
use super::poller::Poller;
use super::watermark::resolve_watermark;
use crate::cache::{CacheStore, Projector, Timestamp};
use crate::error::{Result, SyncError};
use crate::remote::{ItemStream, RemoteQuery, RemoteSource};

/// Which reconciliation strategy `reconcile` runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
  /// Ordered when the remote can sort, eager otherwise
  #[default]
  Auto,
  Ordered,
  Eager,
}

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
  #[serde(default)]
  pub strategy: Strategy,

  /// Cache reads/writes allowed in flight during watermark resolution and
  /// eager writes
  #[serde(default = "default_io_concurrency")]
  pub io_concurrency: usize,
}

fn default_io_concurrency() -> usize {
  16
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      strategy: Strategy::default(),
      io_concurrency: default_io_concurrency(),
    }
  }
}

/// Reconciliation engine over one cache and one remote source.
///
/// The engine borrows both collaborators through `Arc`s; it owns no state
/// between cycles. The cache must not be written by anyone else while a
/// cycle runs, otherwise merged results may contain duplicates or gaps.
pub struct SyncEngine<T, Ts> {
  cache: Arc<dyn CacheStore<T>>,
  remote: Arc<dyn RemoteSource<T, Ts>>,
  projector: Projector<T, Ts>,
  observer: Arc<dyn SyncObserver<Ts>>,
  settings: SyncSettings,
}

impl<T, Ts> SyncEngine<T, Ts>
where
  T: Send + Sync + 'static,
  Ts: Timestamp,
{
  pub fn new(
    cache: Arc<dyn CacheStore<T>>,
    remote: Arc<dyn RemoteSource<T, Ts>>,
    projector: Projector<T, Ts>,
  ) -> Self {
    Self {
      cache,
      remote,
      projector,
      observer: Arc::new(NoopObserver),
      settings: SyncSettings::default(),
    }
  }

  pub fn with_observer(mut self, observer: Arc<dyn SyncObserver<Ts>>) -> Self {
    self.observer = observer;
    self
  }

  pub fn with_settings(mut self, settings: SyncSettings) -> Self {
    self.settings = settings;
    self
  }

  /// Newest last-modified value currently cached.
  pub async fn resolve_watermark(&self) -> Result<Ts> {
    let watermark = resolve_watermark(
      self.cache.as_ref(),
      &self.projector,
      self.settings.io_concurrency,
    )
    .await?;
    self.observer.watermark_resolved(&watermark);
    Ok(watermark)
  }

  /// Stream remote items newer than the watermark in ascending order,
  /// caching each one right before it is yielded.
  pub fn ordered(&self) -> ItemStream<T> {
    stream::once(self.clone().open_ordered())
      .try_flatten()
      .boxed()
  }

  /// Materialize every remote item newer than the watermark, cache them all,
  /// then yield them in remote order.
  pub fn eager(&self) -> ItemStream<T> {
    stream::once(self.clone().open_eager())
      .try_flatten()
      .boxed()
  }

  /// Run the configured strategy.
  pub fn reconcile(&self) -> ItemStream<T> {
    match self.settings.strategy {
      Strategy::Ordered => self.ordered(),
      Strategy::Eager => self.eager(),
      Strategy::Auto if self.remote.capabilities().sort => self.ordered(),
      Strategy::Auto => self.eager(),
    }
  }

  /// Run `reconcile`, then re-emit cached items it did not produce.
  ///
  /// Updated items always come first (ascending in ordered mode); stale
  /// cached items follow in unspecified order. No key is yielded twice.
  pub fn reconcile_with_cache(&self) -> ItemStream<T> {
    stream::try_unfold((self.clone(), MergePhase::Snapshot), |(engine, phase)| {
      engine.merge_step(phase)
    })
    .boxed()
  }

  /// Repeat the reconciliation forever, at most once per `interval`.
  pub fn poller(&self, interval: Duration) -> Result<Poller<T, Ts>> {
    Poller::new(self.clone(), interval)
  }

  async fn open_ordered(self) -> Result<ItemStream<T>> {
    if !self.remote.capabilities().sort {
      return Err(SyncError::unsupported(format!(
        "{} cannot sort; use the eager strategy",
        self.remote.name()
      )));
    }

    let watermark = self.resolve_watermark().await?;
    let field = self.projector.field();
    let query = RemoteQuery::all()
      .modified_after(field, watermark)
      .sort_ascending(field);

    debug!(remote = self.remote.name(), "Starting ordered reconciliation");
    let upstream = self.remote.query(query).await?;
    Ok(ObservingCursor::new(upstream, self.cache, self.projector).into_stream())
  }

  async fn open_eager(self) -> Result<ItemStream<T>> {
    let watermark = self.resolve_watermark().await?;
    let query = RemoteQuery::all().modified_after(self.projector.field(), watermark);

    let items: Vec<T> = self.remote.query(query).await?.try_collect().await?;
    self.observer.items_materialized(items.len());
    debug!(
      remote = self.remote.name(),
      count = items.len(),
      "Materialized eager reconciliation"
    );

    let cache = self.cache.as_ref();
    let projector = &self.projector;
    stream::iter(items.iter().map(Ok::<&T, SyncError>))
      .try_for_each_concurrent(self.settings.io_concurrency.max(1), |item| async move {
        cache.write_item(&projector.key_of(item), item).await
      })
      .await?;

    Ok(stream::iter(items.into_iter().map(Ok)).boxed())
  }

  async fn merge_step(
    self,
    mut phase: MergePhase<T>,
  ) -> Result<Option<(T, (Self, MergePhase<T>))>> {
    loop {
      phase = match phase {
        MergePhase::Snapshot => {
          // Taken before the remote pass writes anything
          let snapshot = self.cache.list_keys().await?;
          debug!(cached = snapshot.len(), "Captured cache snapshot");
          MergePhase::Remote {
            upstream: self.reconcile(),
            snapshot,
            seen: HashSet::new(),
          }
        }
        MergePhase::Remote {
          mut upstream,
          snapshot,
          mut seen,
        } => match upstream.try_next().await? {
          Some(item) => {
            let key = self.projector.key_of(&item);
            let first = seen.insert(key.clone());
            let next = MergePhase::Remote {
              upstream,
              snapshot,
              seen,
            };
            if first {
              return Ok(Some((item, (self, next))));
            }
            // Already handed out this pass; the cache holds the latest copy
            trace!(key = %key, "Skipping repeated key from remote pass");
            next
          }
          None => {
            let stale: Vec<String> = snapshot.difference(&seen).cloned().collect();
            info!(
              updated = seen.len(),
              stale = stale.len(),
              "Remote pass complete, backfilling cached items"
            );
            MergePhase::Backfill {
              stale: stale.into_iter(),
            }
          }
        },
        MergePhase::Backfill { mut stale } => match stale.next() {
          Some(key) => {
            let item = self.cache.read_item(&key).await?;
            return Ok(Some((item, (self, MergePhase::Backfill { stale }))));
          }
          None => return Ok(None),
        },
      };
    }
  }
}

impl<T, Ts> Clone for SyncEngine<T, Ts> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      remote: Arc::clone(&self.remote),
      projector: self.projector.clone(),
      observer: Arc::clone(&self.observer),
      settings: self.settings.clone(),
    }
  }
}

/// Progress of one merge-with-stale-cache pass.
enum MergePhase<T> {
  Snapshot,
  Remote {
    upstream: ItemStream<T>,
    snapshot: HashSet<String>,
    seen: HashSet<String>,
  },
  Backfill {
    stale: std::vec::IntoIter<String>,
  },
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::remote::MemorySource;
  use crate::testing::{doc_projector, engine_over, keys_of, store_with, Doc};
  use async_trait::async_trait;
  use std::sync::Mutex;

  /// Memory store that refuses writes for one key
  struct RejectingStore {
    inner: Arc<MemoryStore<Doc>>,
    rejected: &'static str,
  }

  #[async_trait]
  impl CacheStore<Doc> for RejectingStore {
    async fn list_keys(&self) -> Result<HashSet<String>> {
      self.inner.list_keys().await
    }

    async fn read_item(&self, key: &str) -> Result<Doc> {
      self.inner.read_item(key).await
    }

    async fn write_item(&self, key: &str, item: &Doc) -> Result<()> {
      if key == self.rejected {
        return Err(SyncError::storage("write rejected"));
      }
      self.inner.write_item(key, item).await
    }

    fn name(&self) -> &'static str {
      "rejecting_store"
    }
  }

  #[derive(Default)]
  struct RecordingObserver {
    watermarks: Mutex<Vec<i64>>,
    materialized: Mutex<Vec<usize>>,
  }

  impl SyncObserver<i64> for RecordingObserver {
    fn watermark_resolved(&self, watermark: &i64) {
      self.watermarks.lock().unwrap().push(*watermark);
    }

    fn items_materialized(&self, count: usize) {
      self.materialized.lock().unwrap().push(count);
    }
  }

  fn sortable(docs: impl IntoIterator<Item = Doc>) -> Arc<MemorySource<Doc, i64>> {
    let source = MemorySource::sortable(doc_projector());
    source.extend(docs);
    Arc::new(source)
  }

  fn unsortable(docs: impl IntoIterator<Item = Doc>) -> Arc<MemorySource<Doc, i64>> {
    let source = MemorySource::unsortable(doc_projector());
    source.extend(docs);
    Arc::new(source)
  }

  fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
  }

  #[tokio::test]
  async fn test_ordered_from_empty_cache() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = sortable([Doc::new("k3", 3), Doc::new("k1", 1), Doc::new("k2", 2)]);
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.ordered().try_collect().await.unwrap();

    assert_eq!(keys_of(&docs), vec!["k1", "k2", "k3"]);
    assert_eq!(store.len(), 3);
    for key in ["k1", "k2", "k3"] {
      assert_eq!(store.write_count(key), 1);
    }
  }

  #[tokio::test]
  async fn test_ordered_partial_consumption_only_caches_consumed() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = sortable((1..=10).map(|i| Doc::new(format!("k{:02}", i), i)));
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.ordered().take(3).try_collect().await.unwrap();

    assert_eq!(keys_of(&docs), vec!["k01", "k02", "k03"]);
    assert_eq!(store.len(), 3);
    assert!(store.get("k04").is_none());
    assert!(store.get("k10").is_none());
  }

  #[tokio::test]
  async fn test_ordered_only_fetches_newer_than_watermark() {
    let store = Arc::new(store_with([Doc::new("a", 5)]));
    let source = sortable([
      Doc::new("a", 5),
      Doc::new("b", 4),
      Doc::new("c", 6),
      Doc::new("a", 8),
    ]);
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.ordered().try_collect().await.unwrap();

    assert_eq!(docs, vec![Doc::new("c", 6), Doc::new("a", 8)]);
    assert_eq!(store.get("a"), Some(Doc::new("a", 8)));
    assert!(store.get("b").is_none());
  }

  #[tokio::test]
  async fn test_watermark_tie_is_excluded() {
    // Different key, same last-modified as the cached maximum: not fetched
    let store = Arc::new(store_with([Doc::new("a", 5)]));
    let source = sortable([Doc::new("a", 5), Doc::new("twin", 5)]);
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.ordered().try_collect().await.unwrap();

    assert!(docs.is_empty());
    assert!(store.get("twin").is_none());
  }

  #[tokio::test]
  async fn test_ordered_rejects_unsortable_source() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = unsortable([Doc::new("a", 1)]);
    let engine = engine_over(&store, &source);

    let err = engine.ordered().try_collect::<Vec<_>>().await.unwrap_err();
    assert!(matches!(err, SyncError::Unsupported { .. }));
    assert!(store.is_empty());
  }

  #[tokio::test]
  async fn test_eager_writes_everything_before_yielding() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = unsortable([Doc::new("x", 9), Doc::new("y", 2), Doc::new("z", 5)]);
    let engine = engine_over(&store, &source);

    let mut stream = engine.eager();
    let first = stream.try_next().await.unwrap().unwrap();

    // All writes joined before the first item came out
    assert_eq!(first.key, "x");
    assert_eq!(store.len(), 3);

    let rest: Vec<Doc> = stream.try_collect().await.unwrap();
    assert_eq!(keys_of(&rest), vec!["y", "z"]);
  }

  #[tokio::test]
  async fn test_eager_materialization_failure_writes_nothing() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = unsortable([Doc::new("x", 1), Doc::new("y", 2)]);
    source.fail_after(1);
    let engine = engine_over(&store, &source);

    let err = engine.eager().try_collect::<Vec<_>>().await.unwrap_err();
    assert!(err.is_remote());
    assert!(store.is_empty());
  }

  #[tokio::test]
  async fn test_eager_write_failure_yields_nothing() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let cache: Arc<dyn CacheStore<Doc>> = Arc::new(RejectingStore {
      inner: store.clone(),
      rejected: "y",
    });
    let source = unsortable([Doc::new("x", 1), Doc::new("y", 2), Doc::new("z", 3)]);
    let remote: Arc<dyn RemoteSource<Doc, i64>> = source.clone();
    let engine = SyncEngine::new(cache, remote, doc_projector());

    let results: Vec<Result<Doc>> = engine.eager().collect().await;

    assert_eq!(results.len(), 1);
    assert!(results[0].as_ref().unwrap_err().is_storage());
    assert!(store.get("y").is_none());
  }

  #[tokio::test]
  async fn test_reconcile_picks_strategy_from_capabilities() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = unsortable([Doc::new("b", 2), Doc::new("a", 1)]);
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine_over(&store, &source).with_observer(observer.clone());

    let docs: Vec<Doc> = engine.reconcile().try_collect().await.unwrap();

    // Eager keeps remote order
    assert_eq!(keys_of(&docs), vec!["b", "a"]);
    assert_eq!(*observer.materialized.lock().unwrap(), vec![2]);
    assert_eq!(*observer.watermarks.lock().unwrap(), vec![i64::MIN]);
  }

  #[tokio::test]
  async fn test_forced_eager_on_sortable_source() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = sortable([Doc::new("b", 2), Doc::new("a", 1)]);
    let engine = engine_over(&store, &source).with_settings(SyncSettings {
      strategy: Strategy::Eager,
      io_concurrency: 1,
    });

    let docs: Vec<Doc> = engine.reconcile().try_collect().await.unwrap();
    assert_eq!(keys_of(&docs), vec!["b", "a"]);
  }

  #[tokio::test]
  async fn test_merge_yields_updates_then_stale() {
    let store = Arc::new(store_with([
      Doc::new("old1", 1),
      Doc::new("old2", 2),
      Doc::new("changed", 3),
    ]));
    let source = sortable([
      Doc::new("old1", 1),
      Doc::new("old2", 2),
      Doc::new("changed", 7),
      Doc::new("fresh", 5),
    ]);
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.reconcile_with_cache().try_collect().await.unwrap();

    assert_eq!(keys_of(&docs[..2]), vec!["fresh", "changed"]);
    assert_eq!(docs[1], Doc::new("changed", 7));
    assert_eq!(
      sorted(keys_of(&docs[2..]).into_iter().map(String::from).collect()),
      vec!["old1", "old2"]
    );
    assert_eq!(docs.len(), 4);
  }

  #[tokio::test]
  async fn test_merge_never_yields_a_key_twice() {
    let store = Arc::new(store_with((0..20).map(|i| Doc::new(format!("k{}", i), i))));
    let source = unsortable((10..30).map(|i| Doc::new(format!("k{}", i), i + 100)));
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.reconcile_with_cache().try_collect().await.unwrap();

    let unique: HashSet<&str> = docs.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(unique.len(), docs.len());
    assert_eq!(docs.len(), 30);
  }

  #[tokio::test]
  async fn test_merge_skips_repeated_remote_key() {
    let store = Arc::new(store_with([Doc::new("a", 1)]));
    let source = sortable([Doc::new("a", 3)]);
    source.push(Doc::new("a", 5));
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.reconcile_with_cache().try_collect().await.unwrap();

    assert_eq!(docs, vec![Doc::new("a", 3)]);
    assert_eq!(store.get("a"), Some(Doc::new("a", 5)));
    assert_eq!(store.write_count("a"), 2);
  }

  #[tokio::test]
  async fn test_stale_key_removed_before_backfill_is_not_found() {
    let store = Arc::new(store_with([Doc::new("a", 1), Doc::new("b", 2)]));
    let source = sortable([Doc::new("c", 5)]);
    let engine = engine_over(&store, &source);

    let mut stream = engine.reconcile_with_cache();
    let first = stream.try_next().await.unwrap().unwrap();
    assert_eq!(first.key, "c");

    // Snapshot already taken; "a" vanishes before the backfill reads it
    store.remove("a");
    let rest: Vec<Result<Doc>> = stream.collect().await;

    let last = rest.last().unwrap().as_ref().unwrap_err();
    assert!(matches!(last, SyncError::NotFound { key } if key == "a"));
    assert!(rest[..rest.len() - 1]
      .iter()
      .all(|r| r.as_ref().is_ok_and(|doc| doc.key == "b")));
  }

  #[tokio::test]
  async fn test_completeness_from_empty_cache() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = sortable((1..=5).map(|i| Doc::new(format!("k{}", i), i)));
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.reconcile_with_cache().try_collect().await.unwrap();

    assert_eq!(keys_of(&docs), vec!["k1", "k2", "k3", "k4", "k5"]);
    for doc in &docs {
      assert_eq!(store.write_count(&doc.key), 1);
    }
  }

  #[tokio::test]
  async fn test_idempotent_rerun_is_all_backfill() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = sortable([Doc::new("a", 1), Doc::new("b", 2)]);
    let engine = engine_over(&store, &source);

    let first: Vec<Doc> = engine.reconcile_with_cache().try_collect().await.unwrap();
    let pulled = source.pulled();
    let second: Vec<Doc> = engine.reconcile_with_cache().try_collect().await.unwrap();

    assert_eq!(
      sorted(keys_of(&second).into_iter().map(String::from).collect()),
      sorted(keys_of(&first).into_iter().map(String::from).collect())
    );
    // Nothing came from the remote the second time
    assert_eq!(source.pulled(), pulled);
    assert_eq!(store.write_count("a"), 1);
  }

  #[tokio::test]
  async fn test_merge_with_minimum_timestamp_entry() {
    let store = Arc::new(store_with([Doc::new("k0", i64::MIN)]));
    let source = sortable([Doc::new("k0", i64::MIN)]);
    let engine = engine_over(&store, &source);

    let docs: Vec<Doc> = engine.reconcile_with_cache().try_collect().await.unwrap();

    assert_eq!(docs, vec![Doc::new("k0", i64::MIN)]);
    assert_eq!(source.pulled(), 0);
  }

  #[tokio::test]
  async fn test_watermark_is_monotonic_across_cycles() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = sortable([Doc::new("a", 3)]);
    let engine = engine_over(&store, &source);
    let mut previous = engine.resolve_watermark().await.unwrap();

    for (key, ts) in [("b", 10), ("c", 7), ("d", 12)] {
      source.push(Doc::new(key, ts));
      let cycle: Vec<Doc> = engine.reconcile().try_collect().await.unwrap();
      let cached_max = cycle.iter().map(|d| d.updated).max().unwrap_or(previous);

      let watermark = engine.resolve_watermark().await.unwrap();
      assert!(watermark >= previous);
      assert!(watermark >= cached_max);
      previous = watermark;
    }
    // "c" arrived older than the watermark and was never fetched
    assert!(store.get("c").is_none());
  }

  #[tokio::test]
  async fn test_storage_failure_surfaces_and_terminates() {
    let store = Arc::new(store_with([Doc::new("a", 1)]));
    let source = sortable([Doc::new("b", 2)]);
    store.set_unavailable(true);
    let engine = engine_over(&store, &source);

    let mut stream = engine.reconcile_with_cache();
    assert!(stream.try_next().await.unwrap_err().is_storage());
    assert!(stream.next().await.is_none());
  }

  #[tokio::test]
  async fn test_remote_failure_keeps_delivered_items() {
    let store = Arc::new(MemoryStore::<Doc>::new());
    let source = sortable([Doc::new("a", 1), Doc::new("b", 2), Doc::new("c", 3)]);
    source.fail_after(2);
    let engine = engine_over(&store, &source);

    let results: Vec<Result<Doc>> = engine.reconcile_with_cache().collect().await;

    assert_eq!(results.len(), 3);
    assert!(results[2].as_ref().unwrap_err().is_remote());
    assert_eq!(store.len(), 2);
  }
}
