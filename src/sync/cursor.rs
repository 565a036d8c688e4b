//! Forward-only cursor that caches each item as it is observed.

use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::trace;

use crate::cache::{CacheStore, Projector};
use crate::error::Result;
use crate::remote::ItemStream;

/// Wraps a remote item stream with an explicit write step.
///
/// Each call to [`ObservingCursor::advance`] fetches one item, writes it to
/// the cache under its persistent key and only then hands it out. Items the
/// caller never asks for are never fetched past the remote's own buffering,
/// and never written.
pub struct ObservingCursor<T, Ts> {
  upstream: ItemStream<T>,
  cache: Arc<dyn CacheStore<T>>,
  projector: Projector<T, Ts>,
  observed: usize,
}

impl<T, Ts> ObservingCursor<T, Ts>
where
  T: Send + Sync + 'static,
  Ts: Send + Sync + 'static,
{
  pub fn new(
    upstream: ItemStream<T>,
    cache: Arc<dyn CacheStore<T>>,
    projector: Projector<T, Ts>,
  ) -> Self {
    Self {
      upstream,
      cache,
      projector,
      observed: 0,
    }
  }

  /// Fetch the next item, persist it, then return it.
  pub async fn advance(&mut self) -> Result<Option<T>> {
    let Some(item) = self.upstream.try_next().await? else {
      return Ok(None);
    };
    self.observe(&item).await?;
    Ok(Some(item))
  }

  /// The write half of `advance`.
  async fn observe(&mut self, item: &T) -> Result<()> {
    let key = self.projector.key_of(item);
    self.cache.write_item(&key, item).await?;
    self.observed += 1;
    trace!(key = %key, observed = self.observed, "Cached observed item");
    Ok(())
  }

  /// Items written so far
  pub fn observed(&self) -> usize {
    self.observed
  }

  pub fn into_stream(self) -> ItemStream<T> {
    stream::try_unfold(self, |mut cursor| async move {
      let next = cursor.advance().await;
      next.map(|item| item.map(|item| (item, cursor)))
    })
    .boxed()
  }
}
