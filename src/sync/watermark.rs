//! Watermark resolution over the cache contents.

use futures::{future, stream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::cache::{CacheStore, Projector, Timestamp};
use crate::error::Result;

/// Maximum last-modified value over every cached item.
///
/// Reads run concurrently (at most `concurrency` in flight). An empty cache
/// resolves to `Ts::beginning_of_time()`. The first failed read aborts the
/// resolution; there is no best-effort maximum.
pub async fn resolve_watermark<T, Ts>(
  cache: &dyn CacheStore<T>,
  projector: &Projector<T, Ts>,
  concurrency: usize,
) -> Result<Ts>
where
  T: Send + Sync,
  Ts: Timestamp,
{
  let keys = cache.list_keys().await?;
  let cached = keys.len();

  let watermark = stream::iter(keys)
    .map(|key| async move { cache.read_item(&key).await })
    .buffer_unordered(concurrency.max(1))
    .try_fold(Ts::beginning_of_time(), |max, item| {
      future::ready(Ok(max.max(projector.last_modified_of(&item))))
    })
    .await?;

  debug!(store = cache.name(), cached, watermark = ?watermark, "Resolved watermark");
  Ok(watermark)
}
