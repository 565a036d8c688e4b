//! Remote side of the mirror.
//!
//! A remote source is a (possibly unbounded) collection that can be filtered
//! on its last-modified field and, when it advertises the capability, sorted
//! by it. Results are produced lazily as an item stream.

mod memory;
mod query;
mod sqlite;

pub use memory::MemorySource;
pub use query::{Capabilities, Comparison, Predicate, RemoteQuery, SortDirective, SortOrder};
pub use sqlite::{SqlTimestamp, SqliteSource, SqliteSourceConfig};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Lazily produced items; an `Err` ends the stream.
pub type ItemStream<T> = BoxStream<'static, Result<T>>;

/// Remote collection capability (Strategy pattern)
#[async_trait]
pub trait RemoteSource<T, Ts>: Send + Sync {
  /// What can be pushed down to this source
  fn capabilities(&self) -> Capabilities;

  /// Execute a query. Items are fetched as the returned stream is polled.
  async fn query(&self, query: RemoteQuery<Ts>) -> Result<ItemStream<T>>;

  /// Source name for logs
  fn name(&self) -> &'static str;
}
