//! Incrementally mirror a remote collection into a local cache.
//!
//! The newest last-modified value already cached (the watermark) bounds
//! what is asked of the remote on every cycle. New or changed items are
//! written to the cache as they are handed out, and cached items the remote
//! did not touch can be re-emitted so consumers always see the full set.

pub mod cache;
pub mod error;
pub mod record;
pub mod remote;
pub mod sync;

pub use cache::{CacheStore, Cacheable, MemoryStore, Projector, SqliteStore, Timestamp};
pub use error::{Result, SyncError};
pub use record::Record;
pub use remote::{Capabilities, ItemStream, MemorySource, RemoteQuery, RemoteSource, SqliteSource};
pub use sync::{Poller, Strategy, SyncEngine, SyncSettings};
