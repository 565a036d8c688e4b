//! Local cache side of the mirror.
//!
//! This module provides the storage half of incremental syncing:
//! - Items are addressed by a stable persistent key
//! - Every item exposes a last-modified value used to compute the watermark
//! - Stores are plain key/value blob stores; they know nothing about timestamps

mod sqlite;
mod store;
mod traits;

pub use sqlite::SqliteStore;
pub use store::{CacheStore, MemoryStore};
pub use traits::{Cacheable, Projector, Timestamp};
