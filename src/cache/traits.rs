//! Core traits and projections for cached items.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;

/// A totally ordered last-modified value.
///
/// `beginning_of_time` is the watermark of an empty cache, so every real
/// value must compare strictly greater than it for the item to be fetched.
pub trait Timestamp: Ord + Clone + Debug + Send + Sync + 'static {
  fn beginning_of_time() -> Self;
}

impl Timestamp for i64 {
  fn beginning_of_time() -> Self {
    i64::MIN
  }
}

impl Timestamp for u64 {
  fn beginning_of_time() -> Self {
    u64::MIN
  }
}

impl Timestamp for DateTime<Utc> {
  fn beginning_of_time() -> Self {
    DateTime::<Utc>::MIN_UTC
  }
}

/// Trait for entities that can be mirrored into the cache.
///
/// Implementors provide a stable persistent key and a last-modified value.
/// Two values with the same key are the same logical entity.
pub trait Cacheable: Send + Sync + 'static {
  type Timestamp: Timestamp;

  /// Stable identity (e.g., record id, issue key)
  fn cache_key(&self) -> String;

  /// Last modification value, used as filter and sort key
  fn last_modified(&self) -> Self::Timestamp;

  /// Name of the last-modified field as the remote source knows it
  fn timestamp_field() -> &'static str;
}

type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
type TimestampFn<T, Ts> = Arc<dyn Fn(&T) -> Ts + Send + Sync>;

/// Key and last-modified projections over an item type.
///
/// `field` names the last-modified field in the remote source so that
/// filter and sort directives can be expressed as data.
pub struct Projector<T, Ts> {
  field: Arc<str>,
  key: KeyFn<T>,
  last_modified: TimestampFn<T, Ts>,
}

impl<T, Ts> Projector<T, Ts> {
  pub fn new<K, M>(field: impl Into<String>, key: K, last_modified: M) -> Self
  where
    K: Fn(&T) -> String + Send + Sync + 'static,
    M: Fn(&T) -> Ts + Send + Sync + 'static,
  {
    Self {
      field: Arc::from(field.into()),
      key: Arc::new(key),
      last_modified: Arc::new(last_modified),
    }
  }

  pub fn field(&self) -> &str {
    &self.field
  }

  pub fn key_of(&self, item: &T) -> String {
    (self.key)(item)
  }

  pub fn last_modified_of(&self, item: &T) -> Ts {
    (self.last_modified)(item)
  }
}

impl<T: Cacheable> Projector<T, T::Timestamp> {
  /// Projector backed by the item's own `Cacheable` implementation.
  pub fn cacheable() -> Self {
    Self::new(T::timestamp_field(), T::cache_key, T::last_modified)
  }
}

impl<T, Ts> Clone for Projector<T, Ts> {
  fn clone(&self) -> Self {
    Self {
      field: Arc::clone(&self.field),
      key: Arc::clone(&self.key),
      last_modified: Arc::clone(&self.last_modified),
    }
  }
}

impl<T, Ts> Debug for Projector<T, Ts> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Projector")
      .field("field", &self.field)
      .finish_non_exhaustive()
  }
}
