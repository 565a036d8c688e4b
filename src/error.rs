//! Error types for the reconciliation engine and its adapters.

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures surfaced while mirroring a remote collection into the cache.
///
/// Nothing in the engine retries or suppresses these: the first error ends
/// the current stream and is handed to whoever is iterating it.
#[derive(Error, Debug)]
pub enum SyncError {
  /// Cache I/O failure (open, read, write, listing, serialization)
  #[error("Cache storage unavailable: {message}")]
  StorageUnavailable {
    message: String,
    #[source]
    source: Option<BoxError>,
  },

  /// The remote source failed to answer a query or produce an item
  #[error("Remote source unavailable: {message}")]
  RemoteUnavailable {
    message: String,
    #[source]
    source: Option<BoxError>,
  },

  /// A key that was listed or observed has no entry in the cache
  #[error("Cache entry not found: {key}")]
  NotFound { key: String },

  /// The remote source cannot execute the requested query shape
  #[error("Unsupported by remote source: {capability}")]
  Unsupported { capability: String },

  /// Invalid settings handed to an adapter or the engine
  #[error("Configuration error: {message}")]
  Configuration { message: String },
}

impl SyncError {
  pub fn storage(message: impl Into<String>) -> Self {
    Self::StorageUnavailable {
      message: message.into(),
      source: None,
    }
  }

  pub fn storage_with_source(
    message: impl Into<String>,
    source: impl std::error::Error + Send + Sync + 'static,
  ) -> Self {
    Self::StorageUnavailable {
      message: message.into(),
      source: Some(Box::new(source)),
    }
  }

  pub fn remote(message: impl Into<String>) -> Self {
    Self::RemoteUnavailable {
      message: message.into(),
      source: None,
    }
  }

  pub fn remote_with_source(
    message: impl Into<String>,
    source: impl std::error::Error + Send + Sync + 'static,
  ) -> Self {
    Self::RemoteUnavailable {
      message: message.into(),
      source: Some(Box::new(source)),
    }
  }

  pub fn not_found(key: impl Into<String>) -> Self {
    Self::NotFound { key: key.into() }
  }

  pub fn unsupported(capability: impl Into<String>) -> Self {
    Self::Unsupported {
      capability: capability.into(),
    }
  }

  pub fn config(message: impl Into<String>) -> Self {
    Self::Configuration {
      message: message.into(),
    }
  }

  /// Check if the failure came from the cache side
  pub fn is_storage(&self) -> bool {
    matches!(self, Self::StorageUnavailable { .. } | Self::NotFound { .. })
  }

  /// Check if the failure came from the remote side
  pub fn is_remote(&self) -> bool {
    matches!(
      self,
      Self::RemoteUnavailable { .. } | Self::Unsupported { .. }
    )
  }
}
