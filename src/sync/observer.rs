//! Optional instrumentation hook for reconciliation cycles.

use std::fmt::Debug;
use tracing::info;

/// Receives per-cycle measurements from the engine.
///
/// Every method defaults to a no-op; the engine behaves identically with or
/// without an observer attached.
pub trait SyncObserver<Ts>: Send + Sync {
  /// Watermark resolved at the start of a cycle
  fn watermark_resolved(&self, _watermark: &Ts) {}

  /// Number of items materialized by an eager cycle
  fn items_materialized(&self, _count: usize) {}
}

/// Observer that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl<Ts> SyncObserver<Ts> for NoopObserver {}

/// Observer that emits structured `tracing` events
#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
  source: String,
}

impl TracingObserver {
  pub fn new(source: impl Into<String>) -> Self {
    Self {
      source: source.into(),
    }
  }
}

impl<Ts: Debug> SyncObserver<Ts> for TracingObserver {
  fn watermark_resolved(&self, watermark: &Ts) {
    info!(source = %self.source, watermark = ?watermark, "Watermark resolved");
  }

  fn items_materialized(&self, count: usize) {
    info!(source = %self.source, count, "Eager cycle materialized items");
  }
}
