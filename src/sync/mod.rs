//! Reconciliation between a remote source and the local cache.

mod cursor;
mod engine;
mod observer;
mod poller;
mod watermark;

pub use cursor::ObservingCursor;
pub use engine::{Strategy, SyncEngine, SyncSettings};
pub use observer::{NoopObserver, SyncObserver, TracingObserver};
pub use poller::Poller;
pub use watermark::resolve_watermark;
