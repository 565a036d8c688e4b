//! Timer-driven repetition of reconciliation cycles.

use futures::{stream, StreamExt, TryStreamExt};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::engine::SyncEngine;
use crate::cache::Timestamp;
use crate::error::{Result, SyncError};
use crate::remote::ItemStream;

/// Poller state machine: `Idle -> Running -> Waiting -> Running -> ...`
enum PollPhase<T> {
  Idle,
  Running {
    cycle: u64,
    items: ItemStream<T>,
    deadline: Instant,
    yielded: usize,
  },
  Waiting {
    cycle: u64,
    deadline: Instant,
  },
}

/// Infinite stream of reconciliation cycles.
///
/// The first cycle merges with the stale cache so every cached item is
/// delivered once; later cycles only yield what the remote changed. The
/// timer for the next cycle is armed when a cycle starts, so time spent
/// consuming a cycle counts toward the interval. The stream never ends on
/// its own; drop it to stop. The first error ends it.
pub struct Poller<T, Ts> {
  engine: SyncEngine<T, Ts>,
  interval: Duration,
}

impl<T, Ts> Poller<T, Ts>
where
  T: Send + Sync + 'static,
  Ts: Timestamp,
{
  pub fn new(engine: SyncEngine<T, Ts>, interval: Duration) -> Result<Self> {
    if interval.is_zero() {
      return Err(SyncError::config("poll interval must be greater than zero"));
    }
    Ok(Self { engine, interval })
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn into_stream(self) -> ItemStream<T> {
    stream::try_unfold((self, PollPhase::Idle), |(poller, phase)| {
      poller.step(phase)
    })
    .boxed()
  }

  fn start_cycle(&self, cycle: u64) -> PollPhase<T> {
    debug!(cycle, "Starting reconciliation cycle");
    let items = if cycle == 1 {
      self.engine.reconcile_with_cache()
    } else {
      self.engine.reconcile()
    };
    PollPhase::Running {
      cycle,
      items,
      deadline: Instant::now() + self.interval,
      yielded: 0,
    }
  }

  async fn step(self, mut phase: PollPhase<T>) -> Result<Option<(T, (Self, PollPhase<T>))>> {
    loop {
      phase = match phase {
        PollPhase::Idle => self.start_cycle(1),
        PollPhase::Running {
          cycle,
          mut items,
          deadline,
          yielded,
        } => match items.try_next().await? {
          Some(item) => {
            let next = PollPhase::Running {
              cycle,
              items,
              deadline,
              yielded: yielded + 1,
            };
            return Ok(Some((item, (self, next))));
          }
          None => {
            info!(cycle, yielded, "Reconciliation cycle complete");
            PollPhase::Waiting { cycle, deadline }
          }
        },
        PollPhase::Waiting { cycle, deadline } => {
          sleep_until(deadline).await;
          self.start_cycle(cycle + 1)
        }
      };
    }
  }
}
