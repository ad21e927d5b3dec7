//! [`Clock`] implementations.

use std::time::Duration;

use async_trait::async_trait;
use pipeline::{Clock, Timestamp};

/// Wall-clock time from the operating system; sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wall-clock time derived from the tokio monotonic timer.
///
/// Reports `origin + elapsed`, where `elapsed` is measured with
/// [`tokio::time::Instant`]. On a paused tokio runtime time only advances
/// through sleeps, which makes rate-limit and backoff behaviour deterministic
/// in tests.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    wall_origin: Timestamp,
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    /// Anchors the clock at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Timestamp::now())
    }

    /// Anchors the clock at `wall_origin`.
    pub fn starting_at(wall_origin: Timestamp) -> Self {
        Self {
            wall_origin,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        self.wall_origin.saturating_add(self.origin.elapsed())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
