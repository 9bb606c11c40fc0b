// Time source for the print sequence: wall clock, timers and paint ticks.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Local wall-clock time, used for timestamps and caption context.
    fn now(&self) -> DateTime<Local>;

    /// Monotonic time, used for every deadline.
    fn instant(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);

    /// Resolves on the next paint opportunity of whatever renders the booth.
    async fn next_frame(&self);
}

/// Tokio-timer scheduler. Wall time is read from the system clock on every
/// call and follows clock adjustments; deadlines stay monotonic.
pub struct TokioScheduler {
    frame_interval: Duration,
}

impl TokioScheduler {
    pub fn new(frame_interval: Duration) -> Self {
        Self { frame_interval }
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }

    async fn next_frame(&self) {
        tokio::time::sleep(self.frame_interval).await;
    }
}

/// Wall time pinned to a fixed start and advanced by the tokio clock, for
/// paused-time tests that need a known `now()`.
#[cfg(test)]
pub struct AnchoredScheduler {
    inner: TokioScheduler,
    wall_anchor: DateTime<Local>,
    anchor: Instant,
}

#[cfg(test)]
impl AnchoredScheduler {
    pub fn starting_at(wall_anchor: DateTime<Local>, frame_interval: Duration) -> Self {
        Self {
            inner: TokioScheduler::new(frame_interval),
            wall_anchor,
            anchor: Instant::now(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Scheduler for AnchoredScheduler {
    fn now(&self) -> DateTime<Local> {
        let elapsed = self.anchor.elapsed();
        self.wall_anchor + chrono::Duration::milliseconds(elapsed.as_millis() as i64)
    }

    fn instant(&self) -> Instant {
        self.inner.instant()
    }

    async fn sleep_until(&self, deadline: Instant) {
        self.inner.sleep_until(deadline).await;
    }

    async fn next_frame(&self) {
        self.inner.next_frame().await;
    }
}
