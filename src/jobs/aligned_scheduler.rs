//! Aligned Scheduler
//!
//! Waits for the next bucket boundary, hands the bucket to a
//! [`BucketProcessor`], and repeats until cancelled. Processing errors are
//! logged and never stop the loop. Cadence is fixed: the boundary after a
//! bucket is `previous + interval` regardless of how long processing took,
//! unless that boundary is already in the past or the wall clock jumped
//! backwards, in which case it is recomputed from the current time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::bucket_clock::{BucketClock, ClockError};

/// Work executed once per bucket
#[async_trait]
pub trait BucketProcessor: Send + Sync {
    async fn process_bucket(&self, bucket: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Source of wall-clock time
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("bucket clock error: {0}")]
    Clock(#[from] ClockError),
}

pub struct AlignedScheduler {
    clock: BucketClock,
    startup_delay: Duration,
    wall_clock: Arc<dyn WallClock>,
}

impl AlignedScheduler {
    pub fn new(clock: BucketClock, startup_delay: Duration) -> Self {
        Self {
            clock,
            startup_delay,
            wall_clock: Arc::new(SystemClock),
        }
    }

    pub fn with_wall_clock(mut self, wall_clock: Arc<dyn WallClock>) -> Self {
        self.wall_clock = wall_clock;
        self
    }

    pub fn clock(&self) -> &BucketClock {
        &self.clock
    }

    /// Drive `processor` until `cancel` fires. Returns `Ok(())` on cancellation.
    pub async fn run(
        &self,
        processor: &dyn BucketProcessor,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        if !self.startup_delay.is_zero() {
            debug!(delay_secs = self.startup_delay.as_secs(), "Delaying scheduler start");
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler cancelled during startup delay");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.startup_delay) => {}
            }
        }

        let interval = self.clock.interval();
        let mut next = self.clock.next_boundary(self.wall_clock.now())?;
        let mut last_bucket: Option<DateTime<Utc>> = None;

        info!(
            interval_secs = interval.num_seconds(),
            aligned = self.clock.is_aligned(),
            first_boundary = %next,
            "Scheduler started"
        );

        loop {
            let now = self.wall_clock.now();
            if next <= now || next - now > interval {
                if next > now {
                    warn!(expected = %next, now = %now, "Wall clock moved backwards, realigning");
                }
                next = self.clock.next_boundary(now)?;
            }

            let wait = (next - now).to_std().unwrap_or_default();
            debug!(next_bucket = %next, wait_ms = wait.as_millis() as u64, "Waiting for next bucket");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let bucket = self.clock.bucket_for(next)?;
            if last_bucket.is_some_and(|last| bucket <= last) {
                warn!(bucket = %bucket, "Bucket already processed, skipping");
            } else {
                info!(bucket = %bucket, "Executing scheduled bucket");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(bucket = %bucket, "Scheduler cancelled while processing bucket");
                        return Ok(());
                    }
                    result = processor.process_bucket(bucket) => {
                        if let Err(e) = result {
                            error!(bucket = %bucket, error = %e, "Bucket execution failed");
                        }
                    }
                }
                last_bucket = Some(bucket);
            }

            next = self.clock.advance(next)?;
        }
    }
}
