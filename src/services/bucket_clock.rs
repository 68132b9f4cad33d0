//! Bucket Clock
//!
//! Maps wall-clock instants onto aligned bucket boundaries. Buckets are
//! multiples of the interval counted from the Unix epoch, so every instance
//! sharing a store agrees on bucket labels without coordination.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("bucket interval must be at least one millisecond")]
    IntervalTooSmall,

    #[error("bucket interval {0:?} is out of range")]
    IntervalOutOfRange(Duration),

    #[error("timestamp out of range while aligning {0}")]
    OutOfRange(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    interval: TimeDelta,
    interval_ms: i64,
    align_to_boundary: bool,
}

impl BucketClock {
    pub fn new(interval: Duration, align_to_boundary: bool) -> Result<Self, ClockError> {
        let interval_ms = i64::try_from(interval.as_millis())
            .map_err(|_| ClockError::IntervalOutOfRange(interval))?;
        if interval_ms < 1 {
            return Err(ClockError::IntervalTooSmall);
        }
        let interval =
            TimeDelta::from_std(interval).map_err(|_| ClockError::IntervalOutOfRange(interval))?;

        Ok(Self {
            interval,
            interval_ms,
            align_to_boundary,
        })
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    pub fn is_aligned(&self) -> bool {
        self.align_to_boundary
    }

    /// Next instant the scheduler should fire at; always strictly after `now`
    pub fn next_boundary(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
        if !self.align_to_boundary {
            return self.advance(now);
        }
        let truncated = self.truncate(now)?;
        if truncated > now {
            Ok(truncated)
        } else {
            self.advance(truncated)
        }
    }

    /// Bucket label for a timer that fired at `instant`
    pub fn bucket_for(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
        if self.align_to_boundary {
            self.truncate(instant)
        } else {
            Ok(instant)
        }
    }

    /// `instant + interval`
    pub fn advance(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
        instant
            .checked_add_signed(self.interval)
            .ok_or(ClockError::OutOfRange(instant))
    }

    /// Round down to the nearest interval multiple since the epoch
    pub fn truncate(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
        let millis = instant.timestamp_millis();
        let floored = millis - millis.rem_euclid(self.interval_ms);
        DateTime::from_timestamp_millis(floored).ok_or(ClockError::OutOfRange(instant))
    }

    /// Round up to the nearest interval multiple (identity on a boundary)
    pub fn align_forward(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
        let truncated = self.truncate(instant)?;
        if truncated < instant {
            self.advance(truncated)
        } else {
            Ok(truncated)
        }
    }

    /// Buckets in the half-open range `[align_forward(from), to)`, ascending
    pub fn buckets_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, ClockError> {
        let mut buckets = Vec::new();
        let mut cursor = self.align_forward(from)?;
        while cursor < to {
            buckets.push(cursor);
            cursor = self.advance(cursor)?;
        }
        Ok(buckets)
    }
}
