//! Backfill
//!
//! Replays `process_bucket` sequentially over the buckets in
//! `[align_forward(from), to)`. Failed buckets are counted and logged; the run
//! as a whole fails at the end if any bucket failed.
//!
//! Backfill never takes the advisory lock. The lock key is shared with the
//! live loop, so gating here would let a running backfill and the live
//! instance each skip the other's buckets.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::services::bucket_clock::{BucketClock, ClockError};
use crate::services::rate_repository::RateSampleStore;
use crate::services::rate_source::{MarketRateSource, OfficialRateSource};
use crate::services::sampling::{BucketOutcome, SamplingOrchestrator, SamplingSettings};

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Dry runs compute samples without a store
    pub dry_run: bool,
    /// Accepted for compatibility; processing is always sequential
    pub workers: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BackfillReport {
    pub fn attempted(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("backfill range is empty: from {from} to {to}")]
    EmptyRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("backfill cancelled after {} buckets", .0.attempted())]
    Cancelled(BackfillReport),

    #[error("{} of {} buckets failed, check the logs", .0.failed, .0.attempted())]
    PartialFailure(BackfillReport),
}

/// Ungated orchestrator that only writes samples
pub fn backfill_orchestrator(
    settings: SamplingSettings,
    official: Arc<dyn OfficialRateSource>,
    market: Arc<dyn MarketRateSource>,
    store: Option<Arc<dyn RateSampleStore>>,
) -> SamplingOrchestrator {
    let orchestrator = SamplingOrchestrator::new(settings, official, market);
    match store {
        Some(store) => orchestrator.with_sample_store(store),
        None => orchestrator,
    }
}

/// Process every bucket in the requested range in ascending order
///
/// # Arguments
///
/// * `clock` - Bucket clock defining the interval
/// * `orchestrator` - Pipeline to run per bucket (built without notifier)
/// * `options` - Range and mode
/// * `cancel` - Checked between and during buckets
pub async fn run_backfill(
    clock: &BucketClock,
    orchestrator: &SamplingOrchestrator,
    options: &BackfillOptions,
    cancel: &CancellationToken,
) -> Result<BackfillReport, BackfillError> {
    let buckets = clock.buckets_between(options.from, options.to)?;
    if buckets.is_empty() {
        return Err(BackfillError::EmptyRange {
            from: options.from,
            to: options.to,
        });
    }

    if options.workers > 1 {
        warn!(
            workers = options.workers,
            "Concurrent backfill is not supported, processing sequentially"
        );
    }
    if options.dry_run {
        warn!("Backfill dry run: samples will not be written");
    }

    info!(
        first = %buckets[0],
        last = %buckets[buckets.len() - 1],
        count = buckets.len(),
        "Starting backfill"
    );

    let mut report = BackfillReport::default();
    for bucket in buckets {
        if cancel.is_cancelled() {
            return Err(BackfillError::Cancelled(report));
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackfillError::Cancelled(report)),
            result = orchestrator.process_bucket(bucket) => result,
        };

        match result {
            Ok(BucketOutcome::Recorded { .. }) => report.processed += 1,
            Ok(BucketOutcome::Skipped) => {
                report.skipped += 1;
                warn!(bucket = %bucket, "Backfill bucket skipped and not filled");
            }
            Err(e) => {
                report.failed += 1;
                error!(bucket = %bucket, error = %e, "Backfill bucket failed");
            }
        }
    }

    info!(
        processed = report.processed,
        skipped = report.skipped,
        failed = report.failed,
        "Backfill completed"
    );

    if report.failed > 0 {
        return Err(BackfillError::PartialFailure(report));
    }
    Ok(report)
}
