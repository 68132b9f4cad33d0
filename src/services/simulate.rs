//! Alert simulation
//!
//! Pushes fixed official/market rates through the normal bucket pipeline so
//! the alert path and notifier can be checked end to end without touching
//! the chain, the quote API or the database.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use crate::services::bucket_clock::{BucketClock, ClockError};
use crate::services::notifier::Notifier;
use crate::services::rate_source::StaticRateSource;
use crate::services::sampling::{
    BucketOutcome, SamplingError, SamplingOrchestrator, SamplingSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum SimulateError {
    #[error("alerting is disabled")]
    AlertingDisabled,

    #[error("no alert channel is configured")]
    NoNotifier,

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Sampling(#[from] SamplingError),
}

/// Run the pipeline once for the bucket containing `now`
///
/// # Arguments
///
/// * `settings` - Alerting settings; alerting must be enabled
/// * `notifier` - Channel the simulated alert is delivered to
/// * `official` / `market` - Rates to feed in
pub async fn simulate_alert(
    clock: &BucketClock,
    settings: SamplingSettings,
    notifier: Option<Arc<dyn Notifier>>,
    official: Decimal,
    market: Decimal,
    now: DateTime<Utc>,
) -> Result<BucketOutcome, SimulateError> {
    if !settings.alerting_enabled {
        return Err(SimulateError::AlertingDisabled);
    }
    let notifier = notifier.ok_or(SimulateError::NoNotifier)?;

    let source = Arc::new(StaticRateSource::new(official, market));
    let orchestrator =
        SamplingOrchestrator::new(settings, source.clone(), source).with_notifier(notifier);

    let bucket = clock.truncate(now)?;
    info!(bucket = %bucket, official = %official, market = %market, "Simulating alert");

    Ok(orchestrator.process_bucket(bucket).await?)
}
