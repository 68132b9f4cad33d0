//! Sampling Orchestrator
//!
//! Runs one bucket end to end: gate, official rate, market quote, deviation,
//! sample upsert, optional alert and notification, gate release.
//!
//! Only fetch failures and gate errors are returned. Persistence and
//! notification failures are logged and swallowed so a store or chat outage
//! never hides the rate itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::jobs::aligned_scheduler::BucketProcessor;
use crate::models::{AlertDirection, NewAlert, RateSample, SampleStatus};
use crate::services::lock_gate::{GateAcquire, LockGate};
use crate::services::notifier::{Notification, Notifier};
use crate::services::rate_repository::{AlertStore, PCT_SCALE, RateSampleStore, RepositoryError};
use crate::services::rate_source::{MarketRateSource, OfficialRateSource, SourceError};

const ONE_HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("official rate fetch failed: {0}")]
    Official(#[source] SourceError),

    #[error("official rate is zero")]
    ZeroOfficialRate,

    #[error("market rate fetch failed: {0}")]
    Market(#[source] SourceError),

    #[error("lock acquisition failed: {0}")]
    Lock(#[source] RepositoryError),

    #[error("deviation out of range for official {official} and market {market}")]
    Arithmetic { official: Decimal, market: Decimal },
}

/// Result of a successful `process_bucket` call
#[derive(Debug, Clone, PartialEq)]
pub enum BucketOutcome {
    Recorded {
        deviation_pct: Decimal,
        alerted: bool,
    },
    /// Another instance holds the gate
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub notional: Decimal,
    pub alerting_enabled: bool,
    pub threshold_pct: Decimal,
    pub channels: Vec<String>,
}

impl SamplingSettings {
    fn alert_threshold(&self) -> Option<Decimal> {
        if self.alerting_enabled && !self.threshold_pct.is_zero() {
            Some(self.threshold_pct)
        } else {
            None
        }
    }
}

pub struct SamplingOrchestrator {
    settings: SamplingSettings,
    official: Arc<dyn OfficialRateSource>,
    market: Arc<dyn MarketRateSource>,
    gate: LockGate,
    samples: Option<Arc<dyn RateSampleStore>>,
    alerts: Option<Arc<dyn AlertStore>>,
    notifier: Option<Arc<dyn Notifier>>,
}

/// `(market / official - 1) * 100`, rounded half away from zero to the
/// stored percentage precision
pub fn compute_deviation_pct(official: Decimal, market: Decimal) -> Option<Decimal> {
    if official.is_zero() {
        return None;
    }
    let ratio = market.checked_div(official)?;
    let pct = ratio.checked_sub(Decimal::ONE)?.checked_mul(ONE_HUNDRED)?;
    Some(pct.round_dp_with_strategy(PCT_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

impl SamplingOrchestrator {
    pub fn new(
        settings: SamplingSettings,
        official: Arc<dyn OfficialRateSource>,
        market: Arc<dyn MarketRateSource>,
    ) -> Self {
        Self {
            settings,
            official,
            market,
            gate: LockGate::disabled(),
            samples: None,
            alerts: None,
            notifier: None,
        }
    }

    pub fn with_gate(mut self, gate: LockGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_sample_store(mut self, store: Arc<dyn RateSampleStore>) -> Self {
        self.samples = Some(store);
        self
    }

    pub fn with_alert_store(mut self, store: Arc<dyn AlertStore>) -> Self {
        self.alerts = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn has_notifier(&self) -> bool {
        self.notifier.is_some()
    }

    /// Process a single bucket
    ///
    /// # Arguments
    ///
    /// * `bucket` - Aligned bucket timestamp used as the sample key
    pub async fn process_bucket(
        &self,
        bucket: DateTime<Utc>,
    ) -> Result<BucketOutcome, SamplingError> {
        let mut permit = match self.gate.try_acquire().await.map_err(SamplingError::Lock)? {
            GateAcquire::Acquired(permit) => permit,
            GateAcquire::Contended => {
                debug!(bucket = %bucket, key = self.gate.key(), "Bucket owned by another instance, skipping");
                return Ok(BucketOutcome::Skipped);
            }
        };

        let outcome = self.sample(bucket).await;
        permit.release().await;
        outcome
    }

    async fn sample(&self, bucket: DateTime<Utc>) -> Result<BucketOutcome, SamplingError> {
        let official = self
            .official
            .fetch_official()
            .await
            .map_err(SamplingError::Official)?;
        if official.rate.is_zero() {
            return Err(SamplingError::ZeroOfficialRate);
        }

        let quote = self
            .market
            .fetch_market(self.settings.notional)
            .await
            .map_err(SamplingError::Market)?;

        let deviation_pct = compute_deviation_pct(official.rate, quote.rate).ok_or(
            SamplingError::Arithmetic {
                official: official.rate,
                market: quote.rate,
            },
        )?;

        let sample = RateSample {
            bucket,
            official_rate: official.rate,
            market_rate: quote.rate,
            deviation_pct,
            notional: self.settings.notional,
            quote_quality: quote.quality,
            raw_quote: quote.raw_quote,
            block_number: i64::try_from(official.block_number)
                .ok()
                .filter(|height| *height > 0),
            status: SampleStatus::Complete,
            error: None,
            created_at: Utc::now(),
        };

        let persisted = match &self.samples {
            Some(store) => match store.upsert_sample(&sample).await {
                Ok(()) => true,
                Err(e) => {
                    error!(bucket = %bucket, error = %e, "Failed to persist sample");
                    false
                }
            },
            None => false,
        };

        info!(
            bucket = %bucket,
            official = %sample.official_rate,
            market = %sample.market_rate,
            deviation_pct = %deviation_pct,
            quality = %sample.quote_quality,
            persisted,
            "Sample recorded"
        );

        let alerted = self.maybe_alert(&sample, persisted).await;

        Ok(BucketOutcome::Recorded {
            deviation_pct,
            alerted,
        })
    }

    /// Returns true when the threshold was crossed and an alert was raised
    async fn maybe_alert(&self, sample: &RateSample, sample_persisted: bool) -> bool {
        let Some(threshold) = self.settings.alert_threshold() else {
            return false;
        };
        let Some(notifier) = &self.notifier else {
            return false;
        };
        if sample.deviation_pct.abs() <= threshold {
            return false;
        }

        let direction = AlertDirection::classify(sample.deviation_pct);
        if direction == AlertDirection::Flat {
            // Unreachable with a validated non-negative threshold
            warn!(bucket = %sample.bucket, "Flat deviation crossed alert threshold");
        }

        if let Some(alerts) = &self.alerts {
            let alert = NewAlert {
                sample_bucket: sample.bucket,
                deviation_pct: sample.deviation_pct,
                threshold_pct: threshold,
                direction,
                channels: self.settings.channels.clone(),
            };
            match alerts.upsert_alert(&alert).await {
                Ok(record) => debug!(bucket = %sample.bucket, alert_id = record.id, "Alert stored"),
                Err(e) => {
                    error!(bucket = %sample.bucket, error = %e, "Failed to persist alert");
                    if sample_persisted {
                        self.flag_sample(sample.bucket, &format!("alert persistence failed: {}", e))
                            .await;
                    }
                }
            }
        }

        let notification = Notification {
            bucket: sample.bucket,
            official_rate: sample.official_rate,
            market_rate: sample.market_rate,
            deviation_pct: sample.deviation_pct,
            threshold_pct: threshold,
            direction,
            channels: self.settings.channels.clone(),
            notional: sample.notional,
        };
        if let Err(e) = notifier.notify(&notification).await {
            error!(bucket = %sample.bucket, error = %e, "Failed to send alert notification");
        }

        true
    }

    async fn flag_sample(&self, bucket: DateTime<Utc>, message: &str) {
        let Some(store) = &self.samples else {
            return;
        };
        if let Err(e) = store.mark_sample_errored(bucket, message).await {
            error!(bucket = %bucket, error = %e, "Failed to flag sample as errored");
        }
    }
}

#[async_trait]
impl BucketProcessor for SamplingOrchestrator {
    async fn process_bucket(&self, bucket: DateTime<Utc>) -> anyhow::Result<()> {
        SamplingOrchestrator::process_bucket(self, bucket).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::MemoryRateRepository;
    use crate::services::notifier::NotifyError;
    use crate::services::rate_repository::AdvisoryLocker;
    use crate::services::rate_source::{MarketQuote, OfficialReading, StaticRateSource};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().push(notification.clone());
            if self.fail {
                return Err(NotifyError::Rejected);
            }
            Ok(())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl OfficialRateSource for FailingSource {
        async fn fetch_official(&self) -> Result<OfficialReading, SourceError> {
            Err(SourceError::Rpc("node down".to_string()))
        }
    }

    #[async_trait]
    impl MarketRateSource for FailingSource {
        async fn fetch_market(&self, _notional: Decimal) -> Result<MarketQuote, SourceError> {
            Err(SourceError::InvalidResponse("no liquidity".to_string()))
        }
    }

    fn bucket() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 5, 0).unwrap()
    }

    fn settings(alerting: bool, threshold: Decimal) -> SamplingSettings {
        SamplingSettings {
            notional: dec!(10000),
            alerting_enabled: alerting,
            threshold_pct: threshold,
            channels: vec!["telegram".to_string()],
        }
    }

    struct Harness {
        store: Arc<MemoryRateRepository>,
        notifier: Arc<RecordingNotifier>,
        orchestrator: SamplingOrchestrator,
    }

    fn harness(official: Decimal, market: Decimal, threshold: Decimal) -> Harness {
        let store = Arc::new(MemoryRateRepository::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let source = Arc::new(StaticRateSource::new(official, market));
        let orchestrator = SamplingOrchestrator::new(
            settings(true, threshold),
            source.clone(),
            source,
        )
        .with_gate(LockGate::new(Some(store.clone() as Arc<dyn AdvisoryLocker>), 11))
        .with_sample_store(store.clone())
        .with_alert_store(store.clone())
        .with_notifier(notifier.clone());
        Harness {
            store,
            notifier,
            orchestrator,
        }
    }

    #[test]
    fn test_compute_deviation_pct() {
        assert_eq!(compute_deviation_pct(dec!(100), dec!(102)), Some(dec!(2.00000000)));
        assert_eq!(compute_deviation_pct(dec!(100), dec!(98)), Some(dec!(-2.00000000)));
        assert_eq!(compute_deviation_pct(dec!(3), dec!(1)), Some(dec!(-66.66666667)));
        assert_eq!(compute_deviation_pct(dec!(0), dec!(1)), None);
    }

    #[tokio::test]
    async fn test_records_sample_and_alerts_above_threshold() {
        let h = harness(dec!(100), dec!(102), dec!(0.4));
        let outcome = h.orchestrator.process_bucket(bucket()).await.unwrap();

        assert_eq!(
            outcome,
            BucketOutcome::Recorded {
                deviation_pct: dec!(2),
                alerted: true
            }
        );
        let stored = h.store.sample(bucket()).unwrap();
        assert_eq!(stored.deviation_pct, dec!(2.00000000));
        assert_eq!(stored.status, SampleStatus::Complete);
        assert_eq!(stored.block_number, None);
        assert_eq!(stored.quote_quality, "simulated");

        let alert = h.store.alert_for(bucket()).unwrap();
        assert_eq!(alert.direction, AlertDirection::Up);
        assert_eq!(alert.threshold_pct, dec!(0.4));
        assert_eq!(h.notifier.sent.lock().len(), 1);
        assert!(!h.store.is_locked(11));
    }

    #[tokio::test]
    async fn test_threshold_boundary_is_exclusive() {
        let h = harness(dec!(100), dec!(102), dec!(2));
        let outcome = h.orchestrator.process_bucket(bucket()).await.unwrap();
        assert!(matches!(outcome, BucketOutcome::Recorded { alerted: false, .. }));
        assert_eq!(h.store.alert_count(), 0);
        assert!(h.notifier.sent.lock().is_empty());

        let h = harness(dec!(100), dec!(97.99), dec!(2));
        h.orchestrator.process_bucket(bucket()).await.unwrap();
        assert_eq!(h.store.alert_for(bucket()).unwrap().direction, AlertDirection::Down);
    }

    #[tokio::test]
    async fn test_zero_threshold_disables_alerts() {
        let h = harness(dec!(100), dec!(150), dec!(0));
        h.orchestrator.process_bucket(bucket()).await.unwrap();
        assert_eq!(h.store.alert_count(), 0);
        assert!(h.notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_zero_official_rate_writes_nothing() {
        let h = harness(dec!(0), dec!(1), dec!(0.4));
        let result = h.orchestrator.process_bucket(bucket()).await;
        assert!(matches!(result, Err(SamplingError::ZeroOfficialRate)));
        assert_eq!(h.store.count_samples().await.unwrap(), 0);
        assert!(!h.store.is_locked(11));
    }

    #[tokio::test]
    async fn test_fetch_failures_write_nothing() {
        let store = Arc::new(MemoryRateRepository::new());
        let good = Arc::new(StaticRateSource::new(dec!(1), dec!(1)));

        let official_down = SamplingOrchestrator::new(
            settings(false, dec!(0)),
            Arc::new(FailingSource),
            good.clone(),
        )
        .with_sample_store(store.clone());
        assert!(matches!(
            official_down.process_bucket(bucket()).await,
            Err(SamplingError::Official(_))
        ));

        let market_down =
            SamplingOrchestrator::new(settings(false, dec!(0)), good, Arc::new(FailingSource))
                .with_sample_store(store.clone());
        assert!(matches!(
            market_down.process_bucket(bucket()).await,
            Err(SamplingError::Market(_))
        ));

        assert_eq!(store.count_samples().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_contended_gate_skips_without_error() {
        let h = harness(dec!(100), dec!(102), dec!(0.4));
        let _held = h.store.try_advisory_lock(11).await.unwrap().unwrap();

        let outcome = h.orchestrator.process_bucket(bucket()).await.unwrap();
        assert_eq!(outcome, BucketOutcome::Skipped);
        assert_eq!(h.store.count_samples().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_notifies() {
        let h = harness(dec!(100), dec!(95), dec!(0.4));
        h.store.set_fail_writes(true);

        let outcome = h.orchestrator.process_bucket(bucket()).await.unwrap();
        assert!(matches!(outcome, BucketOutcome::Recorded { alerted: true, .. }));
        assert_eq!(h.store.count_samples().await.unwrap(), 0);
        assert_eq!(h.notifier.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_is_swallowed() {
        let store = Arc::new(MemoryRateRepository::new());
        let source = Arc::new(StaticRateSource::new(dec!(1), dec!(1.1)));
        let notifier = Arc::new(RecordingNotifier {
            sent: Mutex::new(Vec::new()),
            fail: true,
        });
        let orchestrator =
            SamplingOrchestrator::new(settings(true, dec!(0.4)), source.clone(), source)
                .with_sample_store(store.clone())
                .with_alert_store(store.clone())
                .with_notifier(notifier.clone());

        assert!(orchestrator.process_bucket(bucket()).await.is_ok());
        assert_eq!(store.alert_count(), 1);
        assert_eq!(notifier.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reprocessing_overwrites_sample_and_alert() {
        let h = harness(dec!(100), dec!(102), dec!(0.4));
        h.orchestrator.process_bucket(bucket()).await.unwrap();
        h.orchestrator.process_bucket(bucket()).await.unwrap();

        assert_eq!(h.store.count_samples().await.unwrap(), 1);
        assert_eq!(h.store.alert_count(), 1);
        assert_eq!(h.notifier.sent.lock().len(), 2);
    }

    struct RejectingAlertStore;

    #[async_trait]
    impl AlertStore for RejectingAlertStore {
        async fn upsert_alert(
            &self,
            _alert: &NewAlert,
        ) -> Result<crate::models::AlertRecord, RepositoryError> {
            Err(RepositoryError::Unavailable("alerts table locked".to_string()))
        }

        async fn list_recent_alerts(
            &self,
            _limit: u64,
        ) -> Result<Vec<crate::models::AlertRecord>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn delete_alerts_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_alert_persistence_failure_flags_sample() {
        let store = Arc::new(MemoryRateRepository::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let source = Arc::new(StaticRateSource::new(dec!(1), dec!(1.1)));
        let orchestrator =
            SamplingOrchestrator::new(settings(true, dec!(0.4)), source.clone(), source)
                .with_sample_store(store.clone())
                .with_alert_store(Arc::new(RejectingAlertStore))
                .with_notifier(notifier.clone());

        orchestrator.process_bucket(bucket()).await.unwrap();

        let stored = store.sample(bucket()).unwrap();
        assert_eq!(stored.status, SampleStatus::Errored);
        assert!(stored.error.unwrap().contains("alert persistence failed"));
        assert_eq!(notifier.sent.lock().len(), 1);
    }
}
