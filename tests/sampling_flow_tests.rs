mod common;

use depeg_watch::models::{AlertDirection, SampleStatus};
use depeg_watch::services::backfill::{BackfillOptions, backfill_orchestrator, run_backfill};
use depeg_watch::services::bucket_clock::BucketClock;
use depeg_watch::services::lock_gate::{GateAcquire, LockGate};
use depeg_watch::services::memory_store::MemoryRateRepository;
use depeg_watch::services::rate_repository::{AdvisoryLocker, AlertStore, RateSampleStore};
use depeg_watch::services::rate_source::StaticRateSource;
use depeg_watch::services::sampling::{
    BucketOutcome, SamplingError, SamplingOrchestrator, SamplingSettings,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::common::{RecordingNotifier, at};

const LOCK_KEY: i64 = 0x7573_4445;

fn settings(threshold: Decimal) -> SamplingSettings {
    SamplingSettings {
        notional: dec!(10000),
        alerting_enabled: true,
        threshold_pct: threshold,
        channels: vec!["telegram".to_string()],
    }
}

fn orchestrator(
    store: &Arc<MemoryRateRepository>,
    notifier: &Arc<RecordingNotifier>,
    official: Decimal,
    market: Decimal,
) -> SamplingOrchestrator {
    let source = Arc::new(StaticRateSource::new(official, market));
    SamplingOrchestrator::new(settings(dec!(0.4)), source.clone(), source)
        .with_gate(LockGate::new(
            Some(store.clone() as Arc<dyn AdvisoryLocker>),
            LOCK_KEY,
        ))
        .with_sample_store(store.clone())
        .with_alert_store(store.clone())
        .with_notifier(notifier.clone())
}

#[tokio::test]
async fn test_reprocessing_a_bucket_keeps_latest_values() {
    let store = Arc::new(MemoryRateRepository::new());
    let notifier = Arc::new(RecordingNotifier::default());

    orchestrator(&store, &notifier, dec!(100), dec!(102))
        .process_bucket(at(12, 5))
        .await
        .unwrap();
    orchestrator(&store, &notifier, dec!(100), dec!(98))
        .process_bucket(at(12, 5))
        .await
        .unwrap();

    assert_eq!(store.count_samples().await.unwrap(), 1);
    let sample = store.sample(at(12, 5)).unwrap();
    assert_eq!(sample.deviation_pct, dec!(-2.00000000));
    assert_eq!(sample.status, SampleStatus::Complete);

    let alerts = store.list_recent_alerts(10).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].direction, AlertDirection::Down);
    assert_eq!(alerts[0].deviation_pct, dec!(-2));
    assert_eq!(notifier.count(), 2);
}

#[tokio::test]
async fn test_zero_official_rate_is_rejected_without_writes() {
    let store = Arc::new(MemoryRateRepository::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let result = orchestrator(&store, &notifier, dec!(0), dec!(1))
        .process_bucket(at(12, 5))
        .await;

    assert!(matches!(result, Err(SamplingError::ZeroOfficialRate)));
    assert_eq!(store.count_samples().await.unwrap(), 0);
    assert_eq!(store.alert_count(), 0);
    assert_eq!(notifier.count(), 0);
}

#[tokio::test]
async fn test_competing_instances_process_a_bucket_once() {
    let store = Arc::new(MemoryRateRepository::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let first = orchestrator(&store, &notifier, dec!(100), dec!(102));
    let second = orchestrator(&store, &notifier, dec!(100), dec!(102));

    // Simulate the first instance holding the gate while the second arrives
    let gate = LockGate::new(Some(store.clone() as Arc<dyn AdvisoryLocker>), LOCK_KEY);
    let GateAcquire::Acquired(mut permit) = gate.try_acquire().await.unwrap() else {
        panic!("gate should be free");
    };
    assert_eq!(
        second.process_bucket(at(12, 5)).await.unwrap(),
        BucketOutcome::Skipped
    );
    permit.release().await;

    assert!(matches!(
        first.process_bucket(at(12, 5)).await.unwrap(),
        BucketOutcome::Recorded { alerted: true, .. }
    ));
    assert_eq!(store.count_samples().await.unwrap(), 1);
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_disabled_gate_admits_every_caller() {
    let store = Arc::new(MemoryRateRepository::new());
    let gate = LockGate::new(Some(store.clone() as Arc<dyn AdvisoryLocker>), 0);

    let mut permits = Vec::new();
    for _ in 0..3 {
        match gate.try_acquire().await.unwrap() {
            GateAcquire::Acquired(permit) => permits.push(permit),
            GateAcquire::Contended => panic!("disabled gate must not contend"),
        }
    }
    for permit in &mut permits {
        permit.release().await;
        permit.release().await;
    }
}

#[tokio::test]
async fn test_backfill_fills_range_without_alerts() {
    let store = Arc::new(MemoryRateRepository::new());
    let clock = BucketClock::new(Duration::from_secs(300), true).unwrap();
    let source = Arc::new(StaticRateSource::new(dec!(1), dec!(1.001)));
    let backfill = backfill_orchestrator(
        settings(dec!(0.4)),
        source.clone(),
        source,
        Some(store.clone() as Arc<dyn RateSampleStore>),
    );

    let report = run_backfill(
        &clock,
        &backfill,
        &BackfillOptions {
            from: at(11, 0),
            to: at(12, 0),
            dry_run: false,
            workers: 1,
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.processed, 12);
    let samples = store.list_samples_between(at(11, 0), at(12, 0)).await.unwrap();
    assert_eq!(samples.len(), 12);
    assert!(samples.windows(2).all(|w| w[0].bucket < w[1].bucket));
    assert!(samples.iter().all(|s| s.deviation_pct == dec!(0.1)));
    assert_eq!(store.alert_count(), 0);
}
