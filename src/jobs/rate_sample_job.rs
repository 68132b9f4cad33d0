//! Rate Sample Job
//!
//! Runs the aligned scheduler against the sampling orchestrator until a
//! shutdown signal arrives. Supports graceful shutdown via SIGTERM/SIGINT.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::jobs::aligned_scheduler::{AlignedScheduler, SchedulerError};
use crate::services::sampling::SamplingOrchestrator;

/// Start the rate sample job
///
/// Spawns a background task that waits for each aligned bucket boundary and
/// processes the bucket. The task ends when `cancel` fires.
///
/// # Arguments
///
/// * `scheduler` - Aligned scheduler (interval, alignment, startup delay)
/// * `orchestrator` - Per-bucket sampling pipeline
/// * `cancel` - Shutdown signal
pub fn start_rate_sample_job(
    scheduler: AlignedScheduler,
    orchestrator: Arc<SamplingOrchestrator>,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), SchedulerError>> {
    tokio::spawn(async move {
        info!(
            interval_secs = scheduler.clock().interval().num_seconds(),
            "Rate sample job started"
        );

        let result = scheduler.run(orchestrator.as_ref(), cancel).await;
        match &result {
            Ok(()) => info!("Rate sample job stopped"),
            Err(e) => error!(error = %e, "Rate sample job aborted"),
        }
        result
    })
}

/// Cancel `cancel` on Ctrl-C or SIGTERM
pub fn spawn_shutdown_listener(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ctrl_c() => info!("Interrupt received, shutting down"),
            _ = terminate() => info!("SIGTERM received, shutting down"),
        }
        cancel.cancel();
    })
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bucket_clock::BucketClock;
    use crate::services::memory_store::MemoryRateRepository;
    use crate::services::rate_source::StaticRateSource;
    use crate::services::sampling::SamplingSettings;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_job_stops_on_cancel() {
        let store = Arc::new(MemoryRateRepository::new());
        let source = Arc::new(StaticRateSource::new(dec!(1), dec!(1.001)));
        let orchestrator = Arc::new(
            SamplingOrchestrator::new(
                SamplingSettings {
                    notional: dec!(10000),
                    alerting_enabled: false,
                    threshold_pct: dec!(0.4),
                    channels: Vec::new(),
                },
                source.clone(),
                source,
            )
            .with_sample_store(store.clone()),
        );
        let clock = BucketClock::new(Duration::from_secs(1), true).unwrap();
        let cancel = CancellationToken::new();

        let handle = start_rate_sample_job(
            AlignedScheduler::new(clock, Duration::ZERO),
            orchestrator,
            cancel.clone(),
        );
        cancel.cancel();

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_listener_exits_when_cancelled_elsewhere() {
        let cancel = CancellationToken::new();
        let listener = spawn_shutdown_listener(cancel.clone());
        cancel.cancel();
        listener.await.unwrap();
    }
}
