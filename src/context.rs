//! Application wiring
//!
//! Builds the repository, rate sources, notifier, orchestrator and scheduler
//! from a [`Config`] and hands them to whichever command needs them.

use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::jobs::aligned_scheduler::AlignedScheduler;
use crate::services::backfill;
use crate::services::bucket_clock::{BucketClock, ClockError};
use crate::services::lock_gate::LockGate;
use crate::services::market_rate::CowMarketRate;
use crate::services::notifier::{Notifier, NotifyError, TelegramNotifier};
use crate::services::official_rate::VaultOfficialRate;
use crate::services::rate_repository::{
    self, AdvisoryLocker, PgRateRepository, RateSampleStore, RepositoryError,
};
use crate::services::rate_source::{MarketRateSource, OfficialRateSource, SourceError};
use crate::services::sampling::{SamplingOrchestrator, SamplingSettings};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("migration failed: {0}")]
    Migration(#[source] sea_orm::DbErr),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("database not configured; {0} requires DATABASE_URL")]
    DatabaseRequired(&'static str),
}

pub struct AppContext {
    pub config: Config,
    pub clock: BucketClock,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self, ContextError> {
        let clock = BucketClock::new(config.scheduler.interval, config.scheduler.align_to_bucket)?;
        Ok(Self { config, clock })
    }

    /// Connect (and migrate) when a database is configured
    pub async fn open_repository(&self) -> Result<Option<Arc<PgRateRepository>>, ContextError> {
        if self.config.database.url.is_none() {
            return Ok(None);
        }

        let db = rate_repository::connect(&self.config.database).await?;
        if self.config.database.run_migrations {
            info!("Running migrations...");
            migration::Migrator::up(&db, None)
                .await
                .map_err(ContextError::Migration)?;
        }
        Ok(Some(Arc::new(PgRateRepository::new(db))))
    }

    /// Like [`open_repository`](Self::open_repository) but fails without a database
    pub async fn require_repository(
        &self,
        command: &'static str,
    ) -> Result<Arc<PgRateRepository>, ContextError> {
        self.open_repository()
            .await?
            .ok_or(ContextError::DatabaseRequired(command))
    }

    pub fn sampling_settings(&self) -> SamplingSettings {
        SamplingSettings {
            notional: self.config.cow.notional_usde,
            alerting_enabled: self.config.alerting.enabled,
            threshold_pct: self.config.alerting.threshold_pct,
            channels: self.config.alerting.channels.clone(),
        }
    }

    /// Telegram notifier when enabled, otherwise `None`
    pub fn notifier(&self) -> Result<Option<Arc<dyn Notifier>>, ContextError> {
        if !self.config.alerting.telegram.enabled {
            return Ok(None);
        }
        let notifier = TelegramNotifier::new(&self.config.alerting.telegram)?;
        Ok(Some(Arc::new(notifier)))
    }

    pub fn live_sources(
        &self,
    ) -> Result<(Arc<dyn OfficialRateSource>, Arc<dyn MarketRateSource>), ContextError> {
        let official = VaultOfficialRate::new(&self.config.ethereum)?;
        let market = CowMarketRate::new(
            &self.config.cow,
            self.config.ethereum.usde_address.as_deref(),
            self.config.ethereum.susde_address.as_deref(),
        )?;
        Ok((Arc::new(official), Arc::new(market)))
    }

    /// Orchestrator for the live loop: gate, both stores and the notifier
    pub fn live_orchestrator(
        &self,
        repository: Option<Arc<PgRateRepository>>,
    ) -> Result<SamplingOrchestrator, ContextError> {
        let (official, market) = self.live_sources()?;
        let mut orchestrator = SamplingOrchestrator::new(self.sampling_settings(), official, market);

        match repository {
            Some(repo) => {
                let locker: Arc<dyn AdvisoryLocker> = repo.clone();
                orchestrator = orchestrator
                    .with_gate(LockGate::new(
                        Some(locker),
                        self.config.scheduler.advisory_lock_key,
                    ))
                    .with_sample_store(repo.clone())
                    .with_alert_store(repo);
            }
            None => warn!("DATABASE_URL not set; samples will not be persisted"),
        }

        if self.config.alerting.enabled {
            match self.notifier()? {
                Some(notifier) => orchestrator = orchestrator.with_notifier(notifier),
                None => warn!("Alerting enabled but no notifier configured; alerts are disabled"),
            }
        }

        Ok(orchestrator)
    }

    /// Orchestrator for backfill: no gate, no alert store, no notifier
    pub fn backfill_orchestrator(
        &self,
        repository: Option<Arc<PgRateRepository>>,
    ) -> Result<SamplingOrchestrator, ContextError> {
        let (official, market) = self.live_sources()?;
        let store = repository.map(|repo| repo as Arc<dyn RateSampleStore>);
        Ok(backfill::backfill_orchestrator(
            self.sampling_settings(),
            official,
            market,
            store,
        ))
    }

    pub fn scheduler(&self) -> AlignedScheduler {
        AlignedScheduler::new(self.clock, self.config.scheduler.startup_delay)
    }
}
