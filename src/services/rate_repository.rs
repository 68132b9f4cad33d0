//! Sample/Alert Repository
//!
//! Persistence contracts consumed by the sampling orchestrator, plus the
//! Postgres implementation. Samples are keyed by bucket timestamp and alerts by
//! the sample bucket they belong to; every write is an upsert so reprocessing a
//! bucket overwrites instead of duplicating.
//!
//! Locking is a separate capability ([`AdvisoryLocker`]) so callers hold an
//! explicit optional reference instead of probing the store at runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, DbBackend, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::entities::prelude::{Alerts, RateSamples};
use crate::entities::{alerts, rate_samples};
use crate::models::{AlertRecord, NewAlert, RateSample, SampleStatus};

/// Fractional digits kept for rates and notional
pub const RATE_SCALE: u32 = 18;

/// Fractional digits kept for percentages
pub const PCT_SCALE: u32 = 8;

const TRY_ADVISORY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1)";
const ADVISORY_UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1)";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("lock connection error: {0}")]
    LockConnection(#[from] sqlx::Error),

    #[error("no sample stored for bucket {0}")]
    NotFound(DateTime<Utc>),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Rate sample persistence
#[async_trait]
pub trait RateSampleStore: Send + Sync {
    /// Insert or overwrite the sample for `sample.bucket`
    async fn upsert_sample(&self, sample: &RateSample) -> Result<(), RepositoryError>;

    /// Samples with `from <= bucket < to`, oldest first
    async fn list_samples_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RateSample>, RepositoryError>;

    /// Newest first
    async fn list_recent_samples(&self, limit: u64) -> Result<Vec<RateSample>, RepositoryError>;

    /// Flag an existing sample as errored; `NotFound` if the bucket has no row
    async fn mark_sample_errored(
        &self,
        bucket: DateTime<Utc>,
        message: &str,
    ) -> Result<(), RepositoryError>;

    async fn count_samples(&self) -> Result<u64, RepositoryError>;
}

/// Alert audit persistence
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert or update the single alert row for `alert.sample_bucket`
    async fn upsert_alert(&self, alert: &NewAlert) -> Result<AlertRecord, RepositoryError>;

    /// Newest first by creation time
    async fn list_recent_alerts(&self, limit: u64) -> Result<Vec<AlertRecord>, RepositoryError>;

    /// Returns the number of rows removed
    async fn delete_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

/// Keyed, non-blocking, session-scoped mutual exclusion
#[async_trait]
pub trait AdvisoryLocker: Send + Sync {
    /// `Ok(None)` means another session holds the key
    async fn try_advisory_lock(
        &self,
        key: i64,
    ) -> Result<Option<Box<dyn AdvisoryLockHandle>>, RepositoryError>;
}

/// A held lock. Dropping a handle without unlocking must still free the key,
/// at the latest when the owning session goes away.
#[async_trait]
pub trait AdvisoryLockHandle: Send {
    async fn unlock(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// Open the Postgres pool described by `config`
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, RepositoryError> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| RepositoryError::Unavailable("DATABASE_URL is not configured".to_string()))?;

    let mut options = ConnectOptions::new(url.to_string());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(Duration::from_secs(30 * 60))
        .sqlx_logging(false);

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Connecting to database"
    );
    Ok(Database::connect(options).await?)
}

/// Postgres-backed repository
#[derive(Clone)]
pub struct PgRateRepository {
    db: DatabaseConnection,
}

impl PgRateRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn close(self) -> Result<(), RepositoryError> {
        self.db.close().await?;
        Ok(())
    }
}

#[async_trait]
impl RateSampleStore for PgRateRepository {
    async fn upsert_sample(&self, sample: &RateSample) -> Result<(), RepositoryError> {
        let model = rate_samples::ActiveModel {
            bucket_ts: Set(sample.bucket.fixed_offset()),
            official_rate: Set(sample.official_rate.round_dp(RATE_SCALE)),
            market_rate: Set(sample.market_rate.round_dp(RATE_SCALE)),
            deviation_pct: Set(sample.deviation_pct.round_dp(PCT_SCALE)),
            notional: Set(sample.notional.round_dp(RATE_SCALE)),
            quote_quality: Set(sample.quote_quality.clone()),
            raw_quote: Set(sample.raw_quote.clone()),
            block_number: Set(sample.block_number),
            status: Set(sample.status.as_str().to_string()),
            error: Set(sample.error.clone()),
            created_at: Set(sample.created_at.fixed_offset()),
        };

        RateSamples::insert(model)
            .on_conflict(
                OnConflict::column(rate_samples::Column::BucketTs)
                    .update_columns([
                        rate_samples::Column::OfficialRate,
                        rate_samples::Column::MarketRate,
                        rate_samples::Column::DeviationPct,
                        rate_samples::Column::Notional,
                        rate_samples::Column::QuoteQuality,
                        rate_samples::Column::RawQuote,
                        rate_samples::Column::BlockNumber,
                        rate_samples::Column::Status,
                        rate_samples::Column::Error,
                        rate_samples::Column::CreatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        debug!(bucket = %sample.bucket, "Upserted rate sample");
        Ok(())
    }

    async fn list_samples_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RateSample>, RepositoryError> {
        RateSamples::find()
            .filter(rate_samples::Column::BucketTs.gte(from.fixed_offset()))
            .filter(rate_samples::Column::BucketTs.lt(to.fixed_offset()))
            .order_by_asc(rate_samples::Column::BucketTs)
            .all(&self.db)
            .await?
            .into_iter()
            .map(RateSample::try_from)
            .collect()
    }

    async fn list_recent_samples(&self, limit: u64) -> Result<Vec<RateSample>, RepositoryError> {
        RateSamples::find()
            .order_by_desc(rate_samples::Column::BucketTs)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(RateSample::try_from)
            .collect()
    }

    async fn mark_sample_errored(
        &self,
        bucket: DateTime<Utc>,
        message: &str,
    ) -> Result<(), RepositoryError> {
        let result = RateSamples::update_many()
            .col_expr(
                rate_samples::Column::Status,
                sea_orm::sea_query::Expr::value(SampleStatus::Errored.as_str()),
            )
            .col_expr(
                rate_samples::Column::Error,
                sea_orm::sea_query::Expr::value(message.to_string()),
            )
            .filter(rate_samples::Column::BucketTs.eq(bucket.fixed_offset()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(RepositoryError::NotFound(bucket));
        }
        Ok(())
    }

    async fn count_samples(&self) -> Result<u64, RepositoryError> {
        Ok(RateSamples::find().count(&self.db).await?)
    }
}

#[async_trait]
impl AlertStore for PgRateRepository {
    async fn upsert_alert(&self, alert: &NewAlert) -> Result<AlertRecord, RepositoryError> {
        let model = alerts::ActiveModel {
            id: NotSet,
            sample_ts: Set(alert.sample_bucket.fixed_offset()),
            deviation_pct: Set(alert.deviation_pct.round_dp(PCT_SCALE)),
            threshold_pct: Set(alert.threshold_pct.round_dp(PCT_SCALE)),
            direction: Set(alert.direction.as_str().to_string()),
            channels: Set(alert.channels.clone()),
            created_at: NotSet,
        };

        let stored = Alerts::insert(model)
            .on_conflict(
                OnConflict::column(alerts::Column::SampleTs)
                    .update_columns([
                        alerts::Column::DeviationPct,
                        alerts::Column::ThresholdPct,
                        alerts::Column::Direction,
                        alerts::Column::Channels,
                    ])
                    .to_owned(),
            )
            .exec_with_returning(&self.db)
            .await?;

        AlertRecord::try_from(stored)
    }

    async fn list_recent_alerts(&self, limit: u64) -> Result<Vec<AlertRecord>, RepositoryError> {
        Alerts::find()
            .order_by_desc(alerts::Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(AlertRecord::try_from)
            .collect()
    }

    async fn delete_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = Alerts::delete_many()
            .filter(alerts::Column::CreatedAt.lt(cutoff.fixed_offset()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl AdvisoryLocker for PgRateRepository {
    async fn try_advisory_lock(
        &self,
        key: i64,
    ) -> Result<Option<Box<dyn AdvisoryLockHandle>>, RepositoryError> {
        if self.db.get_database_backend() != DbBackend::Postgres {
            return Err(RepositoryError::Unavailable(
                "advisory locks require a Postgres connection".to_string(),
            ));
        }

        // Reserve one connection for the whole acquire -> release window so
        // the lock lives in exactly one session
        let mut conn = self.db.get_postgres_connection_pool().acquire().await?;

        let acquired: bool = sqlx::query_scalar(TRY_ADVISORY_LOCK_SQL)
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(PgAdvisoryLock {
            key,
            conn: Some(conn),
        })))
    }
}

/// Advisory lock held on a reserved pooled connection
struct PgAdvisoryLock {
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl AdvisoryLockHandle for PgAdvisoryLock {
    async fn unlock(mut self: Box<Self>) -> Result<(), RepositoryError> {
        let key = self.key;
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };

        let released: Result<bool, sqlx::Error> = sqlx::query_scalar(ADVISORY_UNLOCK_SQL)
            .bind(key)
            .fetch_one(&mut **conn)
            .await;

        match released {
            Ok(true) => {
                // Healthy session without the lock goes back to the pool
                self.conn.take();
                Ok(())
            }
            Ok(false) => {
                // Drop discards the session
                Err(RepositoryError::Unavailable(format!(
                    "advisory lock {} was not held by this session",
                    key
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PgAdvisoryLock {
    fn drop(&mut self) {
        // Still holding the connection means the unlock never completed;
        // closing the session is the only way to guarantee the key is freed
        if let Some(conn) = self.conn.take() {
            warn!(key = self.key, "Discarding lock session without confirmed unlock");
            drop(conn.detach());
        }
    }
}

impl TryFrom<rate_samples::Model> for RateSample {
    type Error = RepositoryError;

    fn try_from(model: rate_samples::Model) -> Result<Self, Self::Error> {
        let status = model
            .status
            .parse::<SampleStatus>()
            .map_err(RepositoryError::Corrupt)?;

        Ok(RateSample {
            bucket: model.bucket_ts.with_timezone(&Utc),
            official_rate: model.official_rate,
            market_rate: model.market_rate,
            deviation_pct: model.deviation_pct,
            notional: model.notional,
            quote_quality: model.quote_quality,
            raw_quote: model.raw_quote,
            block_number: model.block_number,
            status,
            error: model.error,
            created_at: model.created_at.with_timezone(&Utc),
        })
    }
}

impl TryFrom<alerts::Model> for AlertRecord {
    type Error = RepositoryError;

    fn try_from(model: alerts::Model) -> Result<Self, Self::Error> {
        Ok(AlertRecord {
            id: model.id,
            sample_bucket: model.sample_ts.with_timezone(&Utc),
            deviation_pct: model.deviation_pct,
            threshold_pct: model.threshold_pct,
            direction: model.direction.parse().map_err(RepositoryError::Corrupt)?,
            channels: model.channels,
            created_at: model.created_at.with_timezone(&Utc),
        })
    }
}

/// Round a percentage to the stored precision
pub fn round_pct(value: Decimal) -> Decimal {
    value.round_dp(PCT_SCALE)
}
