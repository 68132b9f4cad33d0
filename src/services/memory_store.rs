//! In-memory repository
//!
//! Implements the same contracts as the Postgres store for dry runs and
//! tests. Lock semantics match Postgres advisory locks closely enough for the
//! gate: a key is held until the handle is unlocked or dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::models::{AlertRecord, NewAlert, RateSample, SampleStatus};
use crate::services::rate_repository::{
    AdvisoryLockHandle, AdvisoryLocker, AlertStore, RateSampleStore, RepositoryError, round_pct,
};

#[derive(Default)]
pub struct MemoryRateRepository {
    samples: Mutex<BTreeMap<DateTime<Utc>, RateSample>>,
    alerts: Mutex<BTreeMap<DateTime<Utc>, AlertRecord>>,
    next_alert_id: AtomicI64,
    locks: Arc<Mutex<HashSet<i64>>>,
    fail_writes: AtomicBool,
}

impl MemoryRateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write return `Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn sample(&self, bucket: DateTime<Utc>) -> Option<RateSample> {
        self.samples.lock().get(&bucket).cloned()
    }

    pub fn alert_for(&self, bucket: DateTime<Utc>) -> Option<AlertRecord> {
        self.alerts.lock().get(&bucket).cloned()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_locked(&self, key: i64) -> bool {
        self.locks.lock().contains(&key)
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "writes disabled on memory store".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RateSampleStore for MemoryRateRepository {
    async fn upsert_sample(&self, sample: &RateSample) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut stored = sample.clone();
        stored.deviation_pct = round_pct(stored.deviation_pct);
        self.samples.lock().insert(sample.bucket, stored);
        Ok(())
    }

    async fn list_samples_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RateSample>, RepositoryError> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .samples
            .lock()
            .range(from..to)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn list_recent_samples(&self, limit: u64) -> Result<Vec<RateSample>, RepositoryError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .samples
            .lock()
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sample_errored(
        &self,
        bucket: DateTime<Utc>,
        message: &str,
    ) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut samples = self.samples.lock();
        let sample = samples
            .get_mut(&bucket)
            .ok_or(RepositoryError::NotFound(bucket))?;
        sample.status = SampleStatus::Errored;
        sample.error = Some(message.to_string());
        Ok(())
    }

    async fn count_samples(&self) -> Result<u64, RepositoryError> {
        Ok(self.samples.lock().len() as u64)
    }
}

#[async_trait]
impl AlertStore for MemoryRateRepository {
    async fn upsert_alert(&self, alert: &NewAlert) -> Result<AlertRecord, RepositoryError> {
        self.check_writable()?;
        if !self.samples.lock().contains_key(&alert.sample_bucket) {
            // Mirrors the foreign key on alerts.sample_ts
            return Err(RepositoryError::NotFound(alert.sample_bucket));
        }

        let mut alerts = self.alerts.lock();
        let record = match alerts.get(&alert.sample_bucket) {
            Some(existing) => AlertRecord {
                id: existing.id,
                created_at: existing.created_at,
                sample_bucket: alert.sample_bucket,
                deviation_pct: round_pct(alert.deviation_pct),
                threshold_pct: round_pct(alert.threshold_pct),
                direction: alert.direction,
                channels: alert.channels.clone(),
            },
            None => AlertRecord {
                id: self.next_alert_id.fetch_add(1, Ordering::SeqCst) + 1,
                created_at: Utc::now(),
                sample_bucket: alert.sample_bucket,
                deviation_pct: round_pct(alert.deviation_pct),
                threshold_pct: round_pct(alert.threshold_pct),
                direction: alert.direction,
                channels: alert.channels.clone(),
            },
        };
        alerts.insert(alert.sample_bucket, record.clone());
        Ok(record)
    }

    async fn list_recent_alerts(&self, limit: u64) -> Result<Vec<AlertRecord>, RepositoryError> {
        let mut records: Vec<AlertRecord> = self.alerts.lock().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(records)
    }

    async fn delete_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.check_writable()?;
        let mut alerts = self.alerts.lock();
        let before = alerts.len();
        alerts.retain(|_, record| record.created_at >= cutoff);
        Ok((before - alerts.len()) as u64)
    }
}

#[async_trait]
impl AdvisoryLocker for MemoryRateRepository {
    async fn try_advisory_lock(
        &self,
        key: i64,
    ) -> Result<Option<Box<dyn AdvisoryLockHandle>>, RepositoryError> {
        if !self.locks.lock().insert(key) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLockHandle {
            key,
            locks: Arc::clone(&self.locks),
        })))
    }
}

struct MemoryLockHandle {
    key: i64,
    locks: Arc<Mutex<HashSet<i64>>>,
}

#[async_trait]
impl AdvisoryLockHandle for MemoryLockHandle {
    async fn unlock(self: Box<Self>) -> Result<(), RepositoryError> {
        // Drop releases
        Ok(())
    }
}

impl Drop for MemoryLockHandle {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
    }
}
