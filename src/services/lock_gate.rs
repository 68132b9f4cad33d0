//! Lock Gate
//!
//! Non-blocking, keyed mutual exclusion around bucket processing so only one
//! instance samples a given bucket. A zero key or a missing locker turns the
//! gate into a no-op that always admits.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::services::rate_repository::{AdvisoryLockHandle, AdvisoryLocker, RepositoryError};

/// Upper bound on a release before it is abandoned
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct LockGate {
    locker: Option<Arc<dyn AdvisoryLocker>>,
    key: i64,
}

pub enum GateAcquire {
    Acquired(GatePermit),
    /// Another holder has the key; the caller should skip silently
    Contended,
}

/// Held gate. Releasing more than once is harmless; dropping an unreleased
/// permit hands the underlying handle to its own drop cleanup.
pub struct GatePermit {
    key: i64,
    handle: Option<Box<dyn AdvisoryLockHandle>>,
}

impl LockGate {
    pub fn new(locker: Option<Arc<dyn AdvisoryLocker>>, key: i64) -> Self {
        Self { locker, key }
    }

    pub fn disabled() -> Self {
        Self { locker: None, key: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.key != 0 && self.locker.is_some()
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn try_acquire(&self) -> Result<GateAcquire, RepositoryError> {
        let locker = match (&self.locker, self.key) {
            (Some(locker), key) if key != 0 => locker,
            _ => {
                return Ok(GateAcquire::Acquired(GatePermit {
                    key: self.key,
                    handle: None,
                }));
            }
        };

        match locker.try_advisory_lock(self.key).await? {
            Some(handle) => Ok(GateAcquire::Acquired(GatePermit {
                key: self.key,
                handle: Some(handle),
            })),
            None => {
                debug!(key = self.key, "Advisory lock held elsewhere");
                Ok(GateAcquire::Contended)
            }
        }
    }
}

impl GatePermit {
    pub fn is_noop(&self) -> bool {
        self.handle.is_none()
    }

    /// Release the lock, bounded by [`RELEASE_TIMEOUT`]. Failures are logged,
    /// never returned.
    pub async fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match timeout(RELEASE_TIMEOUT, handle.unlock()).await {
            Ok(Ok(())) => debug!(key = self.key, "Released advisory lock"),
            Ok(Err(e)) => error!(key = self.key, error = %e, "Failed to release advisory lock"),
            Err(_) => error!(
                key = self.key,
                timeout_ms = RELEASE_TIMEOUT.as_millis() as u64,
                "Timed out releasing advisory lock"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::MemoryRateRepository;

    fn gate(store: &Arc<MemoryRateRepository>, key: i64) -> LockGate {
        LockGate::new(Some(store.clone() as Arc<dyn AdvisoryLocker>), key)
    }

    #[tokio::test]
    async fn test_zero_key_is_noop() {
        let store = Arc::new(MemoryRateRepository::new());
        let gate = gate(&store, 0);
        assert!(!gate.is_enabled());

        let first = gate.try_acquire().await.unwrap();
        let second = gate.try_acquire().await.unwrap();
        assert!(matches!(first, GateAcquire::Acquired(ref p) if p.is_noop()));
        assert!(matches!(second, GateAcquire::Acquired(_)));
    }

    #[tokio::test]
    async fn test_missing_locker_is_noop() {
        let gate = LockGate::new(None, 99);
        assert!(matches!(
            gate.try_acquire().await.unwrap(),
            GateAcquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_second_acquire_is_contended_until_release() {
        let store = Arc::new(MemoryRateRepository::new());
        let gate = gate(&store, 7);

        let GateAcquire::Acquired(mut permit) = gate.try_acquire().await.unwrap() else {
            panic!("first acquire should succeed");
        };
        assert!(matches!(
            gate.try_acquire().await.unwrap(),
            GateAcquire::Contended
        ));

        permit.release().await;
        permit.release().await;
        assert!(!store.is_locked(7));
        assert!(matches!(
            gate.try_acquire().await.unwrap(),
            GateAcquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_dropped_permit_frees_key() {
        let store = Arc::new(MemoryRateRepository::new());
        let gate = gate(&store, 7);
        {
            let _permit = gate.try_acquire().await.unwrap();
            assert!(store.is_locked(7));
        }
        assert!(!store.is_locked(7));
    }
}
