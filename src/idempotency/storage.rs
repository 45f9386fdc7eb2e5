use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::idempotency::request::StoredResponse;
use crate::idempotency::specification::{Fingerprint, LookupKey};

/// Failures raised by storage backends.
///
/// Distinct from protocol outcomes: any of these is fatal to the request that
/// hit it.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record '{lookup_key}' was not found")]
    NotFound { lookup_key: LookupKey },

    #[error("lock on '{lookup_key}' is held by another attempt")]
    LockContention { lookup_key: LookupKey },

    #[error("record '{lookup_key}' already has a response")]
    AlreadyCompleted { lookup_key: LookupKey },

    #[error("record '{lookup_key}' is corrupted: {reason}")]
    Corrupted { lookup_key: LookupKey, reason: String },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persisted state of one retry group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotentRequestRecord {
    pub lookup_key: LookupKey,
    pub fingerprint: Option<Fingerprint>,
    pub locked_at: Option<DateTime<Utc>>,
    pub response: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
}

impl IdempotentRequestRecord {
    /// A fresh, unlocked record with no response.
    pub fn new(lookup_key: LookupKey, fingerprint: Fingerprint) -> Self {
        Self {
            lookup_key,
            fingerprint: Some(fingerprint),
            locked_at: None,
            response: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Records created without a fingerprint accept any payload.
    pub fn matches_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprint
            .as_ref()
            .map_or(true, |stored| stored == fingerprint)
    }

    /// Idle means an earlier attempt was interrupted and may be resumed.
    pub fn is_idle(&self) -> bool {
        !self.is_locked() && !self.has_response()
    }

    pub fn lock_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.locked_at.map(|locked_at| now.signed_duration_since(locked_at))
    }

    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        ttl.and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .is_some_and(|expires_at| now > expires_at)
    }
}

/// Lock stamps are kept at microsecond precision so every backend can round
/// trip them exactly.
pub fn lock_stamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Record store used by the coordinator.
///
/// `create` and `lock` must be atomic per lookup key. Locking is a
/// compare-and-set against the `locked_at` value the caller observed, which is
/// how stale locks can be taken over without racing a live holder.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, lookup_key: &LookupKey) -> StorageResult<Option<IdempotentRequestRecord>>;

    /// Inserts an unlocked record, or returns the existing one untouched if
    /// another caller created it first.
    async fn create(
        &self,
        lookup_key: &LookupKey,
        fingerprint: &Fingerprint,
    ) -> StorageResult<IdempotentRequestRecord>;

    /// Returns the record as locked by this caller.
    async fn lock(&self, record: &IdempotentRequestRecord) -> StorageResult<IdempotentRequestRecord>;

    /// Stores the response and releases the lock in one step. `record` must be
    /// the value returned by [`IdempotencyStore::lock`].
    async fn set_response_and_unlock(
        &self,
        record: &IdempotentRequestRecord,
        response: &StoredResponse,
    ) -> StorageResult<IdempotentRequestRecord>;

    /// Releases the lock without storing a response.
    async fn unlock(&self, record: &IdempotentRequestRecord) -> StorageResult<()>;

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "idempotency_store"
    }
}

/// In-process store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<LookupKey, IdempotentRequestRecord>>,
    ttl: Option<Duration>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records older than `ttl` are treated as absent.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Drops expired records, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(self.ttl, now));
        before - records.len()
    }

    fn live<'a>(
        records: &'a mut HashMap<LookupKey, IdempotentRequestRecord>,
        lookup_key: &LookupKey,
        ttl: Option<Duration>,
    ) -> StorageResult<&'a mut IdempotentRequestRecord> {
        let now = Utc::now();
        records
            .get_mut(lookup_key)
            .filter(|record| !record.is_expired(ttl, now))
            .ok_or_else(|| StorageError::NotFound {
                lookup_key: lookup_key.clone(),
            })
    }
}

/// Background task that drops expired records from a [`MemoryIdempotencyStore`].
pub struct PurgeJob {
    store: Arc<MemoryIdempotencyStore>,
    interval_seconds: u64,
}

impl PurgeJob {
    pub fn new(store: Arc<MemoryIdempotencyStore>, interval_seconds: u64) -> Self {
        Self {
            store,
            interval_seconds: interval_seconds.max(1),
        }
    }

    pub async fn run_once(&self) -> usize {
        self.store.purge_expired().await
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(self.interval_seconds));

            loop {
                interval.tick().await;

                let count = self.run_once().await;
                if count > 0 {
                    tracing::info!("Purged {} expired idempotency records", count);
                }
            }
        })
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, lookup_key: &LookupKey) -> StorageResult<Option<IdempotentRequestRecord>> {
        let now = Utc::now();
        let records = self.records.lock().await;
        Ok(records
            .get(lookup_key)
            .filter(|record| !record.is_expired(self.ttl, now))
            .cloned())
    }

    async fn create(
        &self,
        lookup_key: &LookupKey,
        fingerprint: &Fingerprint,
    ) -> StorageResult<IdempotentRequestRecord> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(lookup_key) {
            if !existing.is_expired(self.ttl, now) {
                return Ok(existing.clone());
            }
        }

        let record = IdempotentRequestRecord::new(lookup_key.clone(), fingerprint.clone());
        records.insert(lookup_key.clone(), record.clone());
        Ok(record)
    }

    async fn lock(&self, record: &IdempotentRequestRecord) -> StorageResult<IdempotentRequestRecord> {
        let mut records = self.records.lock().await;
        let current = Self::live(&mut records, &record.lookup_key, self.ttl)?;

        if current.has_response() {
            return Err(StorageError::AlreadyCompleted {
                lookup_key: record.lookup_key.clone(),
            });
        }
        if current.locked_at != record.locked_at {
            return Err(StorageError::LockContention {
                lookup_key: record.lookup_key.clone(),
            });
        }

        // A takeover must never reuse the stamp of the lock it replaces.
        let mut stamp = lock_stamp();
        if let Some(previous) = current.locked_at {
            if stamp <= previous {
                stamp = previous + Duration::microseconds(1);
            }
        }

        current.locked_at = Some(stamp);
        Ok(current.clone())
    }

    async fn set_response_and_unlock(
        &self,
        record: &IdempotentRequestRecord,
        response: &StoredResponse,
    ) -> StorageResult<IdempotentRequestRecord> {
        let mut records = self.records.lock().await;
        let current = Self::live(&mut records, &record.lookup_key, self.ttl)?;

        if current.has_response() {
            return Err(StorageError::AlreadyCompleted {
                lookup_key: record.lookup_key.clone(),
            });
        }
        if record.locked_at.is_none() || current.locked_at != record.locked_at {
            return Err(StorageError::LockContention {
                lookup_key: record.lookup_key.clone(),
            });
        }

        current.response = Some(response.clone());
        current.locked_at = None;
        Ok(current.clone())
    }

    async fn unlock(&self, record: &IdempotentRequestRecord) -> StorageResult<()> {
        let mut records = self.records.lock().await;
        let current = Self::live(&mut records, &record.lookup_key, self.ttl)?;

        if record.locked_at.is_none() || current.locked_at != record.locked_at {
            return Err(StorageError::LockContention {
                lookup_key: record.lookup_key.clone(),
            });
        }

        current.locked_at = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory_store"
    }
}
