//! Fingerprint-keyed dedupe lock around each top-level pipeline run.
//!
//! The lock lives in the shared cache so that stateless workers with no
//! shared memory still see each other. The guard fails open: if the cache
//! cannot be reached the operation runs unguarded, trading a narrow window of
//! at-least-once side effects for availability.

use crate::cache::CacheStore;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// Default lifetime of a lock record.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Default interval between checks of a pending lock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Value stored in the cache under a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockRecord {
    /// An execution holds the lock. `claim` is unique per holder so that a
    /// takeover can tell one holder's record from the next.
    Pending { claim: String },
    /// The execution finished; later callers receive this result.
    Completed { result: serde_json::Value },
    /// The execution failed with this message.
    Failed { message: String },
}

impl LockRecord {
    fn pending() -> Self {
        LockRecord::Pending {
            claim: Uuid::new_v4().to_string(),
        }
    }
}

/// What a caller should do after [`IdempotencyGuard::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The caller holds the lock and must run the operation, then release.
    Proceed,
    /// Another execution already completed; here is its result.
    Completed(serde_json::Value),
    /// The execution this caller waited on failed.
    Failed(String),
}

/// Dedupe lock over a [`CacheStore`].
#[derive(Clone)]
pub struct IdempotencyGuard {
    cache: Arc<dyn CacheStore>,
    key_prefix: String,
    ttl: Duration,
    poll_interval: Duration,
}

impl IdempotencyGuard {
    /// Creates a guard with the default TTL and poll interval.
    pub fn new(cache: Arc<dyn CacheStore>, key_prefix: impl Into<String>) -> Self {
        IdempotencyGuard {
            cache,
            key_prefix: key_prefix.into(),
            ttl: DEFAULT_LOCK_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_timing(mut self, ttl: Duration, poll_interval: Duration) -> Self {
        self.ttl = ttl;
        self.poll_interval = poll_interval;
        self
    }

    fn key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}::{}", self.key_prefix, fingerprint)
    }

    /// Claims the fingerprint, or waits for and returns a concurrent result.
    ///
    /// Waiting is bounded by the lock TTL; once it elapses the lock is
    /// presumed abandoned by a crashed worker and this caller proceeds.
    pub async fn acquire(&self, fingerprint: &Fingerprint) -> Admission {
        let key = self.key(fingerprint);
        let mut deadline = Instant::now() + self.ttl;
        let mut waited = false;

        loop {
            let record = match self.cache.get(&key).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Cache read failed for {}, proceeding unguarded: {}", key, e);
                    return Admission::Proceed;
                }
            };

            let raw = match record {
                None => match self.claim(&key).await {
                    Some(admission) => return admission,
                    None => {
                        // lost the race to another claimant; look again
                        debug!("Lost claim race on {}", key);
                        deadline = Instant::now() + self.ttl;
                        continue;
                    }
                },
                Some(raw) => raw,
            };

            let parsed = match serde_json::from_str::<LockRecord>(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Unreadable lock record under {}, treating as stale: {}", key, e);
                    match self.reclaim(&key, &raw).await {
                        Some(admission) => return admission,
                        None => continue,
                    }
                }
            };

            match parsed {
                LockRecord::Completed { result } => {
                    info!("Fingerprint {} already completed, returning stored result", key);
                    return Admission::Completed(result);
                }
                LockRecord::Failed { message } => {
                    if waited {
                        return Admission::Failed(message);
                    }
                    info!("Retrying fingerprint {} after earlier failure: {}", key, message);
                    if let Some(admission) = self.reclaim(&key, &raw).await {
                        return admission;
                    }
                    debug!("Another caller is already retrying {}", key);
                    deadline = Instant::now() + self.ttl;
                }
                LockRecord::Pending { .. } => {
                    if Instant::now() >= deadline {
                        warn!("Lock {} still pending after TTL, proceeding", key);
                        if let Some(admission) = self.reclaim(&key, &raw).await {
                            return admission;
                        }
                        // someone else took over; give them a full TTL
                        deadline = Instant::now() + self.ttl;
                        continue;
                    }
                    debug!("Lock {} pending, waiting {:?}", key, self.poll_interval);
                    waited = true;
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Atomic claim of an absent key. `None` means someone else got there first.
    async fn claim(&self, key: &str) -> Option<Admission> {
        let pending = encode(&LockRecord::pending());
        match self.cache.set_if_absent(key, &pending, self.ttl).await {
            Ok(true) => Some(Admission::Proceed),
            Ok(false) => None,
            Err(e) => {
                warn!("Cache claim failed for {}, proceeding unguarded: {}", key, e);
                Some(Admission::Proceed)
            }
        }
    }

    /// Atomic takeover of a failed or stale record still holding `seen`.
    /// `None` means the record changed underneath us.
    async fn reclaim(&self, key: &str, seen: &str) -> Option<Admission> {
        let pending = encode(&LockRecord::pending());
        match self.cache.replace_if(key, seen, &pending, self.ttl).await {
            Ok(true) => Some(Admission::Proceed),
            Ok(false) => None,
            Err(e) => {
                warn!("Cache reclaim failed for {}, proceeding unguarded: {}", key, e);
                Some(Admission::Proceed)
            }
        }
    }

    /// Stores the final result so late duplicates observe it.
    pub async fn release_completed(&self, fingerprint: &Fingerprint, result: serde_json::Value) {
        self.store(fingerprint, &LockRecord::Completed { result }).await;
    }

    /// Stores the failure so the lock does not stick and waiters are told.
    pub async fn release_failed(&self, fingerprint: &Fingerprint, message: String) {
        self.store(fingerprint, &LockRecord::Failed { message }).await;
    }

    async fn store(&self, fingerprint: &Fingerprint, record: &LockRecord) {
        let key = self.key(fingerprint);
        if let Err(e) = self.cache.set(&key, &encode(record), self.ttl).await {
            warn!("Failed to release lock {}: {}", key, e);
        }
    }

    /// Runs `operation` at most once per fingerprint at a time.
    ///
    /// Duplicates get the stored result back instead of running again. The
    /// lock is released on both success and failure.
    pub async fn run<T, F>(&self, fingerprint: &Fingerprint, operation: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T>>,
    {
        match self.acquire(fingerprint).await {
            Admission::Completed(stored) => return Ok(serde_json::from_value(stored)?),
            Admission::Failed(message) => return Err(EngineError::PriorAttemptFailed(message)),
            Admission::Proceed => {}
        }

        let outcome = operation.await;
        match &outcome {
            Ok(result) => match serde_json::to_value(result) {
                Ok(value) => self.release_completed(fingerprint, value).await,
                Err(e) => self.release_failed(fingerprint, e.to_string()).await,
            },
            Err(e) => self.release_failed(fingerprint, e.to_string()).await,
        }
        outcome
    }
}

fn encode(record: &LockRecord) -> String {
    // LockRecord holds only strings and JSON values, which always encode
    serde_json::to_string(record).unwrap_or_else(|_| String::from("{\"state\":\"FAILED\",\"message\":\"unencodable\"}"))
}
