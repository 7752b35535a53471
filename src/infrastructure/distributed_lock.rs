use crate::infrastructure::redis_abstraction::RedisLockCommands;
use rand::Rng;
use redis::RedisError;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds the lock. Retry the acquisition, never the body.
    #[error("lock '{resource}' is held by another owner (gave up after {attempts} attempts)")]
    Contended { resource: String, attempts: u32 },
    #[error("coordination store error while locking '{resource}': {source}")]
    Store {
        resource: String,
        #[source]
        source: RedisError,
    },
    /// The protected body failed; the lock was already released.
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

impl LockError {
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::Contended { .. })
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Base pause between acquisition attempts.
    pub retry_delay: Duration,
    /// Upper bound of random jitter added to each pause.
    pub retry_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            retry_jitter: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default)]
pub struct LockMetrics {
    pub locks_acquired: AtomicU64,
    pub lock_contention_count: AtomicU64,
    pub lock_store_errors: AtomicU64,
    pub locks_released: AtomicU64,
    pub releases_lost: AtomicU64,
    pub extensions_refused: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LockMetricsSnapshot {
    pub locks_acquired: u64,
    pub lock_contention_count: u64,
    pub lock_store_errors: u64,
    pub locks_released: u64,
    pub releases_lost: u64,
    pub extensions_refused: u64,
}

pub fn lock_key(resource: &str) -> String {
    format!("lock:{}", resource)
}

/// Owner token unique per acquiring call.
pub fn owner_token(instance_id: &str) -> String {
    format!("{}:{}", instance_id, Uuid::new_v4())
}

/// A held lock, handed to long-running bodies so they can renew their lease.
#[derive(Clone)]
pub struct LeaseHandle {
    manager: Arc<DistributedLockManager>,
    key: String,
    owner: String,
    lease: Duration,
}

impl LeaseHandle {
    pub fn new(
        manager: Arc<DistributedLockManager>,
        resource: &str,
        owner: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self {
            manager,
            key: lock_key(resource),
            owner: owner.into(),
            lease,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Renews the full lease. `false` means stop mutating shared state.
    pub async fn extend(&self) -> bool {
        self.manager
            .extend_lock(&self.key, &self.owner, self.lease.as_millis() as u64)
            .await
    }
}

/// Redis-backed mutual exclusion with ownership-checked release and extension.
pub struct DistributedLockManager {
    redis: Arc<dyn RedisLockCommands>,
    config: LockConfig,
    metrics: LockMetrics,
}

impl DistributedLockManager {
    pub fn new(redis: Arc<dyn RedisLockCommands>, config: LockConfig) -> Self {
        Self {
            redis,
            config,
            metrics: LockMetrics::default(),
        }
    }

    /// One `SET NX PX` attempt on `lock:{resource}`.
    pub async fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, LockError> {
        let key = lock_key(resource);
        match self.redis.set_nx_px(&key, owner, lease).await {
            Ok(true) => {
                self.metrics.locks_acquired.fetch_add(1, Ordering::Relaxed);
                debug!(resource, owner, lease_ms = lease.as_millis() as u64, "Acquired lock");
                Ok(true)
            }
            Ok(false) => {
                self.metrics
                    .lock_contention_count
                    .fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(source) => {
                self.metrics.lock_store_errors.fetch_add(1, Ordering::Relaxed);
                Err(LockError::Store {
                    resource: resource.to_string(),
                    source,
                })
            }
        }
    }

    /// Runs `body` while holding `lock:{resource}`.
    ///
    /// Acquisition is attempted `retry_count + 1` times. The body never runs
    /// without the lock; its error is returned as [`LockError::Operation`]
    /// after the release attempt.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        owner: &str,
        lease: Duration,
        retry_count: u32,
        body: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = retry_count + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_acquire(resource, owner, lease).await {
                Ok(true) => {
                    let result = body().await;
                    if !self.release_lock(&lock_key(resource), owner).await {
                        warn!(
                            resource,
                            owner, "Lock was no longer ours at release; lease likely expired mid-run"
                        );
                    }
                    return result.map_err(LockError::Operation);
                }
                Ok(false) => {
                    debug!(resource, owner, attempt, "Lock busy");
                    last_error = None;
                }
                Err(e) => {
                    warn!(resource, owner, attempt, error = %e, "Lock acquisition failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.retry_pause()).await;
            }
        }

        Err(last_error.unwrap_or_else(|| LockError::Contended {
            resource: resource.to_string(),
            attempts,
        }))
    }

    /// Resets the lease on `key` if `owner` still holds it.
    ///
    /// `false` means the lease may be lost and the caller must stop mutating
    /// shared state.
    pub async fn extend_lock(&self, key: &str, owner: &str, new_ttl_millis: u64) -> bool {
        match self
            .redis
            .compare_and_pexpire(key, owner, Duration::from_millis(new_ttl_millis))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                self.metrics.extensions_refused.fetch_add(1, Ordering::Relaxed);
                warn!(key, owner, "Lock extension refused; lease is held by someone else or expired");
                false
            }
            Err(e) => {
                self.metrics.extensions_refused.fetch_add(1, Ordering::Relaxed);
                error!(key, owner, error = %e, "Lock extension failed");
                false
            }
        }
    }

    /// Deletes `key` only if `owner` still holds it. Returns whether a key was deleted.
    pub async fn release_lock(&self, key: &str, owner: &str) -> bool {
        match self.redis.compare_and_delete(key, owner).await {
            Ok(true) => {
                self.metrics.locks_released.fetch_add(1, Ordering::Relaxed);
                debug!(key, owner, "Released lock");
                true
            }
            Ok(false) => {
                self.metrics.releases_lost.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(e) => {
                self.metrics.releases_lost.fetch_add(1, Ordering::Relaxed);
                error!(key, owner, error = %e, "Lock release failed");
                false
            }
        }
    }

    pub fn metrics(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            locks_acquired: self.metrics.locks_acquired.load(Ordering::Relaxed),
            lock_contention_count: self.metrics.lock_contention_count.load(Ordering::Relaxed),
            lock_store_errors: self.metrics.lock_store_errors.load(Ordering::Relaxed),
            locks_released: self.metrics.locks_released.load(Ordering::Relaxed),
            releases_lost: self.metrics.releases_lost.load(Ordering::Relaxed),
            extensions_refused: self.metrics.extensions_refused.load(Ordering::Relaxed),
        }
    }

    fn retry_pause(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.retry_delay + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::InMemoryRedis;
    use std::sync::atomic::AtomicBool;

    fn manager() -> (Arc<InMemoryRedis>, DistributedLockManager) {
        let redis = Arc::new(InMemoryRedis::new());
        let manager = DistributedLockManager::new(
            redis.clone(),
            LockConfig {
                retry_delay: Duration::from_millis(5),
                retry_jitter: Duration::ZERO,
            },
        );
        (redis, manager)
    }

    #[tokio::test]
    async fn body_runs_and_lock_is_released() {
        let (redis, manager) = manager();
        let value = manager
            .with_lock("outbox", "a", Duration::from_secs(5), 0, || async {
                Ok::<_, anyhow::Error>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(redis.value_of("lock:outbox"), None);
        assert_eq!(manager.metrics().locks_released, 1);
    }

    #[tokio::test]
    async fn contended_lock_never_runs_body() {
        let (redis, manager) = manager();
        redis.insert("lock:outbox", "other", Duration::from_secs(5));
        let ran = AtomicBool::new(false);

        let err = manager
            .with_lock("outbox", "a", Duration::from_secs(5), 2, || async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_contention());
        assert!(matches!(err, LockError::Contended { attempts: 3, .. }));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(redis.value_of("lock:outbox").as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn body_error_propagates_after_release() {
        let (redis, manager) = manager();
        let err = manager
            .with_lock("room:1", "a", Duration::from_secs(5), 0, || async {
                Err::<(), _>(anyhow::anyhow!("document store rejected write"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Operation(ref e) if e.to_string() == "document store rejected write"));
        assert_eq!(redis.value_of("lock:room:1"), None);
    }

    #[tokio::test]
    async fn store_failure_is_not_reported_as_contention() {
        let (redis, manager) = manager();
        redis.fail_next(3);
        let err = manager
            .with_lock("outbox", "a", Duration::from_secs(5), 2, || async {
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Store { .. }));
    }

    #[tokio::test]
    async fn acquisition_retries_until_holder_releases() {
        let (redis, manager) = manager();
        redis.insert("lock:outbox", "other", Duration::from_millis(20));
        let value = manager
            .with_lock("outbox", "a", Duration::from_secs(5), 20, || async {
                Ok::<_, anyhow::Error>("ran")
            })
            .await
            .unwrap();
        assert_eq!(value, "ran");
    }

    #[tokio::test]
    async fn extend_and_release_require_ownership() {
        let (redis, manager) = manager();
        redis.insert("lock:outbox", "b", Duration::from_secs(5));
        assert!(!manager.extend_lock("lock:outbox", "a", 10_000).await);
        assert!(!manager.release_lock("lock:outbox", "a").await);
        assert!(manager.extend_lock("lock:outbox", "b", 10_000).await);
        assert_eq!(redis.value_of("lock:outbox").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn extend_returns_false_on_store_error() {
        let (redis, manager) = manager();
        redis.insert("lock:outbox", "a", Duration::from_secs(5));
        redis.fail_next(1);
        assert!(!manager.extend_lock("lock:outbox", "a", 10_000).await);
    }

    #[test]
    fn owner_tokens_are_unique_per_call() {
        assert_ne!(owner_token("node-1"), owner_token("node-1"));
        assert!(owner_token("node-1").starts_with("node-1:"));
        assert_eq!(lock_key("job:outbox"), "lock:job:outbox");
    }
}
