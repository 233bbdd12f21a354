//! TTL locks and lock-guarded background work.
//!
//! A refresh that finds its key already locked is skipped, not queued.
//! Locks are released when the work finishes. Work cancelled by shutdown
//! leaves its lock to expire.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::LockError;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `ttl`. Returns `false` when someone else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn release(&self, key: &str) -> Result<(), LockError>;
}

#[derive(Default)]
pub struct MemoryLockStore {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        match held.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                held.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.held.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    Started,
    Skipped,
}

/// Runs lock-guarded recomputations on a bounded set of tasks.
pub struct BackgroundRefresh {
    locks: Arc<dyn LockStore>,
    ttl: Duration,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl BackgroundRefresh {
    pub fn new(locks: Arc<dyn LockStore>, ttl: Duration, max_concurrent: usize) -> Self {
        Self {
            locks,
            ttl,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start `work` under `key` unless it is already running somewhere.
    ///
    /// `work` receives a token that fires on shutdown.
    pub async fn trigger<F, Fut>(
        &self,
        key: impl Into<String>,
        work: F,
    ) -> Result<RefreshStatus, LockError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if self.cancel.is_cancelled() {
            return Ok(RefreshStatus::Skipped);
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            debug!(key = %key, "refresh capacity exhausted, skipping");
            return Ok(RefreshStatus::Skipped);
        };

        if !self.locks.try_acquire(&key, self.ttl).await? {
            debug!(key = %key, "refresh already running, skipping");
            return Ok(RefreshStatus::Skipped);
        }

        let locks = self.locks.clone();
        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(key = %key, "refresh cancelled");
                    return;
                }
                _ = work(cancel.clone()) => {}
            }
            if let Err(err) = locks.release(&key).await {
                warn!(key = %key, error = %err, "failed to release refresh lock");
            }
        });

        Ok(RefreshStatus::Started)
    }

    /// Cancel running work and wait for every task to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn memory_lock_expires() {
        let store = MemoryLockStore::new();
        assert!(store.try_acquire("k", Duration::from_secs(5)).await.unwrap());
        assert!(!store.try_acquire("k", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.try_acquire("k", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped() {
        let refresh = BackgroundRefresh::new(
            Arc::new(MemoryLockStore::new()),
            Duration::from_secs(30),
            4,
        );
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let first = {
            let runs = runs.clone();
            let gate = gate.clone();
            refresh
                .trigger("dashboard:p1", move |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                })
                .await
                .unwrap()
        };
        let second = {
            let runs = runs.clone();
            refresh
                .trigger("dashboard:p1", move |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap()
        };

        assert_eq!(first, RefreshStatus::Started);
        assert_eq!(second, RefreshStatus::Skipped);

        gate.notify_one();
        refresh.shutdown().await;
        assert!(runs.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn lock_is_released_after_work() {
        let locks = Arc::new(MemoryLockStore::new());
        let refresh = BackgroundRefresh::new(locks.clone(), Duration::from_secs(30), 1);

        refresh
            .trigger("k", |_| async {})
            .await
            .unwrap();
        refresh.tracker.close();
        refresh.tracker.wait().await;

        assert!(locks.try_acquire("k", Duration::from_secs(1)).await.unwrap());
    }
}
