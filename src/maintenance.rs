//! Maintenance State
//!
//! Process-wide bookkeeping shared by all synchronization attempts:
//! consecutive-failure counters, shard scheduling locks, local shard
//! versions and requeue requests. Owned by the scheduler and handed to
//! each synchronizer at construction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::job::{Priority, ShardSyncJob};

/// Delay before an attempt after `failures` consecutive failures, or
/// `None` below the threshold
pub fn backoff_delay(failures: usize, threshold: usize, max: Duration) -> Option<Duration> {
    if failures < threshold {
        return None;
    }
    let triangle = (failures * (failures + 1) / 2) as f64;
    let secs = (2.0 + 0.1 * triangle).min(max.as_secs_f64());
    Some(Duration::from_secs_f64(secs))
}

/// Sleep for `total` in slices of at most `step`, giving up on shutdown
pub async fn sleep_unless_stopping(total: Duration, step: Duration, shutdown: &CancellationToken) -> Result<()> {
    let mut remaining = total;
    while !remaining.is_zero() {
        if shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let slice = remaining.min(step);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
    Ok(())
}

/// Scheduler-owned state shared across attempts
#[derive(Default)]
pub struct MaintenanceStore {
    /// Consecutive failures per (database, shard)
    failures: Mutex<HashMap<(String, String), usize>>,
    /// Shards with a scheduled or running job
    locked_shards: Mutex<HashSet<(String, String)>>,
    /// Local version per shard, bumped after every finished job
    shard_versions: Mutex<HashMap<(String, String), u64>>,
    /// Jobs asking to be resubmitted
    requeued: Mutex<VecDeque<ShardSyncJob>>,
    timed_out_attempts: AtomicU64,
    wrong_checksums: AtomicU64,
}

impl MaintenanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(database: &str, shard: &str) -> (String, String) {
        (database.to_string(), shard.to_string())
    }

    /// Consecutive failures for a shard
    pub async fn failures(&self, database: &str, shard: &str) -> usize {
        self.failures
            .lock()
            .await
            .get(&Self::key(database, shard))
            .copied()
            .unwrap_or(0)
    }

    /// Count one more failure; returns the new count
    pub async fn record_failure(&self, database: &str, shard: &str) -> usize {
        let mut failures = self.failures.lock().await;
        let count = failures.entry(Self::key(database, shard)).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget all past failures of a shard
    pub async fn clear_failures(&self, database: &str, shard: &str) {
        self.failures.lock().await.remove(&Self::key(database, shard));
    }

    /// Lock a shard for scheduling; false if it is already locked
    pub async fn lock_shard(&self, database: &str, shard: &str) -> bool {
        self.locked_shards.lock().await.insert(Self::key(database, shard))
    }

    pub async fn unlock_shard(&self, database: &str, shard: &str) {
        self.locked_shards.lock().await.remove(&Self::key(database, shard));
    }

    pub async fn is_shard_locked(&self, database: &str, shard: &str) -> bool {
        self.locked_shards.lock().await.contains(&Self::key(database, shard))
    }

    /// Bump the local version of a shard; returns the new version
    pub async fn inc_shard_version(&self, database: &str, shard: &str) -> u64 {
        let mut versions = self.shard_versions.lock().await;
        let version = versions.entry(Self::key(database, shard)).or_insert(0);
        *version += 1;
        *version
    }

    pub async fn shard_version(&self, database: &str, shard: &str) -> u64 {
        self.shard_versions
            .lock()
            .await
            .get(&Self::key(database, shard))
            .copied()
            .unwrap_or(0)
    }

    /// Ask the scheduler to run `job` again with `priority`
    pub async fn requeue(&self, job: &ShardSyncJob, priority: Priority) {
        tracing::debug!(
            "Requeueing synchronization of {}/{} with {:?} priority",
            job.database, job.shard, priority
        );
        self.requeued.lock().await.push_back(job.clone().with_priority(priority));
    }

    /// Drain pending requeue requests
    pub async fn take_requeued(&self) -> Vec<ShardSyncJob> {
        self.requeued.lock().await.drain(..).collect()
    }

    pub fn count_timed_out_attempt(&self) {
        self.timed_out_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timed_out_attempts(&self) -> u64 {
        self.timed_out_attempts.load(Ordering::Relaxed)
    }

    pub fn count_wrong_checksum(&self) {
        self.wrong_checksums.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wrong_checksums(&self) -> u64 {
        self.wrong_checksums.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(15);

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0, 4, MAX), None);
        assert_eq!(backoff_delay(3, 4, MAX), None);
        assert_eq!(backoff_delay(4, 4, MAX), Some(Duration::from_secs(3)));
        assert_eq!(backoff_delay(10, 4, MAX), Some(Duration::from_millis(7500)));
        assert_eq!(backoff_delay(16, 4, MAX), Some(MAX));
        assert_eq!(backoff_delay(1000, 4, MAX), Some(MAX));
    }

    #[test]
    fn test_backoff_never_exceeds_cap() {
        for n in 4..200 {
            let delay = backoff_delay(n, 4, MAX).unwrap();
            assert!(delay <= MAX);
            assert!(delay >= Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_shutdown() {
        let token = CancellationToken::new();
        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move {
                sleep_unless_stopping(Duration::from_secs(15), Duration::from_millis(500), &token).await
            })
        };
        tokio::time::sleep(Duration::from_millis(1200)).await;
        token.cancel();
        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_failure_counter_lifecycle() {
        let store = MaintenanceStore::new();
        assert_eq!(store.record_failure("db", "s1").await, 1);
        assert_eq!(store.record_failure("db", "s1").await, 2);
        assert_eq!(store.failures("db", "s2").await, 0);
        store.clear_failures("db", "s1").await;
        assert_eq!(store.failures("db", "s1").await, 0);
    }

    #[tokio::test]
    async fn test_shard_lock_and_requeue() {
        let store = MaintenanceStore::new();
        assert!(store.lock_shard("db", "s1").await);
        assert!(!store.lock_shard("db", "s1").await);
        store.unlock_shard("db", "s1").await;
        assert!(!store.is_shard_locked("db", "s1").await);

        let job = ShardSyncJob::new("db", "s1", "42", "L");
        store.requeue(&job, Priority::Slow).await;
        let requeued = store.take_requeued().await;
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].priority, Priority::Slow);
        assert!(store.take_requeued().await.is_empty());
    }

    #[tokio::test]
    async fn test_shards_are_keyed_by_database() {
        let store = MaintenanceStore::new();
        assert!(store.lock_shard("db1", "s1").await);
        assert!(store.lock_shard("db2", "s1").await);
        assert!(!store.is_shard_locked("db3", "s1").await);

        assert_eq!(store.inc_shard_version("db1", "s1").await, 1);
        assert_eq!(store.inc_shard_version("db1", "s1").await, 2);
        assert_eq!(store.shard_version("db2", "s1").await, 0);
    }
}
