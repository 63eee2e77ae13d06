//! Guaranteed Lock Release
//!
//! A lock held on the leader must never leak. `LockGuard` pairs every
//! acquisition with a release: callers release explicitly on every
//! `Result` path, and dropping a still-armed guard (panic, cancelled
//! future) spawns the cancel in the background.

use std::sync::Arc;
use std::time::Duration;

use super::{LeaderClient, LockGrant, LockMode, LockRequest};
use crate::error::{Error, ErrorCode, Result};
use crate::job::LockId;

/// A lock held on the leader
pub struct LockGuard {
    client: Arc<dyn LeaderClient>,
    endpoint: String,
    database: String,
    client_id: String,
    lock_id: LockId,
    mode: LockMode,
    grant: LockGrant,
    cancel_timeout: Duration,
    armed: bool,
}

impl LockGuard {
    /// Obtain a lock id from the leader, then acquire the lock under it.
    ///
    /// If the acquire request may have reached the leader but failed, the
    /// lock is cancelled right away since it may have been granted.
    pub async fn acquire(
        client: Arc<dyn LeaderClient>,
        endpoint: &str,
        mut request: LockRequest,
        timeout: Duration,
        cancel_timeout: Duration,
    ) -> Result<Self> {
        let lock_id = client
            .new_lock_id(endpoint, &request.database, timeout)
            .await
            .map_err(|e| {
                tracing::warn!("Failed to get lock id from {}: {}", endpoint, e);
                e
            })?;
        tracing::debug!("Got lock id {} from {}", lock_id, endpoint);
        request.lock_id = lock_id;

        match client.acquire_lock(endpoint, &request, timeout).await {
            Ok(grant) => Ok(Self {
                client,
                endpoint: endpoint.to_string(),
                database: request.database,
                client_id: request.client_id,
                lock_id,
                mode: request.mode,
                grant,
                cancel_timeout,
                armed: true,
            }),
            Err(e) => {
                tracing::debug!(
                    "Could not acquire {} lock {} on {}: {}",
                    request.mode, lock_id, endpoint, e
                );
                if !e.is_connect_failure() {
                    if let Err(cancel_err) = client
                        .cancel_lock(endpoint, &request.database, lock_id, &request.client_id, cancel_timeout)
                        .await
                    {
                        tracing::warn!(
                            "Cancellation error for lock {} on {}/{}: {}",
                            lock_id, request.database, request.collection, cancel_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    pub fn grant(&self) -> &LockGrant {
        &self.grant
    }

    /// Release the lock, reporting failure
    pub async fn release(mut self) -> Result<()> {
        self.armed = false;
        cancel(
            &*self.client,
            &self.endpoint,
            &self.database,
            self.lock_id,
            &self.client_id,
            self.cancel_timeout,
        )
        .await
    }

    /// Release the lock, only logging failure
    pub async fn release_quietly(self) {
        let mode = self.mode;
        if let Err(e) = self.release().await {
            tracing::info!("Could not cancel {} lock on leader: {}", mode, e);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let endpoint = std::mem::take(&mut self.endpoint);
        let database = std::mem::take(&mut self.database);
        let client_id = std::mem::take(&mut self.client_id);
        let (lock_id, mode, timeout) = (self.lock_id, self.mode, self.cancel_timeout);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = cancel(&*client, &endpoint, &database, lock_id, &client_id, timeout).await {
                        tracing::error!("Failed to cancel {} lock {} on leader: {}", mode, lock_id, e);
                    }
                });
            }
            Err(_) => {
                tracing::error!("Leaking {} lock {} on {}: no runtime to cancel it", mode, lock_id, endpoint);
            }
        }
    }
}

async fn cancel(
    client: &dyn LeaderClient,
    endpoint: &str,
    database: &str,
    lock_id: LockId,
    client_id: &str,
    timeout: Duration,
) -> Result<()> {
    match client.cancel_lock(endpoint, database, lock_id, client_id, timeout).await {
        Ok(()) => {
            tracing::debug!("Cancelled lock {} on {}", lock_id, endpoint);
            Ok(())
        }
        // The database is gone, and our lock with it
        Err(e) if e.code() == ErrorCode::DatabaseNotFound => Ok(()),
        Err(e) => {
            tracing::warn!("Cancelling lock {} on {} failed: {}", lock_id, endpoint, e);
            Err(Error::LockRelease(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::AddFollowerRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingLeader {
        acquires: AtomicUsize,
        cancels: AtomicUsize,
        acquire_error: Mutex<Option<ErrorCode>>,
        cancel_error: Mutex<Option<ErrorCode>>,
    }

    #[async_trait::async_trait]
    impl LeaderClient for CountingLeader {
        async fn new_lock_id(&self, _: &str, _: &str, _: Duration) -> Result<LockId> {
            Ok(17)
        }

        async fn acquire_lock(&self, _: &str, request: &LockRequest, _: Duration) -> Result<LockGrant> {
            assert_eq!(request.lock_id, 17);
            self.acquires.fetch_add(1, Ordering::SeqCst);
            match *self.acquire_error.lock().unwrap() {
                Some(ErrorCode::CouldNotConnect) => Err(Error::ConnectionFailed {
                    address: "leader".into(),
                    reason: "refused".into(),
                }),
                Some(code) => Err(Error::rpc(code, "lock refused")),
                None => Ok(LockGrant { following_term_id: Some(5), last_log_tick: Some(900) }),
            }
        }

        async fn cancel_lock(&self, _: &str, _: &str, lock_id: LockId, client_id: &str, _: Duration) -> Result<()> {
            assert_eq!(lock_id, 17);
            assert_eq!(client_id, "db42s1L");
            self.cancels.fetch_add(1, Ordering::SeqCst);
            match *self.cancel_error.lock().unwrap() {
                Some(code) => Err(Error::rpc(code, "cancel failed")),
                None => Ok(()),
            }
        }

        async fn add_follower(&self, _: &str, _: &AddFollowerRequest, _: Duration) -> Result<()> {
            Ok(())
        }

        async fn collection_count(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<u64> {
            Ok(0)
        }

        async fn recalculate_count(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<u64> {
            Ok(0)
        }
    }

    fn request(mode: LockMode) -> LockRequest {
        LockRequest {
            database: "db".into(),
            lock_id: 0,
            collection: "s1".into(),
            ttl: Duration::from_secs(300),
            server_id: "F".into(),
            client_id: "db42s1L".into(),
            reboot_id: 1,
            mode,
            want_following_term: true,
        }
    }

    async fn acquire(leader: &Arc<CountingLeader>, mode: LockMode) -> Result<LockGuard> {
        LockGuard::acquire(
            leader.clone(),
            "tcp://leader",
            request(mode),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
    }

    #[tokio::test]
    async fn test_explicit_release_cancels_once() {
        let leader = Arc::new(CountingLeader::default());
        let guard = acquire(&leader, LockMode::Hard).await.unwrap();
        assert_eq!(guard.grant().following_term().0, 5);
        guard.release().await.unwrap();

        tokio::task::yield_now().await;
        assert_eq!(leader.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(leader.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_armed_guard() {
        let leader = Arc::new(CountingLeader::default());
        {
            let _guard = acquire(&leader, LockMode::Soft).await.unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(leader.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_acquire_is_cancelled() {
        let leader = Arc::new(CountingLeader::default());
        *leader.acquire_error.lock().unwrap() = Some(ErrorCode::Timeout);
        assert!(acquire(&leader, LockMode::Hard).await.is_err());
        assert_eq!(leader.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_leader_is_not_cancelled() {
        let leader = Arc::new(CountingLeader::default());
        *leader.acquire_error.lock().unwrap() = Some(ErrorCode::CouldNotConnect);
        assert!(acquire(&leader, LockMode::Soft).await.is_err());
        assert_eq!(leader.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_on_vanished_database_succeeds() {
        let leader = Arc::new(CountingLeader::default());
        let guard = acquire(&leader, LockMode::Soft).await.unwrap();
        *leader.cancel_error.lock().unwrap() = Some(ErrorCode::DatabaseNotFound);
        assert!(guard.release().await.is_ok());

        let guard = acquire(&leader, LockMode::Soft).await.unwrap();
        *leader.cancel_error.lock().unwrap() = Some(ErrorCode::Internal);
        assert!(matches!(guard.release().await, Err(Error::LockRelease(_))));
    }
}
