//! Leader RPC Surface
//!
//! The operations a follower issues against the leader of a shard:
//! lock handling, follower registration and document counts.

mod lock;

pub use lock::LockGuard;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::job::{FollowingTermId, LockId, SyncerId, Tick};

/// Strength of a lock on the leader. The leader decides what each mode
/// means for its storage engine; the follower only passes the flag along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Soft,
    Hard,
}

impl LockMode {
    pub fn is_soft(&self) -> bool {
        matches!(self, LockMode::Soft)
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Soft => write!(f, "soft"),
            LockMode::Hard => write!(f, "hard"),
        }
    }
}

/// Request to hold a lock on the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub database: String,
    pub lock_id: LockId,
    pub collection: String,
    pub ttl: Duration,
    /// Requesting server
    pub server_id: String,
    /// Identity of the synchronization holding the lock
    pub client_id: String,
    pub reboot_id: u64,
    pub mode: LockMode,
    /// We understand following term ids
    pub want_following_term: bool,
}

/// Leader response to a granted lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    /// Only sent for hard locks by leaders that support terms
    pub following_term_id: Option<u64>,
    /// Only sent for hard locks; bounds tailing under the lock
    pub last_log_tick: Option<Tick>,
}

impl LockGrant {
    pub fn following_term(&self) -> FollowingTermId {
        FollowingTermId(self.following_term_id.unwrap_or(0))
    }
}

/// Request to be registered as an in-sync follower
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddFollowerRequest {
    pub database: String,
    pub follower_id: String,
    pub shard: String,
    /// Local document count
    pub checksum: u64,
    pub syncer_id: SyncerId,
    pub client_id: String,
    pub client_info: String,
    /// Proves the caller holds the exclusive lock (0 = none)
    pub lock_id: LockId,
}

/// Operations issued against the leader of a shard.
///
/// Implementations convert every transport failure into a crate `Error`;
/// a wrong checksum on add-follower must surface as `Error::ChecksumMismatch`.
#[async_trait::async_trait]
pub trait LeaderClient: Send + Sync {
    /// Ask the leader for a fresh lock id
    async fn new_lock_id(&self, endpoint: &str, database: &str, timeout: Duration) -> Result<LockId>;

    /// Acquire a lock under a previously obtained id
    async fn acquire_lock(&self, endpoint: &str, request: &LockRequest, timeout: Duration) -> Result<LockGrant>;

    /// Release a lock taken on behalf of `client_id`
    async fn cancel_lock(
        &self,
        endpoint: &str,
        database: &str,
        lock_id: LockId,
        client_id: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Register as follower
    async fn add_follower(&self, endpoint: &str, request: &AddFollowerRequest, timeout: Duration) -> Result<()>;

    /// Read the leader's document count for a shard
    async fn collection_count(&self, endpoint: &str, database: &str, shard: &str, timeout: Duration) -> Result<u64>;

    /// Force the leader to recount a shard
    async fn recalculate_count(&self, endpoint: &str, database: &str, shard: &str, timeout: Duration) -> Result<u64>;
}
