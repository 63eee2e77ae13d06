//! Shard Synchronization Job
//!
//! The immutable description of one synchronization attempt and the
//! progress it accumulates.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// WAL position on the leader
pub type Tick = u64;

/// Leader-assigned lock id (0 = none held)
pub type LockId = u64;

/// Opaque identity of a bulk syncer, forwarded to the leader on add-follower
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncerId(pub u64);

/// Scheduling priority of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    /// Reduced priority for jobs expected to run long
    Slow,
}

/// Epoch of one follower registration, issued with a hard lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowingTermId(pub u64);

impl FollowingTermId {
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// Leader identifier used for the replication-state pointer.
    /// Older leaders hand out no term; the bare leader id is used then.
    pub fn leader_id(&self, leader: &str) -> String {
        if self.is_set() {
            format!("{}_{}", leader, self.0)
        } else {
            leader.to_string()
        }
    }
}

/// Description of a single shard synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSyncJob {
    pub database: String,
    pub shard: String,
    /// Plan id of the collection the shard belongs to
    pub plan_id: String,
    /// Server id of the planned leader
    pub leader: String,
    /// Resync even if we already appear in Current
    #[serde(default)]
    pub forced_resync: bool,
    /// Leader supports the revision-tree protocol (enables the attempt deadline)
    #[serde(default)]
    pub sync_by_revision: bool,
    #[serde(default)]
    pub priority: Priority,
}

impl ShardSyncJob {
    pub fn new(
        database: impl Into<String>,
        shard: impl Into<String>,
        plan_id: impl Into<String>,
        leader: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            shard: shard.into(),
            plan_id: plan_id.into(),
            leader: leader.into(),
            forced_resync: false,
            sync_by_revision: false,
            priority: Priority::Normal,
        }
    }

    pub fn with_forced_resync(mut self, forced: bool) -> Self {
        self.forced_resync = forced;
        self
    }

    pub fn with_sync_by_revision(mut self, by_revision: bool) -> Self {
        self.sync_by_revision = by_revision;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Reject jobs missing any mandatory field
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.database.is_empty() || self.shard.is_empty() {
            missing.push("database and shard must be specified.");
        }
        if self.plan_id.is_empty() {
            missing.push("collection must be specified.");
        }
        if self.leader.is_empty() {
            missing.push("leader must be specified and must be non-empty.");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(missing.join(" ")))
        }
    }

    /// Identity under which this follower talks to the leader
    pub fn client_id(&self) -> String {
        format!("{}{}{}{}", self.database, self.plan_id, self.shard, self.leader)
    }

    /// Human-readable description sent with add-follower
    pub fn client_info(&self, server_id: &str) -> String {
        format!(
            "follower {} of shard {}/{} of collection {}/{}",
            server_id, self.database, self.shard, self.database, self.plan_id
        )
    }
}

/// Progress accumulated by one attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub last_log_tick: Tick,
    pub tick_reached: Tick,
    /// Upper bound for tailing under the hard lock, if the leader sent one
    pub tailing_upper_bound_tick: Option<Tick>,
}

impl SyncProgress {
    /// Move the tailing start position forward; ticks never go back
    pub fn advance(&mut self, reached: Tick) {
        self.tick_reached = self.tick_reached.max(reached);
        self.last_log_tick = self.last_log_tick.max(reached);
    }
}
