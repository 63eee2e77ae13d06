//! ShardSync - Follower-side Shard Synchronization
//!
//! Brings a follower replica of a database shard into agreement with its
//! leader while the leader keeps accepting writes, then registers the
//! follower as in sync.
//!
//! # Architecture
//!
//! A `ShardSynchronizer` drives one attempt: it waits until the leader
//! serves the shard, copies it in bulk, tails the leader's WAL in rounds
//! under soft locks, and finishes under a hard lock that stops writes on
//! the leader. The storage engine, the replication machinery and the
//! cluster metadata are reached through traits so that the controller
//! can run against any backend.
//!
//! # Features
//!
//! - Guaranteed release of every lock taken on the leader
//! - Attempt deadline, shutdown and plan changes checked between phases
//! - Exponential backoff after repeated failures of a shard
//! - Checksum repair by recounting on follower and leader
//! - Requeue of large jobs at slow priority
//! - Framed TCP transport for the leader operations

pub mod config;
pub mod error;
pub mod job;
pub mod cluster;
pub mod leader;
pub mod rpc;
pub mod syncer;
pub mod maintenance;
pub mod sync;

pub use config::ShardSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ShardSyncConfig, SyncSettings};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::job::{FollowingTermId, Priority, ShardSyncJob, SyncProgress};
    pub use crate::cluster::{ClusterMetadataView, InMemoryClusterView};
    pub use crate::leader::{LeaderClient, LockGuard, LockMode};
    pub use crate::rpc::RpcLeaderClient;
    pub use crate::syncer::{BulkSyncer, ShardCollection, ShardStore, SyncContext, TailingSyncer};
    pub use crate::maintenance::MaintenanceStore;
    pub use crate::sync::{ActionState, ShardSynchronizer, SyncEnvironment, SyncReport};
}
