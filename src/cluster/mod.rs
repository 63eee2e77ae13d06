//! Cluster Metadata Module
//!
//! Read-only view of the cluster plan and current state for shards.
//! The synchronizer polls it; it never mutates it.

mod memory;

pub use memory::InMemoryClusterView;

use std::time::Duration;

use crate::error::Result;

/// Read-only snapshot of which servers are planned/current for a shard
#[async_trait::async_trait]
pub trait ClusterMetadataView: Send + Sync {
    /// Servers planned for the shard; the first entry is the planned leader
    async fn planned_servers(&self, database: &str, plan_id: &str, shard: &str)
        -> Result<Vec<String>>;

    /// Servers actually replicating the shard; the first entry is the acting leader
    async fn current_servers(&self, database: &str, plan_id: &str, shard: &str)
        -> Result<Vec<String>>;

    /// Network endpoint of a server
    async fn server_endpoint(&self, server_id: &str) -> Result<String>;

    /// Latest version of the cluster's current state (0 = unknown)
    async fn fetch_current_version(&self, timeout: Duration) -> Result<u64>;

    /// Wait until the local cache has seen at least `version`
    async fn wait_for_current_version(&self, version: u64) -> Result<()>;
}

/// Check whether `server` is planned as a follower of `leader`
pub fn is_planned_follower(planned: &[String], leader: &str, server: &str) -> bool {
    match planned.split_first() {
        Some((first, followers)) if first == leader => followers.iter().any(|s| s == server),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_planned_follower() {
        let planned = servers(&["L", "F1", "F2"]);
        assert!(is_planned_follower(&planned, "L", "F2"));
        assert!(!is_planned_follower(&planned, "F1", "F2"));
        assert!(!is_planned_follower(&planned, "L", "L"));
        assert!(!is_planned_follower(&[], "L", "F1"));
    }
}
