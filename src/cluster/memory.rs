//! In-memory Cluster View
//!
//! A `ClusterMetadataView` backed by maps, fed by whatever keeps the
//! local cache of the cluster plan up to date (and by tests).

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use super::ClusterMetadataView;
use crate::error::{Error, Result};

type ShardKey = (String, String, String);

fn key(database: &str, plan_id: &str, shard: &str) -> ShardKey {
    (database.to_string(), plan_id.to_string(), shard.to_string())
}

/// Map-backed cluster metadata
pub struct InMemoryClusterView {
    /// Planned servers per shard
    planned: RwLock<HashMap<ShardKey, Vec<String>>>,
    /// Current servers per shard
    current: RwLock<HashMap<ShardKey, Vec<String>>>,
    /// Server endpoints
    endpoints: RwLock<HashMap<String, String>>,
    /// Version of the current state known to the cluster
    agency_version: RwLock<u64>,
    /// Version of the current state loaded into the local cache
    loaded_version: watch::Sender<u64>,
}

impl Default for InMemoryClusterView {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClusterView {
    pub fn new() -> Self {
        let (loaded_version, _) = watch::channel(0);
        Self {
            planned: RwLock::new(HashMap::new()),
            current: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            agency_version: RwLock::new(0),
            loaded_version,
        }
    }

    /// Set the planned servers for a shard (leader first)
    pub async fn set_planned(&self, database: &str, plan_id: &str, shard: &str, servers: Vec<String>) {
        self.planned.write().await.insert(key(database, plan_id, shard), servers);
    }

    /// Set the current servers for a shard (leader first)
    pub async fn set_current(&self, database: &str, plan_id: &str, shard: &str, servers: Vec<String>) {
        self.current.write().await.insert(key(database, plan_id, shard), servers);
    }

    /// Register a server endpoint
    pub async fn set_endpoint(&self, server_id: &str, endpoint: &str) {
        self.endpoints
            .write()
            .await
            .insert(server_id.to_string(), endpoint.to_string());
    }

    /// Record a new current version and mark it loaded locally
    pub async fn publish_current_version(&self, version: u64) {
        *self.agency_version.write().await = version;
        self.loaded_version.send_replace(version);
    }
}

#[async_trait::async_trait]
impl ClusterMetadataView for InMemoryClusterView {
    async fn planned_servers(&self, database: &str, plan_id: &str, shard: &str) -> Result<Vec<String>> {
        self.planned
            .read()
            .await
            .get(&key(database, plan_id, shard))
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(format!("{}/{} not in plan", database, shard)))
    }

    async fn current_servers(&self, database: &str, plan_id: &str, shard: &str) -> Result<Vec<String>> {
        Ok(self
            .current
            .read()
            .await
            .get(&key(database, plan_id, shard))
            .cloned()
            .unwrap_or_default())
    }

    async fn server_endpoint(&self, server_id: &str) -> Result<String> {
        self.endpoints
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no endpoint known for server {}", server_id)))
    }

    async fn fetch_current_version(&self, _timeout: Duration) -> Result<u64> {
        Ok(*self.agency_version.read().await)
    }

    async fn wait_for_current_version(&self, version: u64) -> Result<()> {
        let mut rx = self.loaded_version.subscribe();
        rx.wait_for(|loaded| *loaded >= version)
            .await
            .map(|_| ())
            .map_err(|_| Error::Internal("current version channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plan_and_current() {
        let view = InMemoryClusterView::new();
        view.set_planned("db", "42", "s1", vec!["L".into(), "F".into()]).await;

        let planned = view.planned_servers("db", "42", "s1").await.unwrap();
        assert_eq!(planned, vec!["L".to_string(), "F".to_string()]);
        assert!(view.current_servers("db", "42", "s1").await.unwrap().is_empty());
        assert!(view.planned_servers("db", "42", "s2").await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_current_version() {
        let view = std::sync::Arc::new(InMemoryClusterView::new());
        let waiter = {
            let view = view.clone();
            tokio::spawn(async move { view.wait_for_current_version(3).await })
        };

        view.publish_current_version(3).await;
        waiter.await.unwrap().unwrap();
        assert_eq!(view.fetch_current_version(Duration::from_secs(1)).await.unwrap(), 3);
    }
}
