//! Local Replication Collaborators
//!
//! The synchronizer drives, but does not implement, the bulk copy and
//! the WAL tailing. Both receive a `SyncContext` which they poll between
//! internal steps to learn whether to give up.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::{is_planned_follower, ClusterMetadataView};
use crate::error::{Error, Result};
use crate::job::{SyncerId, Tick};

/// Why a long-running syncer call should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Shutdown,
    DeadlineExceeded,
    NoLongerPlanned,
}

impl From<AbortReason> for Error {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Shutdown => Error::ShuttingDown,
            AbortReason::DeadlineExceeded => Error::AttemptTimeout,
            AbortReason::NoLongerPlanned => {
                Error::PlanChanged("not planned as follower anymore".into())
            }
        }
    }
}

#[derive(Clone)]
struct PlanCheck {
    cluster: Arc<dyn ClusterMetadataView>,
    database: String,
    plan_id: String,
    shard: String,
    leader: String,
    server_id: String,
}

/// Cancellation context handed to every long-running syncer call
#[derive(Clone)]
pub struct SyncContext {
    shutdown: CancellationToken,
    deadline: Option<Instant>,
    plan: Option<PlanCheck>,
}

impl SyncContext {
    pub fn new(shutdown: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { shutdown, deadline, plan: None }
    }

    /// Additionally abort once this server is no longer a planned
    /// follower of `leader`
    pub fn with_plan_check(
        mut self,
        cluster: Arc<dyn ClusterMetadataView>,
        database: &str,
        plan_id: &str,
        shard: &str,
        leader: &str,
        server_id: &str,
    ) -> Self {
        self.plan = Some(PlanCheck {
            cluster,
            database: database.to_string(),
            plan_id: plan_id.to_string(),
            shard: shard.to_string(),
            leader: leader.to_string(),
            server_id: server_id.to_string(),
        });
        self
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Evaluate all abort conditions
    pub async fn check(&self) -> Option<AbortReason> {
        if self.is_stopping() {
            return Some(AbortReason::Shutdown);
        }
        if self.deadline_exceeded() {
            tracing::info!("Stopping sync attempt after configured timeout, a new attempt will be scheduled");
            return Some(AbortReason::DeadlineExceeded);
        }
        if let Some(plan) = &self.plan {
            let planned = plan
                .cluster
                .planned_servers(&plan.database, &plan.plan_id, &plan.shard)
                .await
                .unwrap_or_default();
            if !is_planned_follower(&planned, &plan.leader, &plan.server_id) {
                tracing::info!(
                    "Aborting sync of {}/{} because we are not planned as a follower anymore",
                    plan.database, plan.shard
                );
                return Some(AbortReason::NoLongerPlanned);
            }
        }
        None
    }

    /// The error a syncer should return when it gives up because of
    /// this context, if any abort condition holds
    pub async fn abort_error(&self) -> Option<Error> {
        self.check().await.map(Error::from)
    }
}

/// Configuration for one bulk copy
#[derive(Debug, Clone)]
pub struct BulkSyncRequest {
    pub endpoint: String,
    pub database: String,
    /// Leader id without following term
    pub leader_id: String,
    /// Incremental (keyed diff) rather than full copy
    pub incremental: bool,
    pub restrict_collections: Vec<String>,
    pub include_system: bool,
    pub skip_create_drop: bool,
    pub client_info: String,
}

/// Result of a successful bulk copy
#[derive(Debug, Clone, Default)]
pub struct BulkSyncOutcome {
    pub syncer_id: SyncerId,
    pub last_log_tick: Tick,
    pub processed_collections: Vec<String>,
}

/// One-shot full or incremental copy from the leader
#[async_trait::async_trait]
pub trait BulkSyncer: Send + Sync {
    async fn run(&self, request: &BulkSyncRequest, ctx: SyncContext) -> Result<BulkSyncOutcome>;
}

/// Result of a bounded catch-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpOutcome {
    pub tick_reached: Tick,
    /// Budget ran out before the end of the WAL was reached
    pub timed_out: bool,
}

/// Streams leader WAL entries into the local shard
#[async_trait::async_trait]
pub trait TailingSyncer: Send + Sync {
    /// Identity under which applied operations are accepted
    fn set_leader_id(&self, leader_id: &str);

    /// Tail from `from_tick` for at most `budget`
    async fn catch_up(
        &self,
        collection: &str,
        from_tick: Tick,
        budget: Duration,
        ctx: SyncContext,
    ) -> Result<CatchUpOutcome>;

    /// Tail from `from_tick` until `upper_bound` (or the end of the WAL)
    async fn finalize(
        &self,
        collection: &str,
        from_tick: Tick,
        upper_bound: Option<Tick>,
        ctx: SyncContext,
    ) -> Result<()>;
}

/// Local replica of a shard
#[async_trait::async_trait]
pub trait ShardCollection: Send + Sync {
    /// Cached document count
    async fn document_count(&self) -> Result<u64>;

    /// Recount by scanning, updating the cached counter
    async fn recount_documents(&self) -> Result<u64>;

    /// Set the leader identity replicated operations must carry
    async fn set_leader(&self, leader_id: &str) -> Result<()>;
}

/// Local storage: shard lookup and syncer construction
#[async_trait::async_trait]
pub trait ShardStore: Send + Sync {
    async fn lookup_shard(&self, database: &str, shard: &str) -> Result<Option<Arc<dyn ShardCollection>>>;

    fn bulk_syncer(&self, database: &str) -> Arc<dyn BulkSyncer>;

    /// Tailing syncer for `endpoint`, initially following `leader_id`
    fn tailing_syncer(&self, database: &str, endpoint: &str, leader_id: &str) -> Arc<dyn TailingSyncer>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryClusterView;

    #[tokio::test]
    async fn test_shutdown_wins() {
        let token = CancellationToken::new();
        let ctx = SyncContext::new(token.clone(), None);
        assert_eq!(ctx.check().await, None);
        token.cancel();
        assert_eq!(ctx.check().await, Some(AbortReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let ctx = SyncContext::new(
            CancellationToken::new(),
            Some(Instant::now() + Duration::from_secs(10)),
        );
        assert!(!ctx.deadline_exceeded());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(ctx.check().await, Some(AbortReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_plan_check() {
        let view = Arc::new(InMemoryClusterView::new());
        view.set_planned("db", "42", "s1", vec!["L".into(), "F".into()]).await;
        let ctx = SyncContext::new(CancellationToken::new(), None)
            .with_plan_check(view.clone(), "db", "42", "s1", "L", "F");
        assert_eq!(ctx.check().await, None);

        view.set_planned("db", "42", "s1", vec!["L".into(), "G".into()]).await;
        assert_eq!(ctx.check().await, Some(AbortReason::NoLongerPlanned));
        assert!(matches!(ctx.abort_error().await, Some(Error::PlanChanged(_))));
    }

    #[tokio::test]
    async fn test_aborts_are_not_failures() {
        for reason in [AbortReason::Shutdown, AbortReason::DeadlineExceeded, AbortReason::NoLongerPlanned] {
            assert!(!Error::from(reason).counts_as_failure(), "{:?}", reason);
        }
        let ctx = SyncContext::new(CancellationToken::new(), None);
        assert!(ctx.abort_error().await.is_none());
    }
}
