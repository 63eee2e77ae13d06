//! Shard Synchronization
//!
//! Brings a local follower replica of a shard into agreement with its
//! leader while the leader keeps accepting writes:
//!
//! 1. wait until the leader serves the shard and we are planned for it
//! 2. bulk copy (full or incremental)
//! 3. WAL catch-up in rounds, each under a soft lock on the leader
//! 4. final WAL catch-up under a hard lock, then register as follower
//! 5. on a checksum mismatch, recount locally (and on the leader)
//!
//! Every lock taken on the leader is released on every exit path.

mod catchup;
mod readiness;
mod state;


use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterMetadataView;
use crate::config::{ShardSyncConfig, SyncSettings};
use crate::error::{Error, ErrorCode, Result};
use crate::job::{FollowingTermId, Priority, ShardSyncJob, SyncProgress};
use crate::leader::{LeaderClient, LockMode, LockRequest};
use crate::maintenance::{backoff_delay, sleep_unless_stopping, MaintenanceStore};
use crate::syncer::{ShardCollection, ShardStore, SyncContext};

/// Lifecycle of a synchronization job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Running,
    Complete,
    Failed,
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionState::Running => write!(f, "RUNNING"),
            ActionState::Complete => write!(f, "COMPLETE"),
            ActionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Step of the protocol an attempt is in, used in failure messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    Backoff,
    WaitForLeader,
    Prepare,
    BulkSync,
    SoftLockCatchUp,
    HardLockFinalize,
    AddFollower,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Validate => "validating job",
            Phase::Backoff => "delaying after failures",
            Phase::WaitForLeader => "waiting for leader",
            Phase::Prepare => "preparing synchronization",
            Phase::BulkSync => "initial synchronization",
            Phase::SoftLockCatchUp => "catch-up under soft lock",
            Phase::HardLockFinalize => "finalize under hard lock",
            Phase::AddFollower => "registering as follower",
        };
        f.write_str(name)
    }
}

/// Everything a synchronizer needs besides its job. Built once by the
/// scheduler and cloned into each attempt.
#[derive(Clone)]
pub struct SyncEnvironment {
    pub server_id: String,
    pub reboot_id: u64,
    pub settings: SyncSettings,
    pub cluster: Arc<dyn ClusterMetadataView>,
    pub leader: Arc<dyn LeaderClient>,
    pub store: Arc<dyn ShardStore>,
    pub maintenance: Arc<MaintenanceStore>,
    pub shutdown: CancellationToken,
}

impl SyncEnvironment {
    pub fn from_config(
        config: &ShardSyncConfig,
        cluster: Arc<dyn ClusterMetadataView>,
        leader: Arc<dyn LeaderClient>,
        store: Arc<dyn ShardStore>,
        maintenance: Arc<MaintenanceStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            server_id: config.node.id.clone(),
            reboot_id: config.node.reboot_id,
            settings: config.settings(),
            cluster,
            leader,
            store,
            maintenance,
            shutdown,
        }
    }
}

/// Terminal report of one attempt
#[derive(Debug)]
pub struct SyncReport {
    pub state: ActionState,
    pub error: Option<Error>,
    /// Human-readable summary naming the shard and timing
    pub message: String,
    pub initial_leader_count: u64,
    pub initial_follower_count: u64,
    pub doc_count_at_end: u64,
    pub following_term: FollowingTermId,
    pub progress: SyncProgress,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.state == ActionState::Complete
    }

    /// The job was handed back to the scheduler with lower priority
    pub fn is_requeued(&self) -> bool {
        matches!(self.error, Some(Error::Requeued))
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(Error::code)
    }
}

/// Synchronizes one shard replica with its leader
pub struct ShardSynchronizer {
    job: ShardSyncJob,
    env: SyncEnvironment,
    state: ActionState,
    phase: Phase,
    progress: SyncProgress,
    following_term: FollowingTermId,
    initial_leader_count: u64,
    initial_follower_count: u64,
    doc_count_at_end: u64,
    started: DateTime<Utc>,
    /// End of the attempt, only for revision-based syncs
    deadline: Option<Instant>,
}

impl ShardSynchronizer {
    pub fn new(job: ShardSyncJob, env: SyncEnvironment) -> Self {
        Self {
            job,
            env,
            state: ActionState::Running,
            phase: Phase::Validate,
            progress: SyncProgress::default(),
            following_term: FollowingTermId::default(),
            initial_leader_count: 0,
            initial_follower_count: 0,
            doc_count_at_end: 0,
            started: Utc::now(),
            deadline: None,
        }
    }

    pub fn job(&self) -> &ShardSyncJob {
        &self.job
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    /// Run the attempt to its terminal state
    pub async fn run(mut self) -> SyncReport {
        let clock = Instant::now();
        self.started = Utc::now();

        let result = match self.job.validate() {
            Ok(()) => self.synchronize().await,
            Err(e) => {
                tracing::error!("SynchronizeShard: {}", e);
                Err(e)
            }
        };

        let state = if result.is_ok() { ActionState::Complete } else { ActionState::Failed };
        self.finish(state, result.as_ref().err()).await;

        let message = match &result {
            Ok(()) => format!("synchronization done, {}", self.shard_info()),
            Err(e) => format!("{} failed: {}, {}", self.phase, e, self.shard_info()),
        };

        SyncReport {
            state: self.state,
            error: result.err(),
            message,
            initial_leader_count: self.initial_leader_count,
            initial_follower_count: self.initial_follower_count,
            doc_count_at_end: self.doc_count_at_end,
            following_term: self.following_term,
            progress: self.progress,
            elapsed: clock.elapsed(),
        }
    }

    async fn synchronize(&mut self) -> Result<()> {
        self.phase = Phase::Backoff;
        self.delay_after_failures().await?;

        tracing::debug!(
            "SynchronizeShard: synchronizing shard '{}/{}' for central '{}/{}'",
            self.job.database, self.job.shard, self.job.database, self.job.plan_id
        );

        self.phase = Phase::WaitForLeader;
        self.wait_for_leader().await?;

        self.phase = Phase::Prepare;
        let collection = self
            .env
            .store
            .lookup_shard(&self.job.database, &self.job.shard)
            .await?
            .ok_or_else(|| {
                let msg = format!("failed to lookup local shard {}/{}", self.job.database, self.job.shard);
                tracing::error!("SynchronizeShard: {}", msg);
                Error::CollectionNotFound(msg)
            })?;
        let endpoint = self.env.cluster.server_endpoint(&self.job.leader).await?;

        self.read_initial_counts(&endpoint, &*collection).await?;
        self.check_requeue().await?;
        self.start_attempt_clock();

        tracing::debug!(
            "SynchronizeShard: trying to synchronize local shard '{}/{}' for central '{}/{}'",
            self.job.database, self.job.shard, self.job.database, self.job.plan_id
        );

        let tailing = self
            .env
            .store
            .tailing_syncer(&self.job.database, &endpoint, &self.job.leader);

        if self.env.shutdown.is_cancelled() {
            tracing::info!(
                "SynchronizeShard: synchronization failed for shard {}: shutdown in progress, giving up",
                self.job.shard
            );
            return Err(Error::ShuttingDown);
        }

        self.phase = Phase::BulkSync;
        let syncer_id = self.bulk_sync(&endpoint, &*collection).await?;

        self.phase = Phase::SoftLockCatchUp;
        self.catch_up_with_soft_lock(&endpoint, &*tailing).await?;

        if self.env.shutdown.is_cancelled() {
            tracing::info!(
                "SynchronizeShard: not taking hard lock for shard {}: shutdown in progress",
                self.job.shard
            );
            return Err(Error::ShuttingDown);
        }

        self.phase = Phase::HardLockFinalize;
        self.catch_up_with_hard_lock(&endpoint, &*collection, &*tailing, syncer_id).await
    }

    /// Step on the brake after repeated failures of this shard
    async fn delay_after_failures(&self) -> Result<()> {
        let settings = &self.env.settings;
        let failures = self.env.maintenance.failures(&self.job.database, &self.job.shard).await;
        let Some(delay) = backoff_delay(failures, settings.backoff_failure_threshold, settings.backoff_max) else {
            return Ok(());
        };

        tracing::info!(
            "SynchronizeShard: synchronizing shard '{}/{}' for central '{}/{}' encountered {} failures in a row. delaying next sync by {:.1} s",
            self.job.database, self.job.shard, self.job.database, self.job.plan_id,
            failures, delay.as_secs_f64()
        );
        sleep_unless_stopping(delay, settings.backoff_step, &self.env.shutdown).await
    }

    async fn read_initial_counts(&mut self, endpoint: &str, collection: &dyn ShardCollection) -> Result<()> {
        self.initial_leader_count = self
            .env
            .leader
            .collection_count(
                endpoint,
                &self.job.database,
                &self.job.shard,
                self.env.settings.leader_count_timeout,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    "SynchronizeShard failed to get a count on leader {}/{}: {}",
                    self.job.database, self.job.shard, e
                );
                e
            })?;

        self.initial_follower_count = collection.document_count().await.map_err(|e| {
            tracing::error!(
                "SynchronizeShard failed to get a count here {}/{}: {}",
                self.job.database, self.job.shard, e
            );
            e
        })?;
        Ok(())
    }

    /// Large jobs give way to others by running again at slow priority
    async fn check_requeue(&self) -> Result<()> {
        let diff = self.initial_leader_count.abs_diff(self.initial_follower_count);
        if self.job.priority == Priority::Slow || diff <= self.env.settings.requeue_doc_diff_threshold {
            return Ok(());
        }

        tracing::debug!(
            "SynchronizeShard found that leader's and follower's document count differ by {} (> {}), will reschedule with slow priority, database: {}, shard: {}",
            diff, self.env.settings.requeue_doc_diff_threshold, self.job.database, self.job.shard
        );
        self.env.maintenance.requeue(&self.job, Priority::Slow).await;
        Err(Error::Requeued)
    }

    /// Only the revision-based protocol makes progress in bounded time,
    /// so only it gets an attempt deadline
    fn start_attempt_clock(&mut self) {
        if self.job.sync_by_revision {
            if let Some(timeout) = self.env.settings.attempt_timeout {
                self.deadline = Some(Instant::now() + timeout);
            }
        }
    }

    fn context(&self) -> SyncContext {
        SyncContext::new(self.env.shutdown.clone(), self.deadline)
    }

    /// Context that also aborts once we are no longer a planned follower
    fn planned_context(&self) -> SyncContext {
        self.context().with_plan_check(
            self.env.cluster.clone(),
            &self.job.database,
            &self.job.plan_id,
            &self.job.shard,
            &self.job.leader,
            &self.env.server_id,
        )
    }

    /// Rebrand a failure caused by shutdown, the attempt deadline or a
    /// plan change; those are not counted as shard failures
    async fn classify_abort(&self, error: Error) -> Error {
        if !error.counts_as_failure() {
            return error;
        }
        match self.planned_context().abort_error().await {
            Some(abort) => {
                tracing::debug!(
                    "SynchronizeShard: {}/{} gave up: {} (cause: {})",
                    self.job.database, self.job.shard, abort, error
                );
                abort
            }
            None => error,
        }
    }

    fn lock_request(&self, mode: LockMode, ttl: Duration) -> LockRequest {
        LockRequest {
            database: self.job.database.clone(),
            lock_id: 0,
            collection: self.job.shard.clone(),
            ttl,
            server_id: self.env.server_id.clone(),
            client_id: self.job.client_id(),
            reboot_id: self.env.reboot_id,
            mode,
            want_following_term: true,
        }
    }

    fn shard_info(&self) -> String {
        format!(
            "local shard: '{}/{}', for central: '{}/{}', started: {}, ended: {}",
            self.job.database,
            self.job.shard,
            self.job.database,
            self.job.plan_id,
            self.started.to_rfc3339(),
            Utc::now().to_rfc3339()
        )
    }
}
