//! Bulk copy, soft-lock catch-up rounds, hard-lock finalize and
//! checksum repair.

use tokio::time::Instant;

use super::{Phase, ShardSynchronizer};
use crate::error::{Error, ErrorCode, Result};
use crate::job::SyncerId;
use crate::leader::{AddFollowerRequest, LockGuard, LockMode};
use crate::syncer::{BulkSyncRequest, ShardCollection, TailingSyncer};

impl ShardSynchronizer {
    /// One-shot copy of the shard. Returns the bulk syncer's identity and
    /// records the WAL tick tailing has to start from.
    pub(super) async fn bulk_sync(&mut self, endpoint: &str, collection: &dyn ShardCollection) -> Result<SyncerId> {
        let job = &self.job;

        // Follow the leader without a term until we hold the hard lock
        collection.set_leader(&job.leader).await?;

        let request = BulkSyncRequest {
            endpoint: endpoint.to_string(),
            database: job.database.clone(),
            leader_id: job.leader.clone(),
            incremental: self.initial_follower_count > 0,
            restrict_collections: vec![job.shard.clone()],
            include_system: true,
            skip_create_drop: true,
            client_info: job.client_info(&self.env.server_id),
        };
        let ctx = self.planned_context();

        let begin = Instant::now();
        let result = self.env.store.bulk_syncer(&job.database).run(&request, ctx).await;
        let took = begin.elapsed();
        if took > self.env.settings.long_bulk_sync {
            tracing::info!(
                "SynchronizeShard: long call to bulk sync for shard {}/{}: {:.1} s",
                job.database, job.shard, took.as_secs_f64()
            );
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let e = self.classify_abort(e).await;
                tracing::debug!(
                    "SynchronizeShard: could not initially synchronize shard {}/{}: {}",
                    job.database, job.shard, e
                );
                return Err(e);
            }
        };

        if outcome.processed_collections.first() != Some(&job.shard) {
            tracing::warn!(
                "SynchronizeShard: shard {}/{} seems to be gone from leader, this can happen if a collection was dropped during synchronization!",
                job.database, job.shard
            );
            return Err(Error::ShardVanished {
                database: job.database.clone(),
                shard: job.shard.clone(),
            });
        }

        self.progress.last_log_tick = outcome.last_log_tick;
        Ok(outcome.syncer_id)
    }

    /// Tail the WAL in rounds, each under a soft lock on the leader,
    /// until a round reaches the end of the WAL within its budget.
    /// Running out of rounds is not fatal; the hard lock phase follows
    /// either way.
    pub(super) async fn catch_up_with_soft_lock(&mut self, endpoint: &str, tailing: &dyn TailingSyncer) -> Result<()> {
        let settings = self.env.settings.clone();
        let budget = settings.soft_catch_up_budget();
        let mut timed_out = true;
        let mut rounds = 0;

        while timed_out && rounds < settings.soft_lock_max_rounds {
            rounds += 1;
            if self.env.shutdown.is_cancelled() {
                tracing::info!("SynchronizeShard: startReadLockOnLeader (soft): shutting down");
                return Err(Error::ShuttingDown);
            }

            tracing::debug!(
                "SynchronizeShard: soft lock round {} on {} for {}/{}",
                rounds, endpoint, self.job.database, self.job.shard
            );
            let acquired = LockGuard::acquire(
                self.env.leader.clone(),
                endpoint,
                self.lock_request(LockMode::Soft, settings.soft_lock_timeout),
                settings.soft_lock_timeout,
                settings.cancel_lock_timeout,
            )
            .await;
            let guard = match acquired {
                Ok(guard) => guard,
                Err(e) => {
                    let e = self.classify_abort(e).await;
                    tracing::info!("SynchronizeShard: error in startReadLockOnLeader (soft): {}", e);
                    return Err(e);
                }
            };

            let catch_up = tailing
                .catch_up(&self.job.shard, self.progress.last_log_tick, budget, self.context())
                .await;
            let outcome = match catch_up {
                Ok(outcome) => outcome,
                Err(e) => {
                    guard.release_quietly().await;
                    let e = self.classify_abort(e).await;
                    tracing::info!(
                        "SynchronizeShard: error in catch-up for shard {}/{}: {}",
                        self.job.database, self.job.shard, e
                    );
                    return Err(e);
                }
            };

            guard.release().await.map_err(|e| {
                tracing::info!("SynchronizeShard: error when cancelling soft read lock: {}", e);
                e
            })?;

            self.progress.advance(outcome.tick_reached);
            timed_out = outcome.timed_out;
            if timed_out {
                tracing::info!(
                    "Renewing soft lock for {} on leader: {}",
                    self.job.shard, self.job.leader
                );
            }
        }

        if timed_out {
            tracing::warn!(
                "Could not catch up under soft lock for {} on leader: {}, now activating hard lock. This is expected under high load.",
                self.job.shard, self.job.leader
            );
        }
        Ok(())
    }

    /// Stop writes on the leader, tail the rest of the WAL and register
    /// as follower. The hard lock is released exactly once on every path.
    pub(super) async fn catch_up_with_hard_lock(
        &mut self,
        endpoint: &str,
        collection: &dyn ShardCollection,
        tailing: &dyn TailingSyncer,
        syncer_id: SyncerId,
    ) -> Result<()> {
        debug_assert!(self.progress.tailing_upper_bound_tick.is_none());
        let settings = self.env.settings.clone();

        tracing::debug!(
            "SynchronizeShard: startReadLockOnLeader (hard): {} {}/{}",
            endpoint, self.job.database, self.job.shard
        );
        let acquired = LockGuard::acquire(
            self.env.leader.clone(),
            endpoint,
            self.lock_request(LockMode::Hard, settings.hard_lock_timeout),
            settings.hard_lock_timeout,
            settings.cancel_lock_timeout,
        )
        .await;
        let guard = match acquired {
            Ok(guard) => guard,
            Err(e) => {
                let e = self.classify_abort(e).await;
                tracing::info!("SynchronizeShard: error in startReadLockOnLeader (hard): {}", e);
                return Err(e);
            }
        };

        self.following_term = guard.grant().following_term();
        self.progress.tailing_upper_bound_tick = guard.grant().last_log_tick;

        let result = self
            .finalize_and_register(endpoint, collection, tailing, syncer_id, guard.lock_id())
            .await;
        guard.release_quietly().await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    "SynchronizeShard: synchronization worked for shard {}",
                    self.job.shard
                );
                Ok(())
            }
            // Only the leader's answer to add-follower is a count mismatch
            Err(e) if self.phase == Phase::AddFollower && e.code() == ErrorCode::WrongChecksum => {
                let e = match e {
                    Error::ChecksumMismatch(_) => e,
                    other => Error::ChecksumMismatch(other.to_string()),
                };
                // The lock is already gone; the attempt fails regardless
                self.repair_checksum(endpoint, collection).await?;
                Err(e)
            }
            Err(e) => {
                tracing::info!(
                    "SynchronizeShard: {} for {}/{} failed: {}",
                    self.phase, self.job.database, self.job.shard, e
                );
                Err(e)
            }
        }
    }

    async fn finalize_and_register(
        &mut self,
        endpoint: &str,
        collection: &dyn ShardCollection,
        tailing: &dyn TailingSyncer,
        syncer_id: SyncerId,
        lock_id: u64,
    ) -> Result<()> {
        // Accept replication from this leader term only from now on
        let leader_id = self.following_term.leader_id(&self.job.leader);
        collection.set_leader(&leader_id).await?;
        tailing.set_leader_id(&leader_id);
        tracing::debug!("SynchronizeShard: following {} under lock {}", leader_id, lock_id);

        let finalized = tailing
            .finalize(
                &self.job.shard,
                self.progress.last_log_tick,
                self.progress.tailing_upper_bound_tick,
                self.context(),
            )
            .await;
        if let Err(e) = finalized {
            return Err(self.classify_abort(e).await);
        }

        self.phase = Phase::AddFollower;
        let checksum = collection.document_count().await?;
        self.doc_count_at_end = checksum;

        tracing::debug!(
            "SynchronizeShard: tell the leader to put us into the follower list for {}/{}",
            self.job.database, self.job.shard
        );
        let request = AddFollowerRequest {
            database: self.job.database.clone(),
            follower_id: self.env.server_id.clone(),
            shard: self.job.shard.clone(),
            checksum,
            syncer_id,
            client_id: self.job.client_id(),
            client_info: self.job.client_info(&self.env.server_id),
            lock_id,
        };
        self.env
            .leader
            .add_follower(endpoint, &request, self.env.settings.add_follower_timeout)
            .await
            .map_err(|e| {
                tracing::warn!(
                    "SynchronizeShard: could not add us to the leader's follower list for {}/{}: {}",
                    self.job.database, self.job.shard, e
                );
                e
            })
    }

    /// Counts on leader and follower disagree. Recount locally, and if
    /// that changes nothing, ask the leader to recount too, so that the
    /// next attempt starts from corrected counts.
    async fn repair_checksum(&mut self, endpoint: &str, collection: &dyn ShardCollection) -> Result<()> {
        self.env.maintenance.count_wrong_checksum();
        let (database, shard) = (&self.job.database, &self.job.shard);

        tracing::info!("Recalculating collection count on follower for {}/{}", database, shard);
        let old_count = collection.document_count().await?;
        let new_count = collection.recount_documents().await?;
        tracing::info!(
            "Recalculated collection count on follower for {}/{}, old: {}, new: {}",
            database, shard, old_count, new_count
        );

        if old_count != new_count {
            return Ok(());
        }

        tracing::info!("Recalculating collection count on leader for {}/{}", database, shard);
        match self
            .env
            .leader
            .recalculate_count(endpoint, database, shard, self.env.settings.leader_recount_timeout)
            .await
        {
            Ok(count) => tracing::debug!("Leader's shard count response is {}", count),
            Err(e) => tracing::warn!(
                "Error while recalculating count on leader for {}/{}: {}",
                database, shard, e
            ),
        }
        Ok(())
    }
}
