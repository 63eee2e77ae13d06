//! Terminal state transition and its side effects.

use std::time::Duration;
use tokio::time::Instant;

use super::{ActionState, ShardSynchronizer};
use crate::error::Error;

const SNOOZE_STEP: Duration = Duration::from_millis(100);
const MAX_SNOOZE: Duration = Duration::from_secs(2);

impl ShardSynchronizer {
    /// Enter a terminal state.
    ///
    /// Success wipes the shard's failure history. Failures count against
    /// the shard unless caused by the attempt deadline, shutdown or a plan
    /// change. A requeued job keeps its shard locked and skips the version
    /// bump; the rescheduled attempt takes over.
    pub(super) async fn finish(&mut self, state: ActionState, error: Option<&Error>) {
        if self.state == state {
            return;
        }
        let requeued = matches!(error, Some(Error::Requeued));
        let maintenance = self.env.maintenance.clone();

        match error {
            None => {
                tracing::info!(
                    "SynchronizeShard: synchronization completed for shard {}/{}, initial document count on leader: {}, initial document count on follower: {}, document count at end: {}",
                    self.job.database, self.job.shard,
                    self.initial_leader_count, self.initial_follower_count, self.doc_count_at_end
                );
                maintenance.clear_failures(&self.job.database, &self.job.shard).await;
            }
            Some(e) => {
                if !requeued && e.counts_as_failure() {
                    let failures = maintenance.record_failure(&self.job.database, &self.job.shard).await;
                    tracing::debug!(
                        "SynchronizeShard: {}/{} failed {} times in a row",
                        self.job.database, self.job.shard, failures
                    );
                }
                if matches!(e, Error::AttemptTimeout) {
                    maintenance.count_timed_out_attempt();
                }
            }
        }

        if !requeued {
            self.await_current_version().await;
            maintenance.inc_shard_version(&self.job.database, &self.job.shard).await;
            maintenance.unlock_shard(&self.job.database, &self.job.shard).await;
        }

        self.state = state;
    }

    /// Wait for the cluster's current version to be loaded locally. The
    /// leader bumps it before we get here, so any version will do. Gives
    /// up after the configured wait or on shutdown.
    async fn await_current_version(&self) {
        let wait = self.env.settings.current_version_wait;
        let stop_at = Instant::now() + wait;
        let mut snooze = SNOOZE_STEP;
        let mut version = 0;

        while !self.env.shutdown.is_cancelled() && Instant::now() < stop_at {
            match self.env.cluster.fetch_current_version(wait.mul_f64(0.1)).await {
                Ok(v) => version = v,
                Err(e) => tracing::error!(
                    "Failed to acquire current version while increasing shard version for shard {}/{}: {}",
                    self.job.database, self.job.shard, e
                ),
            }
            if version > 0 {
                break;
            }
            tokio::time::sleep(snooze).await;
            if snooze < MAX_SNOOZE {
                snooze += SNOOZE_STEP;
            }
        }

        if version == 0 {
            return;
        }
        let remaining = stop_at.saturating_duration_since(Instant::now());
        tokio::select! {
            res = tokio::time::timeout(remaining, self.env.cluster.wait_for_current_version(version)) => {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Waiting for current version {} failed: {}", version, e),
                    Err(_) => tracing::warn!("Timed out waiting for current version {}", version),
                }
            }
            _ = self.env.shutdown.cancelled() => {}
        }
    }
}
