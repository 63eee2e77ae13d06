//! Wait until the leader has created the shard and is serving it.

use super::ShardSynchronizer;
use crate::error::{Error, Result};

/// Outcome of one look at the cluster metadata
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Proceed,
    Wait,
    Cancel(String),
}

/// Decide what to do given the planned and current servers of a shard
pub(crate) fn assess(
    planned: &[String],
    current: &[String],
    leader: &str,
    ourselves: &str,
    forced_resync: bool,
) -> Readiness {
    if !planned.iter().any(|s| s == ourselves) || planned.first().map(String::as_str) != Some(leader) {
        return Readiness::Cancel("cancelled".into());
    }

    match current.first() {
        None => Readiness::Wait,
        Some(first) if first == leader => {
            if !current.iter().any(|s| s == ourselves) {
                Readiness::Proceed
            } else if forced_resync {
                // We may have been gone briefly without the leader noticing
                tracing::debug!("Found ourselves in Current, but resyncing anyway because of a recent restart");
                Readiness::Proceed
            } else {
                Readiness::Cancel("already done".into())
            }
        }
        Some(_) => Readiness::Cancel("Planned leader has not taken over leadership".into()),
    }
}

impl ShardSynchronizer {
    /// Poll the cluster metadata until synchronization can start.
    /// Every non-proceed outcome is terminal for this attempt.
    pub(super) async fn wait_for_leader(&self) -> Result<()> {
        let job = &self.job;
        loop {
            if self.env.shutdown.is_cancelled() {
                return Err(Error::ShuttingDown);
            }

            let readiness = match self
                .env
                .cluster
                .planned_servers(&job.database, &job.plan_id, &job.shard)
                .await
            {
                Ok(planned) => {
                    let current = self
                        .env
                        .cluster
                        .current_servers(&job.database, &job.plan_id, &job.shard)
                        .await?;
                    assess(&planned, &current, &job.leader, &self.env.server_id, job.forced_resync)
                }
                Err(e) => {
                    tracing::debug!("SynchronizeShard: shard lookup in plan failed: {}", e);
                    Readiness::Cancel("cancelled".into())
                }
            };

            match readiness {
                Readiness::Proceed => return Ok(()),
                Readiness::Cancel(reason) => {
                    let msg = format!("{}, {}", reason, self.shard_info());
                    tracing::debug!("SynchronizeShard: {}", msg);
                    return Err(Error::PlanChanged(msg));
                }
                Readiness::Wait => {
                    tracing::debug!(
                        "SynchronizeShard: waiting for leader, {}/{}, {}/{}",
                        job.database, job.shard, job.database, job.plan_id
                    );
                }
            }

            tokio::time::sleep(self.env.settings.readiness_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(list: &[&str]) -> Vec<String> {
        list.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_proceed_when_leader_serves_and_we_are_absent() {
        assert_eq!(assess(&s(&["L", "F"]), &s(&["L"]), "L", "F", false), Readiness::Proceed);
    }

    #[test]
    fn test_wait_while_current_is_empty() {
        assert_eq!(assess(&s(&["L", "F"]), &[], "L", "F", false), Readiness::Wait);
    }

    #[test]
    fn test_already_in_current() {
        assert_eq!(
            assess(&s(&["L", "F"]), &s(&["L", "F"]), "L", "F", false),
            Readiness::Cancel("already done".into())
        );
        assert_eq!(assess(&s(&["L", "F"]), &s(&["L", "F"]), "L", "F", true), Readiness::Proceed);
    }

    #[test]
    fn test_plan_mismatch() {
        assert!(matches!(assess(&s(&["L", "G"]), &s(&["L"]), "L", "F", false), Readiness::Cancel(_)));
        assert!(matches!(assess(&s(&["M", "F"]), &s(&["M"]), "L", "F", false), Readiness::Cancel(_)));
    }

    #[test]
    fn test_planned_leader_not_yet_leading() {
        assert_eq!(
            assess(&s(&["L", "F"]), &s(&["M", "L"]), "L", "F", false),
            Readiness::Cancel("Planned leader has not taken over leadership".into())
        );
    }
}
