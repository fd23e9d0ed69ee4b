//! Rebuilds job bookkeeping from replicated snapshots.
//!
//! Every node, the leader included, routes committed log entries through
//! `JobReplayEngine`. Replay never calls a job collaborator.

use strata_log::{LogEntry, LogIndex, StateMachine};
use tokio::sync::watch;

use crate::error::Result;
use crate::job::JobRecord;
use crate::job_store::JobStore;

/// Merge `snapshot` into the follower's current view of the same job.
///
/// Re-applying a snapshot is a no-op; regressions and rewrites of a terminal
/// job are rejected.
pub fn replay(existing: Option<&JobRecord>, snapshot: JobRecord) -> Result<JobRecord> {
    match (existing, snapshot) {
        (None, snapshot) => Ok(snapshot),
        (Some(JobRecord::Optimize(current)), JobRecord::Optimize(next)) => {
            let mut job = current.clone();
            job.replay(&next)?;
            Ok(JobRecord::Optimize(job))
        }
    }
}

pub struct JobReplayEngine {
    store: JobStore,
    applied: watch::Sender<LogIndex>,
}

impl JobReplayEngine {
    pub fn new(store: JobStore) -> Self {
        let (applied, _) = watch::channel(0);
        Self { store, applied }
    }

    pub fn store(&self) -> JobStore {
        self.store.clone()
    }

    /// Index of the last log entry applied to the store.
    pub fn applied_index(&self) -> LogIndex {
        *self.applied.borrow()
    }

    /// Resolve once every entry up to `index` has been applied.
    pub async fn wait_applied(&self, index: LogIndex) {
        let mut applied = self.applied.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = applied.wait_for(|applied| *applied >= index).await;
    }

    /// Decode a snapshot and publish the merged job.
    pub fn apply_snapshot(&self, data: &[u8]) -> Result<JobRecord> {
        let snapshot = JobRecord::decode(data)?;
        let job_id = snapshot.job_id();
        self.store.update(job_id, |existing| replay(existing, snapshot))
    }
}

impl StateMachine for JobReplayEngine {
    fn apply(&self, entry: &LogEntry) -> anyhow::Result<()> {
        match self.apply_snapshot(&entry.payload) {
            Ok(record) => {
                tracing::debug!(
                    index = entry.index,
                    job_id = record.job_id(),
                    state = ?record.state(),
                    "replayed alter job snapshot"
                );
            }
            Err(err) => {
                tracing::error!(index = entry.index, error = %err, code = err.code(), "alter job replay failed");
                return Err(err.into());
            }
        }
        self.applied.send_replace(entry.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AlterJob, JobState, OptimizeJob};

    fn entry(index: LogIndex, record: &JobRecord) -> LogEntry {
        LogEntry {
            index,
            appended_unix_ms: 0,
            payload: record.encode().unwrap().to_vec(),
        }
    }

    #[test]
    fn replay_is_idempotent() {
        let target = JobRecord::Optimize(OptimizeJob::new(1, 10, 20, "orders", 1_000));
        let snapshot = target.clone();

        let once = replay(Some(&target), snapshot.clone()).unwrap();
        let twice = replay(Some(&once), snapshot).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn engine_publishes_and_tracks_applied_index() {
        let engine = JobReplayEngine::new(JobStore::new());
        let mut job = OptimizeJob::new(7, 10, 20, "orders", 1_000);
        engine.apply(&entry(1, &job.record())).unwrap();
        assert_eq!(engine.applied_index(), 1);
        assert_eq!(engine.store().get(7), Some(job.record()));

        let env = crate::local::LocalCluster::default().env();
        job.cancel("dropped by admin", &env).unwrap();
        engine.apply(&entry(2, &job.record())).unwrap();
        let stored = engine.store().get(7).unwrap();
        assert_eq!(stored.state(), JobState::Cancelled);
        assert_eq!(stored.failure_msg(), "dropped by admin");
        assert_eq!(engine.applied_index(), 2);
    }

    #[test]
    fn terminal_job_rejects_later_snapshot() {
        let engine = JobReplayEngine::new(JobStore::new());
        let env = crate::local::LocalCluster::default().env();
        let pending = OptimizeJob::new(7, 10, 20, "orders", 1_000);
        let mut cancelled = pending.clone();
        cancelled.cancel("timeout", &env).unwrap();

        engine.apply(&entry(1, &cancelled.record())).unwrap();
        let err = engine.apply(&entry(2, &pending.record())).unwrap_err();
        assert!(format!("{err:#}").contains("replay of alter job 7 rejected"));
        assert_eq!(engine.applied_index(), 1);
        assert_eq!(engine.store().get(7).unwrap().state(), JobState::Cancelled);
    }

    #[test]
    fn undecodable_entry_fails_loudly() {
        let engine = JobReplayEngine::new(JobStore::new());
        let bad = LogEntry {
            index: 1,
            appended_unix_ms: 0,
            payload: b"{\"kind\":\"rollup\"}".to_vec(),
        };
        assert!(engine.apply(&bad).is_err());
        assert!(engine.store().is_empty());
    }
}
