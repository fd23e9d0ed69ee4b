//! Alter (schema-mutation) jobs and their lifecycle.
//!
//! ```text
//! PENDING -> WAITING_TXN -> RUNNING -> FINISHED
//!    \___________\______________\____> CANCELLED
//! ```
//!
//! A job is only ever mutated by the scheduler that owns it. Every committed
//! transition yields a serialized `JobRecord`, which is appended to the
//! replicated log and replayed into the `JobStore` on every node.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

mod env;
mod optimize;
mod task;

pub use env::{JobEnv, ReplicaPlacement, ReplicaState, TableCatalog, TaskDispatcher, TxnOracle};
pub use optimize::{OptimizeJob, OptimizeJobSpec, PartitionSpec};
pub use task::{OptimizeTask, PartitionId, TabletId, TabletPlacement, TaskId, TaskReport, TaskState};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    WaitingTxn,
    Running,
    Finished,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Cancelled)
    }

    /// States persisted as "stable"; the others are active scheduling states.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Finished | JobState::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::WaitingTxn => 1,
            JobState::Running => 2,
            JobState::Finished | JobState::Cancelled => 3,
        }
    }

    /// Transitions a live job may take.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::WaitingTxn)
            | (JobState::WaitingTxn, JobState::Running)
            | (JobState::Running, JobState::Finished) => true,
            (from, JobState::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Transitions replay accepts: the same state again, or any forward move
    /// out of a non-terminal state (a follower may see a job for the first
    /// time mid-flight).
    pub fn can_replay_to(self, next: JobState) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Identity of the table a job mutates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTarget {
    pub job_id: JobId,
    pub db_id: u64,
    pub table_id: u64,
    pub table_name: String,
}

/// Result of one scheduler step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Preconditions not met yet; nothing changed. Retried on the next tick.
    NotReady,
    /// A transition was committed; carries the encoded snapshot to replicate.
    Advanced(Bytes),
    /// A fatal condition; the scheduler must cancel the job with this reason.
    Aborted(String),
}

/// The step contract shared by every job kind.
pub trait AlterJob: Send + Sync + fmt::Debug {
    fn job_id(&self) -> JobId;
    fn state(&self) -> JobState;
    fn target(&self) -> JobTarget;

    fn run_pending(&mut self, env: &JobEnv) -> Result<StepOutcome>;
    fn run_waiting_txn(&mut self, env: &JobEnv) -> Result<StepOutcome>;
    fn run_running(&mut self, env: &JobEnv) -> Result<StepOutcome>;

    /// Cancel a live job. Returns the snapshot to replicate, or `None` when the
    /// job was already terminal.
    fn cancel(&mut self, reason: &str, env: &JobEnv) -> Result<Option<Bytes>>;

    /// Record the terminal outcome of one task and return the updated task.
    fn apply_task_report(&mut self, report: &TaskReport) -> Result<OptimizeTask>;

    /// Re-attach side effects after a leader takes the job over from the log.
    fn resume(&mut self, env: &JobEnv) -> Result<Option<Bytes>>;

    fn is_timed_out(&self, now_unix_ms: u64) -> bool;

    fn record(&self) -> JobRecord;

    fn snapshot(&self) -> Result<Bytes> {
        self.record().encode()
    }

    /// Run the step matching the current state.
    fn run(&mut self, env: &JobEnv) -> Result<StepOutcome> {
        match self.state() {
            JobState::Pending => self.run_pending(env),
            JobState::WaitingTxn => self.run_waiting_txn(env),
            JobState::Running => self.run_running(env),
            JobState::Finished | JobState::Cancelled => Ok(StepOutcome::NotReady),
        }
    }
}

/// Persisted form of a job: the closed set of job kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRecord {
    Optimize(OptimizeJob),
}

impl JobRecord {
    pub fn job_id(&self) -> JobId {
        match self {
            JobRecord::Optimize(job) => job.job_id(),
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            JobRecord::Optimize(job) => job.state(),
        }
    }

    pub fn target(&self) -> JobTarget {
        match self {
            JobRecord::Optimize(job) => job.target(),
        }
    }

    pub fn failure_msg(&self) -> &str {
        match self {
            JobRecord::Optimize(job) => job.failure_msg(),
        }
    }

    pub fn created_unix_ms(&self) -> u64 {
        match self {
            JobRecord::Optimize(job) => job.created_unix_ms(),
        }
    }

    pub fn finished_unix_ms(&self) -> u64 {
        match self {
            JobRecord::Optimize(job) => job.finished_unix_ms(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobRecord::Optimize(_) => "optimize",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn into_job(self) -> Box<dyn AlterJob> {
        match self {
            JobRecord::Optimize(job) => Box::new(job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::WaitingTxn,
        JobState::Running,
        JobState::Finished,
        JobState::Cancelled,
    ];

    #[test]
    fn only_documented_transitions_are_allowed() {
        let allowed = [
            (JobState::Pending, JobState::WaitingTxn),
            (JobState::WaitingTxn, JobState::Running),
            (JobState::Running, JobState::Finished),
            (JobState::Pending, JobState::Cancelled),
            (JobState::WaitingTxn, JobState::Cancelled),
            (JobState::Running, JobState::Cancelled),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn replay_rejects_regressions_and_terminal_rewrites() {
        assert!(JobState::Pending.can_replay_to(JobState::Pending));
        assert!(JobState::Pending.can_replay_to(JobState::Finished));
        assert!(JobState::WaitingTxn.can_replay_to(JobState::Cancelled));
        assert!(JobState::Finished.can_replay_to(JobState::Finished));

        assert!(!JobState::Running.can_replay_to(JobState::Pending));
        assert!(!JobState::Finished.can_replay_to(JobState::Cancelled));
        assert!(!JobState::Cancelled.can_replay_to(JobState::Running));
    }

    #[test]
    fn stable_states() {
        let stable: Vec<_> = ALL.into_iter().filter(|s| s.is_stable()).collect();
        assert_eq!(
            stable,
            vec![JobState::Pending, JobState::Finished, JobState::Cancelled]
        );
    }
}
