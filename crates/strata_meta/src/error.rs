//! Typed errors surfaced by the metadata core.
//!
//! Collaborator seams and infrastructure use `anyhow`; anything a client or an
//! administrator can observe is mapped to a `MetaError` with a stable code.

use std::net::SocketAddr;

use crate::job::{JobId, JobState, TaskId, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("statement forwarded too many times ({forward_times} >= {max_forward_times})")]
    ForwardTooManyTimes {
        forward_times: u32,
        max_forward_times: u32,
    },

    #[error("leader address is unknown")]
    LeaderUnknown,

    #[error("forward to leader {leader} failed: {source:#}")]
    ForwardTransport {
        leader: SocketAddr,
        #[source]
        source: anyhow::Error,
    },

    #[error("forward to leader {leader} timed out after {timeout_ms}ms")]
    ForwardTimeout { leader: SocketAddr, timeout_ms: u64 },

    #[error("leader failed to execute forwarded statement: {0}")]
    LeaderExecution(String),

    /// An error raised by a node further along the forward chain.
    #[error("forwarded statement rejected [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("unknown warehouse {0}")]
    UnknownWarehouse(String),

    #[error("this node is not the leader")]
    NotLeader,

    #[error("alter job {0} does not exist")]
    JobNotFound(JobId),

    #[error("alter job {job_id} is already {state:?}")]
    JobNotActive { job_id: JobId, state: JobState },

    #[error("alter job {job_id} has no task {task_id}")]
    TaskNotFound { job_id: JobId, task_id: TaskId },

    #[error("task {task_id} of alter job {job_id} already finished as {state:?}")]
    TaskAlreadyFinished {
        job_id: JobId,
        task_id: TaskId,
        state: TaskState,
    },

    #[error("alter job {job_id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("replay of alter job {job_id} rejected: {reason}")]
    ReplayMismatch { job_id: JobId, reason: String },

    #[error("scheduler is shut down")]
    SchedulerClosed,

    #[error("job snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MetaError {
    /// Stable, user-visible error code.
    pub fn code(&self) -> &str {
        match self {
            MetaError::ForwardTooManyTimes { .. } => "ERR_FORWARD_TOO_MANY_TIMES",
            MetaError::LeaderUnknown => "ERR_LEADER_UNKNOWN",
            MetaError::ForwardTransport { .. } | MetaError::ForwardTimeout { .. } => {
                "ERR_FORWARD_FAILED"
            }
            MetaError::LeaderExecution(_) => "ERR_LEADER_EXECUTION",
            MetaError::Remote { code, .. } => code,
            MetaError::UnknownWarehouse(_) => "ERR_UNKNOWN_WAREHOUSE",
            MetaError::NotLeader => "ERR_NOT_LEADER",
            MetaError::JobNotFound(_) => "ERR_ALTER_JOB_NOT_FOUND",
            MetaError::JobNotActive { .. } => "ERR_ALTER_JOB_NOT_ACTIVE",
            MetaError::TaskNotFound { .. } => "ERR_OPTIMIZE_TASK_NOT_FOUND",
            MetaError::TaskAlreadyFinished { .. } => "ERR_OPTIMIZE_TASK_FINISHED",
            MetaError::IllegalTransition { .. } => "ERR_ILLEGAL_JOB_TRANSITION",
            MetaError::ReplayMismatch { .. } => "ERR_REPLAY_MISMATCH",
            MetaError::SchedulerClosed => "ERR_SCHEDULER_CLOSED",
            MetaError::Codec(_) => "ERR_SNAPSHOT_CODEC",
            MetaError::Internal(_) => "ERR_INTERNAL",
        }
    }

    /// Message as relayed over the forward wire, without local decoration.
    pub fn wire_message(&self) -> String {
        match self {
            MetaError::LeaderExecution(message) | MetaError::Remote { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from a remote node.
    pub fn from_wire(code: String, message: String) -> Self {
        if code == "ERR_LEADER_EXECUTION" {
            MetaError::LeaderExecution(message)
        } else {
            MetaError::Remote { code, message }
        }
    }
}

pub type Result<T, E = MetaError> = std::result::Result<T, E>;
