use serde::{Deserialize, Serialize};
use strata_log::NodeId;

use crate::error::{MetaError, Result};
use crate::job::JobId;

pub type TaskId = u64;
pub type TabletId = u64;
pub type PartitionId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed)
    }
}

/// A tablet and the nodes holding its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletPlacement {
    pub tablet_id: TabletId,
    pub replicas: Vec<NodeId>,
}

/// Per-partition unit of work of an optimize job.
///
/// Once a task reaches `Success` or `Failed` it never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeTask {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub partition_id: PartitionId,
    pub partition_name: String,
    #[serde(default)]
    pub tablets: Vec<TabletPlacement>,
    state: TaskState,
    #[serde(default)]
    query_id: Option<String>,
    #[serde(default)]
    dispatched_unix_ms: u64,
    #[serde(default)]
    finished_unix_ms: u64,
    #[serde(default)]
    message: String,
}

impl OptimizeTask {
    pub fn new(
        task_id: TaskId,
        job_id: JobId,
        partition_id: PartitionId,
        partition_name: impl Into<String>,
        tablets: Vec<TabletPlacement>,
    ) -> Self {
        Self {
            task_id,
            job_id,
            partition_id,
            partition_name: partition_name.into(),
            tablets,
            state: TaskState::Pending,
            query_id: None,
            dispatched_unix_ms: 0,
            finished_unix_ms: 0,
            message: String::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Id of the most recent dispatch, also the key of its run-history record.
    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn dispatched_unix_ms(&self) -> u64 {
        self.dispatched_unix_ms
    }

    pub fn finished_unix_ms(&self) -> u64 {
        self.finished_unix_ms
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn mark_dispatched(&mut self, query_id: String, now_unix_ms: u64) {
        debug_assert!(!self.state.is_terminal());
        self.state = TaskState::Running;
        self.query_id = Some(query_id);
        self.dispatched_unix_ms = now_unix_ms;
    }

    pub(crate) fn finish(
        &mut self,
        state: TaskState,
        message: impl Into<String>,
        now_unix_ms: u64,
    ) -> Result<()> {
        if self.state.is_terminal() {
            return Err(MetaError::TaskAlreadyFinished {
                job_id: self.job_id,
                task_id: self.task_id,
                state: self.state,
            });
        }
        debug_assert!(state.is_terminal());
        self.state = state;
        self.message = message.into();
        self.finished_unix_ms = now_unix_ms;
        Ok(())
    }
}

/// Terminal outcome of a task, reported by the executor that ran it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default)]
    pub message: String,
}

impl TaskReport {
    pub fn success(job_id: JobId, task_id: TaskId) -> Self {
        Self {
            job_id,
            task_id,
            state: TaskState::Success,
            message: String::new(),
        }
    }

    pub fn failed(job_id: JobId, task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            job_id,
            task_id,
            state: TaskState::Failed,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_task_is_immutable() {
        let mut task = OptimizeTask::new(1, 7, 100, "p1", Vec::new());
        task.mark_dispatched("q-1".to_string(), 10);
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(task.query_id(), Some("q-1"));

        task.finish(TaskState::Failed, "disk full", 20).unwrap();
        let err = task.finish(TaskState::Success, "", 30).unwrap_err();
        assert!(matches!(
            err,
            MetaError::TaskAlreadyFinished {
                job_id: 7,
                task_id: 1,
                state: TaskState::Failed
            }
        ));
        assert_eq!(task.message(), "disk full");
        assert_eq!(task.finished_unix_ms(), 20);
    }

    #[test]
    fn legacy_task_without_optional_fields_decodes() {
        let raw = r#"{"task_id":3,"job_id":9,"partition_id":4,"partition_name":"p4","state":"PENDING"}"#;
        let task: OptimizeTask = serde_json::from_str(raw).unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        assert!(task.tablets.is_empty());
        assert_eq!(task.query_id(), None);
    }
}
