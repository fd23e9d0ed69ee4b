//! Online optimize: rewrite a table's partitions without blocking writers.

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_log::unix_time_ms;
use uuid::Uuid;

use crate::error::{MetaError, Result};
use crate::job::{
    AlterJob, JobEnv, JobId, JobRecord, JobState, JobTarget, OptimizeTask, PartitionId,
    StepOutcome, TabletPlacement, TaskId, TaskReport, TaskState,
};

/// One partition to rewrite, with the placement of its tablets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub partition_id: PartitionId,
    pub partition_name: String,
    #[serde(default)]
    pub tablets: Vec<TabletPlacement>,
}

/// What a client submits; the leader assigns the job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeJobSpec {
    pub db_id: u64,
    pub table_id: u64,
    pub table_name: String,
    pub partitions: Vec<PartitionSpec>,
    /// Overrides the scheduler's default job timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeJob {
    job_id: JobId,
    db_id: u64,
    table_id: u64,
    table_name: String,
    state: JobState,
    created_unix_ms: u64,
    #[serde(default)]
    finished_unix_ms: u64,
    timeout_ms: u64,
    #[serde(default)]
    failure_msg: String,
    #[serde(default)]
    watershed_txn_id: Option<u64>,
    #[serde(default)]
    tasks: Vec<OptimizeTask>,
}

impl OptimizeJob {
    pub fn new(
        job_id: JobId,
        db_id: u64,
        table_id: u64,
        table_name: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            job_id,
            db_id,
            table_id,
            table_name: table_name.into(),
            state: JobState::Pending,
            created_unix_ms: unix_time_ms(),
            finished_unix_ms: 0,
            timeout_ms,
            failure_msg: String::new(),
            watershed_txn_id: None,
            tasks: Vec::new(),
        }
    }

    /// Build a job with one task per partition. Task ids start at 1.
    pub fn from_spec(job_id: JobId, spec: OptimizeJobSpec, default_timeout_ms: u64) -> Self {
        let timeout_ms = spec.timeout_ms.unwrap_or(default_timeout_ms);
        let mut job = Self::new(job_id, spec.db_id, spec.table_id, spec.table_name, timeout_ms);
        job.tasks = spec
            .partitions
            .into_iter()
            .enumerate()
            .map(|(idx, partition)| {
                OptimizeTask::new(
                    idx as TaskId + 1,
                    job_id,
                    partition.partition_id,
                    partition.partition_name,
                    partition.tablets,
                )
            })
            .collect();
        job
    }

    pub fn db_id(&self) -> u64 {
        self.db_id
    }

    pub fn table_id(&self) -> u64 {
        self.table_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn created_unix_ms(&self) -> u64 {
        self.created_unix_ms
    }

    pub fn finished_unix_ms(&self) -> u64 {
        self.finished_unix_ms
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn failure_msg(&self) -> &str {
        &self.failure_msg
    }

    pub fn watershed_txn_id(&self) -> Option<u64> {
        self.watershed_txn_id
    }

    pub fn tasks(&self) -> &[OptimizeTask] {
        &self.tasks
    }

    pub fn task(&self, task_id: TaskId) -> Option<&OptimizeTask> {
        self.tasks.iter().find(|task| task.task_id == task_id)
    }

    /// Bring this job up to date with a leader snapshot.
    ///
    /// Only bookkeeping is copied; no collaborator is called.
    pub fn replay(&mut self, snapshot: &OptimizeJob) -> Result<()> {
        if (self.job_id, self.db_id, self.table_id)
            != (snapshot.job_id, snapshot.db_id, snapshot.table_id)
        {
            return Err(MetaError::ReplayMismatch {
                job_id: self.job_id,
                reason: format!(
                    "snapshot identity {}/{}/{} does not match {}/{}/{}",
                    snapshot.job_id,
                    snapshot.db_id,
                    snapshot.table_id,
                    self.job_id,
                    self.db_id,
                    self.table_id
                ),
            });
        }
        if !self.state.can_replay_to(snapshot.state) {
            return Err(MetaError::ReplayMismatch {
                job_id: self.job_id,
                reason: format!("state {:?} cannot move to {:?}", self.state, snapshot.state),
            });
        }
        *self = snapshot.clone();
        Ok(())
    }

    fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MetaError::IllegalTransition {
                job_id: self.job_id,
                from: self.state,
                to: next,
            });
        }
        tracing::info!(
            job_id = self.job_id,
            table = %self.table_name,
            from = ?self.state,
            to = ?next,
            "optimize job state changed"
        );
        self.state = next;
        Ok(())
    }

    fn first_unstable_replica(&self, env: &JobEnv) -> Option<(u64, u64)> {
        self.tasks
            .iter()
            .flat_map(|task| task.tablets.iter())
            .flat_map(|tablet| {
                tablet
                    .replicas
                    .iter()
                    .map(move |node| (tablet.tablet_id, *node))
            })
            .find(|(tablet_id, node_id)| {
                !env.placement
                    .replica_state(*tablet_id, *node_id)
                    .is_some_and(|state| state.is_stable())
            })
    }

    fn dispatch_open_tasks(&mut self, env: &JobEnv) -> Result<()> {
        let target = self.target();
        let now = unix_time_ms();
        for task in self.tasks.iter_mut() {
            if task.state().is_terminal() {
                continue;
            }
            task.mark_dispatched(Uuid::new_v4().to_string(), now);
            if let Err(err) = env.dispatcher.dispatch(&target, task) {
                tracing::warn!(
                    error = ?err,
                    job_id = target.job_id,
                    task_id = task.task_id,
                    "optimize task dispatch failed"
                );
                task.finish(TaskState::Failed, format!("dispatch failed: {err:#}"), now)?;
            }
        }
        Ok(())
    }
}

impl AlterJob for OptimizeJob {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn state(&self) -> JobState {
        self.state
    }

    fn target(&self) -> JobTarget {
        JobTarget {
            job_id: self.job_id,
            db_id: self.db_id,
            table_id: self.table_id,
            table_name: self.table_name.clone(),
        }
    }

    fn run_pending(&mut self, env: &JobEnv) -> Result<StepOutcome> {
        if self.state != JobState::Pending {
            return Ok(StepOutcome::NotReady);
        }
        if let Some((tablet_id, node_id)) = self.first_unstable_replica(env) {
            tracing::debug!(
                job_id = self.job_id,
                tablet_id,
                node_id,
                "optimize job waiting for stable replicas"
            );
            return Ok(StepOutcome::NotReady);
        }
        let txn_id = env
            .txns
            .next_txn_id()
            .context("allocate watershed transaction id")?;
        self.watershed_txn_id = Some(txn_id);
        self.transition(JobState::WaitingTxn)?;
        Ok(StepOutcome::Advanced(self.snapshot()?))
    }

    fn run_waiting_txn(&mut self, env: &JobEnv) -> Result<StepOutcome> {
        if self.state != JobState::WaitingTxn {
            return Ok(StepOutcome::NotReady);
        }
        let Some(watershed) = self.watershed_txn_id else {
            return Ok(StepOutcome::Aborted(
                "watershed transaction id is missing".to_string(),
            ));
        };
        let visible = env
            .txns
            .previous_txns_finished(watershed, self.db_id, self.table_id)
            .context("check previous transactions")?;
        if !visible {
            tracing::debug!(
                job_id = self.job_id,
                watershed,
                "optimize job waiting for previous transactions"
            );
            return Ok(StepOutcome::NotReady);
        }
        self.dispatch_open_tasks(env)?;
        self.transition(JobState::Running)?;
        Ok(StepOutcome::Advanced(self.snapshot()?))
    }

    fn run_running(&mut self, env: &JobEnv) -> Result<StepOutcome> {
        if self.state != JobState::Running {
            return Ok(StepOutcome::NotReady);
        }
        let in_flight = self
            .tasks
            .iter()
            .filter(|task| !task.state().is_terminal())
            .count();
        if in_flight > 0 {
            tracing::debug!(job_id = self.job_id, in_flight, "optimize tasks still running");
            return Ok(StepOutcome::NotReady);
        }

        let succeeded: Vec<PartitionId> = self
            .tasks
            .iter()
            .filter(|task| task.state() == TaskState::Success)
            .map(|task| task.partition_id)
            .collect();
        if succeeded.is_empty() && !self.tasks.is_empty() {
            let reason = self
                .tasks
                .iter()
                .map(|task| format!("{}: {}", task.partition_name, task.message()))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(StepOutcome::Aborted(format!("all optimize tasks failed ({reason})")));
        }
        let failed = self.tasks.len() - succeeded.len();
        if failed > 0 {
            tracing::warn!(
                job_id = self.job_id,
                failed,
                succeeded = succeeded.len(),
                "finishing optimize job with failed tasks"
            );
        }

        if let Err(err) = env.catalog.finish_optimize(&self.target(), &succeeded) {
            return Ok(StepOutcome::Aborted(format!(
                "swap optimized partitions: {err:#}"
            )));
        }
        self.finished_unix_ms = unix_time_ms();
        self.transition(JobState::Finished)?;
        Ok(StepOutcome::Advanced(self.snapshot()?))
    }

    fn cancel(&mut self, reason: &str, env: &JobEnv) -> Result<Option<Bytes>> {
        if self.state.is_terminal() {
            return Ok(None);
        }
        if let Err(err) = env.catalog.abort_optimize(&self.target()) {
            tracing::warn!(error = ?err, job_id = self.job_id, "optimize rollback failed");
        }
        self.failure_msg = reason.to_string();
        self.finished_unix_ms = unix_time_ms();
        tracing::warn!(job_id = self.job_id, reason, "cancelling optimize job");
        self.transition(JobState::Cancelled)?;
        Ok(Some(self.snapshot()?))
    }

    fn apply_task_report(&mut self, report: &TaskReport) -> Result<OptimizeTask> {
        if self.state.is_terminal() {
            return Err(MetaError::JobNotActive {
                job_id: self.job_id,
                state: self.state,
            });
        }
        if !report.state.is_terminal() {
            return Err(anyhow::anyhow!(
                "task {} of job {} reported non-terminal state {:?}",
                report.task_id,
                self.job_id,
                report.state
            )
            .into());
        }
        let job_id = self.job_id;
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.task_id == report.task_id)
            .ok_or(MetaError::TaskNotFound {
                job_id,
                task_id: report.task_id,
            })?;
        task.finish(report.state, report.message.clone(), unix_time_ms())?;
        tracing::info!(
            job_id,
            task_id = task.task_id,
            state = ?task.state(),
            "optimize task finished"
        );
        Ok(task.clone())
    }

    fn resume(&mut self, env: &JobEnv) -> Result<Option<Bytes>> {
        if self.state != JobState::Running {
            return Ok(None);
        }
        let open = self
            .tasks
            .iter()
            .any(|task| !task.state().is_terminal());
        if !open {
            return Ok(None);
        }
        tracing::info!(job_id = self.job_id, "re-dispatching open optimize tasks");
        self.dispatch_open_tasks(env)?;
        Ok(Some(self.snapshot()?))
    }

    fn is_timed_out(&self, now_unix_ms: u64) -> bool {
        !self.state.is_terminal()
            && now_unix_ms.saturating_sub(self.created_unix_ms) > self.timeout_ms
    }

    fn record(&self) -> JobRecord {
        JobRecord::Optimize(self.clone())
    }
}
