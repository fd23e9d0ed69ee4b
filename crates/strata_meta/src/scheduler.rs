//! Leader-side driver of alter jobs.
//!
//! One scheduler task per node owns every live job. Submissions, cancels and
//! task reports reach it over a channel, so a job is never stepped
//! concurrently with itself. Committed transitions are appended to the
//! replicated log; the job store only changes through replay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use strata_log::{unix_time_ms, LogIndex, ReplicatedLog};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{MetaError, Result};
use crate::history::{RunOutcome, TaskRunHistory, TaskRunRecord};
use crate::job::{
    AlterJob, JobEnv, JobId, JobRecord, JobState, OptimizeJob, OptimizeJobSpec, OptimizeTask,
    StepOutcome, TaskReport, TaskState,
};
use crate::membership::LeaderOracle;
use crate::replay::JobReplayEngine;

const COMMAND_QUEUE: usize = 256;

enum Command {
    Submit {
        spec: OptimizeJobSpec,
        reply: oneshot::Sender<Result<JobId>>,
    },
    Cancel {
        job_id: JobId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Report {
        report: TaskReport,
        reply: oneshot::Sender<Result<()>>,
    },
    RunOnce {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable front door to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| MetaError::SchedulerClosed)?;
        rx.await.map_err(|_| MetaError::SchedulerClosed)?
    }

    /// Create an optimize job. Only the leader accepts submissions.
    pub async fn submit(&self, spec: OptimizeJobSpec) -> Result<JobId> {
        self.call(|reply| Command::Submit { spec, reply }).await
    }

    pub async fn cancel(&self, job_id: JobId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.call(|reply| Command::Cancel {
            job_id,
            reason,
            reply,
        })
        .await
    }

    /// Deliver the terminal outcome of a dispatched task.
    pub async fn report_task(&self, report: TaskReport) -> Result<()> {
        self.call(|reply| Command::Report { report, reply }).await
    }

    /// Run one scheduling pass now instead of waiting for the next tick.
    pub async fn run_once(&self) -> Result<()> {
        self.call(|reply| Command::RunOnce { reply }).await
    }
}

pub struct AlterJobScheduler {
    cfg: SchedulerConfig,
    log: Arc<dyn ReplicatedLog>,
    replay: Arc<JobReplayEngine>,
    leader: Arc<dyn LeaderOracle>,
    env: JobEnv,
    history: Arc<TaskRunHistory>,
    jobs: BTreeMap<JobId, Box<dyn AlterJob>>,
    /// Jobs whose latest snapshot has not reached the log yet.
    unsynced: BTreeSet<JobId>,
    /// Highest id this scheduler handed out. Reaped jobs may not have reached
    /// the store yet, so ids are never derived from the store alone.
    last_job_id: JobId,
    leading: bool,
}

impl AlterJobScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        log: Arc<dyn ReplicatedLog>,
        replay: Arc<JobReplayEngine>,
        leader: Arc<dyn LeaderOracle>,
        env: JobEnv,
        history: Arc<TaskRunHistory>,
    ) -> Self {
        Self {
            cfg,
            log,
            replay,
            leader,
            env,
            history,
            jobs: BTreeMap::new(),
            unsynced: BTreeSet::new(),
            last_job_id: 0,
            leading: false,
        }
    }

    /// Start the scheduler loop; it stops when `cancel` fires or every
    /// handle is dropped.
    pub fn spawn(mut self, cancel: CancellationToken) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(async move { self.run(rx, cancel).await });
        (SchedulerHandle { tx }, task)
    }

    async fn run(&mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let period = self.cfg.tick_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.schedule_once().await,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }
        tracing::info!(owned = self.jobs.len(), "alter job scheduler stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { spec, reply } => {
                let _ = reply.send(self.submit(spec).await);
            }
            Command::Cancel {
                job_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.cancel_job(job_id, &reason).await);
            }
            Command::Report { report, reply } => {
                let _ = reply.send(self.report_task(report).await);
            }
            Command::RunOnce { reply } => {
                self.schedule_once().await;
                let _ = reply.send(Ok(()));
            }
        }
        self.reap();
    }

    async fn schedule_once(&mut self) {
        if !self.sync_leadership().await {
            return;
        }
        self.retry_unsynced().await;

        let now = unix_time_ms();
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        for job_id in ids {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if let Some(snapshot) = step(job.as_mut(), &self.env, now) {
                self.persist(job_id, snapshot).await;
            }
        }
        self.reap();
    }

    /// Follow the leader oracle. Returns whether this node drives jobs now.
    async fn sync_leadership(&mut self) -> bool {
        if !self.leader.is_leader() {
            if self.leading {
                tracing::warn!(
                    released = self.jobs.len(),
                    "lost leadership, releasing alter jobs"
                );
                self.jobs.clear();
                self.unsynced.clear();
                self.leading = false;
            }
            return false;
        }
        if self.leading {
            return true;
        }
        // Adopt only once the store reflects everything already committed.
        let tail = self.log.last_index();
        if !self.await_replay(tail).await {
            return false;
        }
        self.adopt().await;
        self.leading = true;
        true
    }

    async fn adopt(&mut self) {
        for record in self.replay.store().active() {
            let job_id = record.job_id();
            let mut job = record.into_job();
            match job.resume(&self.env) {
                Ok(Some(snapshot)) => self.persist(job_id, snapshot).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, job_id, "resume alter job failed");
                }
            }
            self.jobs.insert(job_id, job);
        }
        tracing::info!(adopted = self.jobs.len(), "alter job scheduler is leading");
    }

    async fn ensure_leading(&mut self) -> Result<()> {
        if self.sync_leadership().await {
            Ok(())
        } else {
            Err(MetaError::NotLeader)
        }
    }

    async fn submit(&mut self, spec: OptimizeJobSpec) -> Result<JobId> {
        self.ensure_leading().await?;
        let job_id = self.next_job_id();
        self.last_job_id = job_id;
        let timeout_ms = self.cfg.default_job_timeout.as_millis() as u64;
        let job = OptimizeJob::from_spec(job_id, spec, timeout_ms);
        let snapshot = job.snapshot()?;
        let index = self
            .log
            .append(snapshot.to_vec())
            .await
            .with_context(|| format!("append new alter job {job_id}"))?;
        self.await_replay(index).await;
        tracing::info!(
            job_id,
            table = %job.table_name(),
            tasks = job.tasks().len(),
            "submitted optimize job"
        );
        self.jobs.insert(job_id, Box::new(job));
        Ok(job_id)
    }

    async fn cancel_job(&mut self, job_id: JobId, reason: &str) -> Result<()> {
        self.ensure_leading().await?;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Err(self.missing_job(job_id));
        };
        match job.cancel(reason, &self.env)? {
            Some(snapshot) => {
                self.persist(job_id, snapshot).await;
                Ok(())
            }
            None => Err(MetaError::JobNotActive {
                job_id,
                state: job.state(),
            }),
        }
    }

    async fn report_task(&mut self, report: TaskReport) -> Result<()> {
        self.ensure_leading().await?;
        let Some(job) = self.jobs.get_mut(&report.job_id) else {
            return Err(self.missing_job(report.job_id));
        };
        let task = job.apply_task_report(&report)?;
        let snapshot = job.snapshot()?;
        self.history.add_history(task_run_record(&task));
        self.persist(report.job_id, snapshot).await;
        Ok(())
    }

    fn next_job_id(&self) -> JobId {
        let owned = self.jobs.keys().next_back().copied().unwrap_or(0);
        self.replay
            .store()
            .max_job_id()
            .max(owned)
            .max(self.last_job_id)
            + 1
    }

    fn missing_job(&self, job_id: JobId) -> MetaError {
        match self.replay.store().get(job_id) {
            Some(record) if record.state().is_terminal() => MetaError::JobNotActive {
                job_id,
                state: record.state(),
            },
            _ => MetaError::JobNotFound(job_id),
        }
    }

    async fn persist(&mut self, job_id: JobId, snapshot: Bytes) {
        match self.log.append(snapshot.to_vec()).await {
            Ok(index) => {
                self.unsynced.remove(&job_id);
                self.await_replay(index).await;
            }
            Err(err) => {
                tracing::warn!(error = ?err, job_id, "append alter job snapshot failed");
                self.unsynced.insert(job_id);
            }
        }
    }

    async fn retry_unsynced(&mut self) {
        let ids: Vec<JobId> = self.unsynced.iter().copied().collect();
        for job_id in ids {
            let snapshot = match self.jobs.get(&job_id).map(|job| job.snapshot()) {
                Some(Ok(snapshot)) => snapshot,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, job_id, "encode alter job snapshot failed");
                    continue;
                }
                None => {
                    self.unsynced.remove(&job_id);
                    continue;
                }
            };
            self.persist(job_id, snapshot).await;
        }
    }

    async fn await_replay(&self, index: LogIndex) -> bool {
        if tokio::time::timeout(self.cfg.replay_wait, self.replay.wait_applied(index))
            .await
            .is_err()
        {
            tracing::warn!(
                index,
                applied = self.replay.applied_index(),
                "job replay is lagging behind the log"
            );
            return false;
        }
        true
    }

    /// Drop terminal jobs whose final snapshot is in the log.
    fn reap(&mut self) {
        let done: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(job_id, job)| job.state().is_terminal() && !self.unsynced.contains(job_id))
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in done {
            if let Some(job) = self.jobs.remove(&job_id) {
                let record = job.record();
                tracing::info!(job_id, state = ?record.state(), "alter job completed");
                self.history.add_history(job_run_record(&record));
            }
        }
    }
}

/// Advance one job. Returns the snapshot to append, if anything changed.
fn step(job: &mut dyn AlterJob, env: &JobEnv, now_unix_ms: u64) -> Option<Bytes> {
    if job.is_timed_out(now_unix_ms) {
        let reason = format!("alter job {} timed out", job.job_id());
        return cancel_with(job, env, &reason);
    }
    match job.run(env) {
        Ok(StepOutcome::NotReady) => None,
        Ok(StepOutcome::Advanced(snapshot)) => Some(snapshot),
        Ok(StepOutcome::Aborted(reason)) => cancel_with(job, env, &reason),
        Err(err) => {
            tracing::warn!(error = %err, code = err.code(), job_id = job.job_id(), "alter job step failed");
            cancel_with(job, env, &err.to_string())
        }
    }
}

fn cancel_with(job: &mut dyn AlterJob, env: &JobEnv, reason: &str) -> Option<Bytes> {
    match job.cancel(reason, env) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::error!(error = %err, job_id = job.job_id(), "cancel alter job failed");
            None
        }
    }
}

fn task_run_record(task: &OptimizeTask) -> TaskRunRecord {
    TaskRunRecord {
        query_id: task
            .query_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        job_id: task.job_id,
        task_id: Some(task.task_id),
        outcome: match task.state() {
            TaskState::Success => RunOutcome::Success,
            _ => RunOutcome::Failed,
        },
        created_unix_ms: task.dispatched_unix_ms(),
        finished_unix_ms: task.finished_unix_ms(),
        message: task.message().to_string(),
    }
}

fn job_run_record(record: &JobRecord) -> TaskRunRecord {
    TaskRunRecord {
        query_id: Uuid::new_v4().to_string(),
        job_id: record.job_id(),
        task_id: None,
        outcome: match record.state() {
            JobState::Finished => RunOutcome::Success,
            _ => RunOutcome::Cancelled,
        },
        created_unix_ms: record.created_unix_ms(),
        finished_unix_ms: record.finished_unix_ms(),
        message: record.failure_msg().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::{PartitionSpec, ReplicaState, TabletPlacement};
    use crate::job_store::JobStore;
    use crate::local::LocalCluster;
    use crate::membership::SharedLeaderView;
    use strata_log::MemoryLog;

    struct Harness {
        handle: SchedulerHandle,
        store: JobStore,
        cluster: LocalCluster,
        history: Arc<TaskRunHistory>,
        leader: SharedLeaderView,
        cancel: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn spec(partitions: u64, timeout_ms: Option<u64>) -> OptimizeJobSpec {
        OptimizeJobSpec {
            db_id: 1,
            table_id: 2,
            table_name: "lineitem".to_string(),
            partitions: (0..partitions)
                .map(|idx| PartitionSpec {
                    partition_id: 10 + idx,
                    partition_name: format!("p{idx}"),
                    tablets: vec![TabletPlacement {
                        tablet_id: 100 + idx,
                        replicas: vec![1, 2],
                    }],
                })
                .collect(),
            timeout_ms,
        }
    }

    fn harness(leader: SharedLeaderView) -> Harness {
        build(leader, true)
    }

    /// `replaying = false` leaves the store behind the log for good.
    fn build(leader: SharedLeaderView, replaying: bool) -> Harness {
        let log = Arc::new(MemoryLog::new());
        let store = JobStore::new();
        let replay = Arc::new(JobReplayEngine::new(store.clone()));
        let cancel = CancellationToken::new();
        if replaying {
            tokio::spawn(strata_log::follow(
                log.clone(),
                replay.clone(),
                1,
                cancel.clone(),
            ));
        }

        let cluster = LocalCluster::default();
        cluster.placement.mark_all(&spec(4, None), ReplicaState::Normal);
        let history = Arc::new(TaskRunHistory::new());
        let cfg = SchedulerConfig {
            tick_interval: Duration::from_secs(3600),
            default_job_timeout: Duration::from_secs(3600),
            replay_wait: Duration::from_millis(50),
        };
        let scheduler = AlterJobScheduler::new(
            cfg,
            log,
            replay,
            Arc::new(leader.clone()),
            cluster.env(),
            history.clone(),
        );
        let (handle, _task) = scheduler.spawn(cancel.clone());
        Harness {
            handle,
            store,
            cluster,
            history,
            leader,
            cancel,
        }
    }

    fn state(h: &Harness, job_id: JobId) -> JobState {
        h.store.get(job_id).expect("job replicated").state()
    }

    #[tokio::test]
    async fn job_ids_stay_unique_while_replay_lags() {
        let h = build(SharedLeaderView::leader(None), false);
        let first = h.handle.submit(spec(1, None)).await.unwrap();
        h.handle.cancel(first, "admin").await.unwrap();
        // Reaped before the store ever saw it.
        assert!(h.store.get(first).is_none());

        let second = h.handle.submit(spec(1, None)).await.unwrap();
        assert!(second > first, "job id {second} reused after {first}");
    }

    #[tokio::test]
    async fn drives_job_to_finished_and_records_history() {
        let h = harness(SharedLeaderView::leader(None));
        let job_id = h.handle.submit(spec(2, None)).await.unwrap();
        assert_eq!(job_id, 1);
        assert_eq!(state(&h, job_id), JobState::Pending);

        h.handle.run_once().await.unwrap();
        assert_eq!(state(&h, job_id), JobState::WaitingTxn);
        h.handle.run_once().await.unwrap();
        assert_eq!(state(&h, job_id), JobState::Running);

        h.handle.report_task(TaskReport::success(job_id, 1)).await.unwrap();
        h.handle
            .report_task(TaskReport::failed(job_id, 2, "bad tablet"))
            .await
            .unwrap();
        h.handle.run_once().await.unwrap();
        assert_eq!(state(&h, job_id), JobState::Finished);

        let runs = h.history.get_all_history();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].task_id, None);
        assert_eq!(runs[0].outcome, RunOutcome::Success);
        assert_eq!(runs[1].outcome, RunOutcome::Failed);
        let dispatched = h.cluster.dispatcher.dispatched();
        assert!(h.history.get_task(&dispatched[0].query_id).is_some());

        let err = h
            .handle
            .report_task(TaskReport::success(job_id, 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_ALTER_JOB_NOT_ACTIVE");
    }

    #[tokio::test]
    async fn job_ids_keep_increasing() {
        let h = harness(SharedLeaderView::leader(None));
        let first = h.handle.submit(spec(1, None)).await.unwrap();
        let second = h.handle.submit(spec(1, None)).await.unwrap();
        assert!(second > first);
        assert_eq!(h.store.max_job_id(), second);
    }

    #[tokio::test]
    async fn elapsed_timeout_cancels_job() {
        let h = harness(SharedLeaderView::leader(None));
        let job_id = h.handle.submit(spec(1, Some(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.handle.run_once().await.unwrap();

        let record = h.store.get(job_id).unwrap();
        assert_eq!(record.state(), JobState::Cancelled);
        assert!(record.failure_msg().contains("timed out"));
        assert_eq!(h.cluster.catalog.aborted(), vec![job_id]);
    }

    #[tokio::test]
    async fn all_failed_tasks_cancel_job() {
        let h = harness(SharedLeaderView::leader(None));
        let job_id = h.handle.submit(spec(1, None)).await.unwrap();
        h.handle.run_once().await.unwrap();
        h.handle.run_once().await.unwrap();
        h.handle
            .report_task(TaskReport::failed(job_id, 1, "corrupt segment"))
            .await
            .unwrap();
        h.handle.run_once().await.unwrap();

        let record = h.store.get(job_id).unwrap();
        assert_eq!(record.state(), JobState::Cancelled);
        assert!(record.failure_msg().contains("corrupt segment"));
    }

    #[tokio::test]
    async fn cancel_and_unknown_jobs() {
        let h = harness(SharedLeaderView::leader(None));
        let job_id = h.handle.submit(spec(1, None)).await.unwrap();
        h.handle.cancel(job_id, "user request").await.unwrap();
        assert_eq!(state(&h, job_id), JobState::Cancelled);

        let err = h.handle.cancel(job_id, "again").await.unwrap_err();
        assert_eq!(err.code(), "ERR_ALTER_JOB_NOT_ACTIVE");
        let err = h.handle.cancel(99, "nope").await.unwrap_err();
        assert!(matches!(err, MetaError::JobNotFound(99)));
    }

    #[tokio::test]
    async fn follower_rejects_submissions() {
        let h = harness(SharedLeaderView::follower_of("127.0.0.1:1".parse().unwrap()));
        let err = h.handle.submit(spec(1, None)).await.unwrap_err();
        assert!(matches!(err, MetaError::NotLeader));
    }

    #[tokio::test]
    async fn regained_leadership_adopts_and_redispatches() {
        let h = harness(SharedLeaderView::leader(None));
        let job_id = h.handle.submit(spec(2, None)).await.unwrap();
        h.handle.run_once().await.unwrap();
        h.handle.run_once().await.unwrap();
        assert_eq!(h.cluster.dispatcher.dispatched().len(), 2);
        h.handle.report_task(TaskReport::success(job_id, 1)).await.unwrap();

        h.leader.follow(None);
        h.handle.run_once().await.unwrap();
        let err = h
            .handle
            .report_task(TaskReport::success(job_id, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NotLeader));

        h.leader.become_leader(None);
        h.handle.run_once().await.unwrap();
        // Only the open task is dispatched again.
        let dispatched = h.cluster.dispatcher.dispatched();
        assert_eq!(dispatched.len(), 3);
        assert_eq!(dispatched[2].task_id, 2);

        h.handle.report_task(TaskReport::success(job_id, 2)).await.unwrap();
        h.handle.run_once().await.unwrap();
        assert_eq!(state(&h, job_id), JobState::Finished);
    }
}
