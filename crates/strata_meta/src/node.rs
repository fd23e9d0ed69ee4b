//! Wiring of one node: replay follower, scheduler, history GC and the
//! optional forward server, sharing one shutdown token. A failing replay
//! follower fires that token too.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use strata_log::{follow, LogIndex, ReplicatedLog};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MetaConfig;
use crate::error::Result;
use crate::forward::{
    ClientPool, ForwardResult, ForwardServer, LeaderForwardExecutor, SessionContext,
    StatementHandler, TcpClientPool,
};
use crate::history::{spawn_gc, TaskRunHistory};
use crate::job::JobEnv;
use crate::job_store::JobStore;
use crate::membership::LeaderOracle;
use crate::replay::JobReplayEngine;
use crate::scheduler::{AlterJobScheduler, SchedulerHandle};
use crate::warehouse::WarehouseCatalog;

/// External collaborators a node is started with.
pub struct NodeDeps {
    pub log: Arc<dyn ReplicatedLog>,
    pub leader: Arc<dyn LeaderOracle>,
    pub env: JobEnv,
    pub warehouses: Arc<dyn WarehouseCatalog>,
    /// Required when the forward listener is enabled.
    pub handler: Option<Arc<dyn StatementHandler>>,
    /// Defaults to a `TcpClientPool`.
    pub pool: Option<Arc<dyn ClientPool>>,
}

pub struct MetaNode {
    cfg: MetaConfig,
    store: JobStore,
    replay: Arc<JobReplayEngine>,
    history: Arc<TaskRunHistory>,
    scheduler: SchedulerHandle,
    executor: Arc<LeaderForwardExecutor>,
    forward_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    follower: JoinHandle<anyhow::Result<LogIndex>>,
    scheduler_task: JoinHandle<()>,
    gc_task: JoinHandle<()>,
    server_task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl MetaNode {
    /// Start every background task. Returns once the job store has replayed
    /// the log up to its tail at start time.
    pub async fn start(cfg: MetaConfig, deps: NodeDeps) -> anyhow::Result<Self> {
        let handler = match (cfg.forward.listen, deps.handler) {
            (Some(_), None) => {
                anyhow::bail!("forward listener configured without a statement handler")
            }
            (_, handler) => handler,
        };

        let store = JobStore::new();
        let replay = Arc::new(JobReplayEngine::new(store.clone()));
        let cancel = CancellationToken::new();
        let mut follower = tokio::spawn({
            let log = deps.log.clone();
            let replay = replay.clone();
            let cancel = cancel.clone();
            async move {
                let res = follow(log, replay, 1, cancel.clone()).await;
                if let Err(err) = &res {
                    // A node whose store stopped following the log must not
                    // keep scheduling against it.
                    tracing::error!(error = ?err, "job replay stopped, shutting node down");
                    cancel.cancel();
                }
                res
            }
        });

        let tail = deps.log.last_index();
        tokio::select! {
            _ = replay.wait_applied(tail) => {}
            res = &mut follower => {
                cancel.cancel();
                let applied = res.context("join log follower")??;
                anyhow::bail!("log follower stopped during startup at index {applied}");
            }
        }
        tracing::info!(replayed = tail, jobs = store.len(), "job store recovered");

        let history = Arc::new(TaskRunHistory::new());
        let gc_task = spawn_gc(
            history.clone(),
            cfg.history.max_history,
            cfg.history.gc_interval,
            cancel.clone(),
        );

        let (scheduler, scheduler_task) = AlterJobScheduler::new(
            cfg.scheduler.clone(),
            deps.log.clone(),
            replay.clone(),
            deps.leader.clone(),
            deps.env,
            history.clone(),
        )
        .spawn(cancel.clone());

        let pool = deps
            .pool
            .unwrap_or_else(|| Arc::new(TcpClientPool::new(cfg.forward.pool_idle)));
        let executor = Arc::new(LeaderForwardExecutor::new(
            deps.leader.clone(),
            deps.warehouses,
            pool,
            cfg.forward.max_forward_times,
        ));

        let mut forward_addr = None;
        let mut server_task = None;
        if let (Some(addr), Some(handler)) = (cfg.forward.listen, handler) {
            let server = Arc::new(ForwardServer::new(
                deps.leader.clone(),
                handler,
                executor.clone(),
                cfg.forward.timeout,
            ));
            match server.spawn(addr, cancel.clone()).await {
                Ok((local, task)) => {
                    forward_addr = Some(local);
                    server_task = Some(task);
                }
                Err(err) => {
                    cancel.cancel();
                    return Err(err.context(format!("start forward server on {addr}")));
                }
            }
        }

        Ok(Self {
            cfg,
            store,
            replay,
            history,
            scheduler,
            executor,
            forward_addr,
            cancel,
            follower,
            scheduler_task,
            gc_task,
            server_task,
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn history(&self) -> &Arc<TaskRunHistory> {
        &self.history
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<LeaderForwardExecutor> {
        &self.executor
    }

    /// Bound address of the forward server, if one is running.
    pub fn forward_addr(&self) -> Option<SocketAddr> {
        self.forward_addr
    }

    pub fn applied_index(&self) -> LogIndex {
        self.replay.applied_index()
    }

    /// Forward `sql` to the leader with the configured timeout.
    pub async fn execute_forwarded(
        &self,
        sql: &str,
        session: &mut SessionContext,
    ) -> Result<ForwardResult> {
        self.executor
            .execute(sql, session, self.cfg.forward.timeout)
            .await
    }

    /// Stop every task and clear the job store.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.server_task {
            task.await.context("join forward server")??;
        }
        self.scheduler_task.await.context("join scheduler")?;
        self.gc_task.await.context("join history gc")?;
        let applied = self.follower.await.context("join log follower")??;
        self.store.clear();
        tracing::info!(applied, "meta node stopped");
        Ok(())
    }
}
