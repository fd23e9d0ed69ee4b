//! In-process collaborators for single-node deployments and tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_log::NodeId;

use crate::job::{
    JobEnv, JobId, JobTarget, OptimizeJobSpec, OptimizeTask, PartitionId, ReplicaPlacement,
    ReplicaState, TableCatalog, TabletId, TaskDispatcher, TaskId, TxnOracle,
};

/// Replica states keyed by `(tablet, node)`.
#[derive(Default)]
pub struct LocalPlacement {
    replicas: Mutex<HashMap<(TabletId, NodeId), ReplicaState>>,
}

impl LocalPlacement {
    pub fn set(&self, tablet_id: TabletId, node_id: NodeId, state: ReplicaState) {
        self.replicas.lock().insert((tablet_id, node_id), state);
    }

    /// Register every replica named by `spec` with `state`.
    pub fn mark_all(&self, spec: &OptimizeJobSpec, state: ReplicaState) {
        let mut replicas = self.replicas.lock();
        for partition in &spec.partitions {
            for tablet in &partition.tablets {
                for node in &tablet.replicas {
                    replicas.insert((tablet.tablet_id, *node), state);
                }
            }
        }
    }
}

impl ReplicaPlacement for LocalPlacement {
    fn replica_state(&self, tablet_id: TabletId, node_id: NodeId) -> Option<ReplicaState> {
        self.replicas.lock().get(&(tablet_id, node_id)).copied()
    }
}

/// Monotonic transaction ids with a set of still-open transactions.
#[derive(Default)]
pub struct LocalTxnOracle {
    next: AtomicU64,
    open: Mutex<BTreeSet<u64>>,
}

impl LocalTxnOracle {
    /// Open a transaction that stays invisible until `commit`.
    pub fn begin(&self) -> u64 {
        let txn_id = self.allocate();
        self.open.lock().insert(txn_id);
        txn_id
    }

    pub fn commit(&self, txn_id: u64) {
        self.open.lock().remove(&txn_id);
    }

    fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl TxnOracle for LocalTxnOracle {
    fn next_txn_id(&self) -> anyhow::Result<u64> {
        Ok(self.allocate())
    }

    fn previous_txns_finished(
        &self,
        watershed_txn_id: u64,
        _db_id: u64,
        _table_id: u64,
    ) -> anyhow::Result<bool> {
        Ok(self
            .open
            .lock()
            .first()
            .map_or(true, |oldest| *oldest >= watershed_txn_id))
    }
}

/// A dispatched task, as seen by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub partition_id: PartitionId,
    pub query_id: String,
}

/// Records dispatches; the caller reports completion separately.
#[derive(Default)]
pub struct LocalDispatcher {
    dispatched: Mutex<Vec<Dispatched>>,
    failing: Mutex<HashSet<PartitionId>>,
}

impl LocalDispatcher {
    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().clone()
    }

    /// Make every dispatch for `partition_id` fail.
    pub fn fail_partition(&self, partition_id: PartitionId) {
        self.failing.lock().insert(partition_id);
    }
}

impl TaskDispatcher for LocalDispatcher {
    fn dispatch(&self, target: &JobTarget, task: &OptimizeTask) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.failing.lock().contains(&task.partition_id),
            "no executor available for partition {}",
            task.partition_name
        );
        self.dispatched.lock().push(Dispatched {
            job_id: target.job_id,
            task_id: task.task_id,
            partition_id: task.partition_id,
            query_id: task.query_id().unwrap_or_default().to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct LocalCatalog {
    finished: Mutex<Vec<(JobId, Vec<PartitionId>)>>,
    aborted: Mutex<Vec<JobId>>,
    fail_finish: AtomicBool,
}

impl LocalCatalog {
    pub fn finished(&self) -> Vec<(JobId, Vec<PartitionId>)> {
        self.finished.lock().clone()
    }

    pub fn aborted(&self) -> Vec<JobId> {
        self.aborted.lock().clone()
    }

    pub fn fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }
}

impl TableCatalog for LocalCatalog {
    fn finish_optimize(&self, target: &JobTarget, partitions: &[PartitionId]) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.fail_finish.load(Ordering::SeqCst),
            "table {} is locked",
            target.table_name
        );
        self.finished
            .lock()
            .push((target.job_id, partitions.to_vec()));
        Ok(())
    }

    fn abort_optimize(&self, target: &JobTarget) -> anyhow::Result<()> {
        self.aborted.lock().push(target.job_id);
        Ok(())
    }
}

/// All four collaborators, shared.
#[derive(Clone, Default)]
pub struct LocalCluster {
    pub placement: Arc<LocalPlacement>,
    pub txns: Arc<LocalTxnOracle>,
    pub dispatcher: Arc<LocalDispatcher>,
    pub catalog: Arc<LocalCatalog>,
}

impl LocalCluster {
    pub fn env(&self) -> JobEnv {
        JobEnv {
            placement: self.placement.clone(),
            txns: self.txns.clone(),
            dispatcher: self.dispatcher.clone(),
            catalog: self.catalog.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_transaction_below_watershed_blocks() {
        let txns = LocalTxnOracle::default();
        let open = txns.begin();
        let watershed = txns.next_txn_id().unwrap();
        assert!(!txns.previous_txns_finished(watershed, 1, 1).unwrap());

        // Transactions opened after the watershed do not block it.
        let later = txns.begin();
        txns.commit(open);
        assert!(txns.previous_txns_finished(watershed, 1, 1).unwrap());
        txns.commit(later);
    }
}
