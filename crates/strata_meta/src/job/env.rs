//! Collaborators an alter job consults while it runs.
//!
//! Each seam is a trait so the scheduler never reaches into catalog or
//! storage internals directly. `crate::local` carries in-process versions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_log::NodeId;

use crate::job::{JobTarget, OptimizeTask, PartitionId, TabletId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Normal,
    Decommission,
    Relocating,
}

impl ReplicaState {
    pub fn is_stable(self) -> bool {
        self == ReplicaState::Normal
    }
}

pub trait ReplicaPlacement: Send + Sync + 'static {
    /// `None` when the replica is unknown to the placement service.
    fn replica_state(&self, tablet_id: TabletId, node_id: NodeId) -> Option<ReplicaState>;
}

pub trait TxnOracle: Send + Sync + 'static {
    fn next_txn_id(&self) -> anyhow::Result<u64>;

    /// True once every transaction on the table that began before
    /// `watershed_txn_id` is visible.
    fn previous_txns_finished(
        &self,
        watershed_txn_id: u64,
        db_id: u64,
        table_id: u64,
    ) -> anyhow::Result<bool>;
}

pub trait TaskDispatcher: Send + Sync + 'static {
    /// Hand a task to the executor. Completion is reported back later as a
    /// `TaskReport`.
    fn dispatch(&self, target: &JobTarget, task: &OptimizeTask) -> anyhow::Result<()>;
}

pub trait TableCatalog: Send + Sync + 'static {
    /// Swap the rewritten partitions in.
    fn finish_optimize(&self, target: &JobTarget, partitions: &[PartitionId]) -> anyhow::Result<()>;

    /// Drop any intermediate state left by a cancelled job.
    fn abort_optimize(&self, target: &JobTarget) -> anyhow::Result<()>;
}

/// Bundle of collaborators handed to every job step.
#[derive(Clone)]
pub struct JobEnv {
    pub placement: Arc<dyn ReplicaPlacement>,
    pub txns: Arc<dyn TxnOracle>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub catalog: Arc<dyn TableCatalog>,
}
