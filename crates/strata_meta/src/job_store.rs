//! Node-local registry of replicated job snapshots.
//!
//! The store is created when a node starts and cleared when it stops. It is
//! written only by the replay engine; everyone else reads cloned snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::job::{JobId, JobRecord, JobState};

#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// Every job, ordered by id.
    pub fn list(&self) -> Vec<JobRecord> {
        self.jobs.read().values().cloned().collect()
    }

    /// Jobs that have not reached a terminal state.
    pub fn active(&self) -> Vec<JobRecord> {
        self.jobs
            .read()
            .values()
            .filter(|job| !job.state().is_terminal())
            .cloned()
            .collect()
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|job| job.state() == state)
            .count()
    }

    pub fn max_job_id(&self) -> JobId {
        self.jobs.read().keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    pub fn clear(&self) {
        self.jobs.write().clear();
    }

    /// Run `f` against the current entry for `job_id` and store what it returns.
    ///
    /// The write lock is held for the whole update so concurrent publishers
    /// of the same job serialize.
    pub(crate) fn update<E>(
        &self,
        job_id: JobId,
        f: impl FnOnce(Option<&JobRecord>) -> Result<JobRecord, E>,
    ) -> Result<JobRecord, E> {
        let mut jobs = self.jobs.write();
        let next = f(jobs.get(&job_id))?;
        jobs.insert(job_id, next.clone());
        Ok(next)
    }
}
