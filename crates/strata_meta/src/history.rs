//! Bounded history of finished task executions.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::{JobId, TaskId};

/// Records handed to the memory tracker per sampling round.
pub const MEMORY_TASK_RUN_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

/// One completed execution. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub query_id: String,
    pub job_id: JobId,
    /// `None` for the record of the job as a whole.
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub outcome: RunOutcome,
    pub created_unix_ms: u64,
    pub finished_unix_ms: u64,
    #[serde(default)]
    pub message: String,
}

/// Insertion-ordered history keyed by query id.
///
/// Every call takes the one mutex, so GC and sampling never observe a map
/// that is being mutated.
#[derive(Default)]
pub struct TaskRunHistory {
    runs: Mutex<IndexMap<String, Arc<TaskRunRecord>>>,
}

impl TaskRunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. An existing key keeps its original slot.
    pub fn add_history(&self, record: TaskRunRecord) {
        let key = record.query_id.clone();
        self.runs.lock().insert(key, Arc::new(record));
    }

    pub fn get_task(&self, query_id: &str) -> Option<Arc<TaskRunRecord>> {
        if query_id.is_empty() {
            return None;
        }
        self.runs.lock().get(query_id).cloned()
    }

    /// Remove one record, keeping the order of the rest. Linear in the
    /// number of records; bulk eviction goes through `force_gc`.
    pub fn remove_task(&self, query_id: &str) {
        self.runs.lock().shift_remove(query_id);
    }

    /// Every record, newest first.
    pub fn get_all_history(&self) -> Vec<Arc<TaskRunRecord>> {
        self.runs.lock().values().rev().cloned().collect()
    }

    /// Keep the `cap` newest records and drop the rest. Returns how many were
    /// evicted.
    pub fn force_gc(&self, cap: usize) -> usize {
        let mut runs = self.runs.lock();
        let before = runs.len();
        if before <= cap {
            return 0;
        }
        let evicted = before - cap;
        tracing::info!(before, cap, "task run history exceeds cap, evicting oldest");
        // Oldest entries sit at the front.
        runs.drain(..evicted);
        tracing::warn!(evicted, after = runs.len(), "task run history gc finished");
        evicted
    }

    pub fn task_run_count(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn samples_for_memory_tracker(&self, n: usize) -> Vec<Arc<TaskRunRecord>> {
        self.runs.lock().values().take(n).cloned().collect()
    }
}

/// Run `force_gc(cap)` every `interval` until `cancel` fires.
pub fn spawn_gc(
    history: Arc<TaskRunHistory>,
    cap: usize,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    history.force_gc(cap);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(query_id: &str) -> TaskRunRecord {
        TaskRunRecord {
            query_id: query_id.to_string(),
            job_id: 1,
            task_id: Some(1),
            outcome: RunOutcome::Success,
            created_unix_ms: 1,
            finished_unix_ms: 2,
            message: String::new(),
        }
    }

    fn ids(records: &[Arc<TaskRunRecord>]) -> Vec<&str> {
        records.iter().map(|r| r.query_id.as_str()).collect()
    }

    #[test]
    fn history_is_newest_first() {
        let history = TaskRunHistory::new();
        for id in ["A", "B", "C"] {
            history.add_history(run(id));
        }
        assert_eq!(ids(&history.get_all_history()), vec!["C", "B", "A"]);
    }

    #[test]
    fn force_gc_keeps_newest_and_is_then_a_no_op() {
        let history = TaskRunHistory::new();
        for idx in 0..10 {
            history.add_history(run(&format!("q{idx}")));
        }
        assert_eq!(history.force_gc(4), 6);
        assert_eq!(history.task_run_count(), 4);
        assert_eq!(
            ids(&history.get_all_history()),
            vec!["q9", "q8", "q7", "q6"]
        );
        assert_eq!(history.force_gc(4), 0);
        assert_eq!(history.force_gc(100), 0);
        assert_eq!(history.task_run_count(), 4);
    }

    #[test]
    fn reinsert_updates_in_place_without_moving() {
        let history = TaskRunHistory::new();
        for id in ["A", "B", "C"] {
            history.add_history(run(id));
        }
        let mut updated = run("A");
        updated.message = "retried".to_string();
        history.add_history(updated);

        assert_eq!(history.task_run_count(), 3);
        assert_eq!(ids(&history.get_all_history()), vec!["C", "B", "A"]);
        assert_eq!(history.get_task("A").unwrap().message, "retried");

        // A is still the oldest, so it goes first.
        history.force_gc(2);
        assert!(history.get_task("A").is_none());
    }

    #[test]
    fn lookup_and_remove() {
        let history = TaskRunHistory::new();
        history.add_history(run("A"));
        history.add_history(run("B"));
        history.add_history(run("C"));
        assert!(history.get_task("").is_none());
        assert!(history.get_task("missing").is_none());

        history.remove_task("missing");
        history.remove_task("B");
        assert_eq!(ids(&history.get_all_history()), vec!["C", "A"]);
    }

    #[test]
    fn memory_samples_are_bounded() {
        let history = TaskRunHistory::new();
        for idx in 0..20 {
            history.add_history(run(&format!("q{idx}")));
        }
        assert_eq!(
            history
                .samples_for_memory_tracker(MEMORY_TASK_RUN_SAMPLES)
                .len(),
            MEMORY_TASK_RUN_SAMPLES
        );
        assert_eq!(history.samples_for_memory_tracker(50).len(), 20);
    }

    #[test]
    fn gc_of_a_large_history_is_a_single_pass() {
        let history = TaskRunHistory::new();
        for i in 0..100_000 {
            history.add_history(run(&format!("q{i}")));
        }
        let started = std::time::Instant::now();
        assert_eq!(history.force_gc(50_000), 50_000);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "gc took {:?}",
            started.elapsed()
        );

        assert_eq!(history.task_run_count(), 50_000);
        assert!(history.get_task("q49999").is_none());
        let all = history.get_all_history();
        assert_eq!(all.first().unwrap().query_id, "q99999");
        assert_eq!(all.last().unwrap().query_id, "q50000");
    }

    #[test]
    fn concurrent_writers_and_gc() {
        let history = Arc::new(TaskRunHistory::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let history = history.clone();
                std::thread::spawn(move || {
                    for idx in 0..250 {
                        history.add_history(run(&format!("w{w}-{idx}")));
                    }
                })
            })
            .collect();
        for _ in 0..20 {
            history.force_gc(100);
            history.samples_for_memory_tracker(MEMORY_TASK_RUN_SAMPLES);
        }
        for writer in writers {
            writer.join().unwrap();
        }
        history.force_gc(100);
        assert_eq!(history.task_run_count(), 100);
    }

    #[tokio::test]
    async fn gc_loop_enforces_cap() {
        let history = Arc::new(TaskRunHistory::new());
        for idx in 0..5 {
            history.add_history(run(&format!("q{idx}")));
        }
        let cancel = CancellationToken::new();
        let task = spawn_gc(history.clone(), 2, Duration::from_millis(10), cancel.clone());
        for _ in 0..100 {
            if history.task_run_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(history.task_run_count(), 2);
        cancel.cancel();
        task.await.unwrap();
    }
}
