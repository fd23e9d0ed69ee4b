//! Shared types for the replicated log.
//!
//! Kept dependency-light: the metadata core, the log implementations and the
//! tests all depend on these definitions.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Logical node identifier within the cluster.
pub type NodeId = u64;
/// Position of an entry in the log. The first entry has index 1; 0 means "empty".
pub type LogIndex = u64;

/// One ordered, committed log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub appended_unix_ms: u64,
    pub payload: Vec<u8>,
}

/// Ordered log replicated from the leader to every follower.
///
/// Implementations guarantee that entries are delivered in append order and
/// that indexes are contiguous.
#[async_trait]
pub trait ReplicatedLog: Send + Sync + 'static {
    /// Append an opaque payload and return its index once it is durable.
    async fn append(&self, payload: Vec<u8>) -> anyhow::Result<LogIndex>;

    /// Return up to `max` entries starting at `from` (inclusive).
    async fn read_from(&self, from: LogIndex, max: usize) -> anyhow::Result<Vec<LogEntry>>;

    /// Index of the newest entry, or 0 when the log is empty.
    fn last_index(&self) -> LogIndex;

    /// Resolve once `last_index() >= index`.
    async fn wait_for(&self, index: LogIndex);
}

/// Application state machine driven by the log follower.
///
/// `apply` must be deterministic: every node applying the same entries in the
/// same order ends with the same state. An `Err` is treated as fatal by
/// `follow`.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, entry: &LogEntry) -> anyhow::Result<()>;

    fn apply_batch(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        for entry in entries {
            self.apply(entry)?;
        }
        Ok(())
    }
}

pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
