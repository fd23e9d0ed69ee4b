//! In-process log used by single-process clusters and tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::types::{unix_time_ms, LogEntry, LogIndex, ReplicatedLog};

/// Ordered entry buffer plus a tail watermark that readers can wait on.
///
/// Shared by `MemoryLog` and `FileLog`; the file log uses it as its read side.
pub(crate) struct LogBuffer {
    entries: RwLock<Vec<LogEntry>>,
    tail: watch::Sender<LogIndex>,
}

impl LogBuffer {
    pub(crate) fn new(initial: Vec<LogEntry>) -> Self {
        let last = initial.last().map(|e| e.index).unwrap_or(0);
        let (tail, _) = watch::channel(last);
        Self {
            entries: RwLock::new(initial),
            tail,
        }
    }

    /// Assign the next index, run `persist` with the new entry while holding
    /// the write lock, then publish it.
    ///
    /// Holding the lock across `persist` keeps on-disk order equal to index order.
    pub(crate) fn append_with<F>(&self, payload: Vec<u8>, persist: F) -> anyhow::Result<LogIndex>
    where
        F: FnOnce(&LogEntry) -> anyhow::Result<()>,
    {
        let mut entries = self.entries.write();
        let entry = LogEntry {
            index: entries.len() as LogIndex + 1,
            appended_unix_ms: unix_time_ms(),
            payload,
        };
        persist(&entry)?;
        let index = entry.index;
        entries.push(entry);
        self.tail.send_replace(index);
        Ok(index)
    }

    pub(crate) fn read_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let entries = self.entries.read();
        let skip = from.saturating_sub(1) as usize;
        entries.iter().skip(skip).take(max).cloned().collect()
    }

    pub(crate) fn last_index(&self) -> LogIndex {
        *self.tail.borrow()
    }

    pub(crate) async fn wait_for(&self, index: LogIndex) {
        let mut rx = self.tail.subscribe();
        // The sender lives as long as `self`, so this only errs on teardown.
        let _ = rx.wait_for(|last| *last >= index).await;
    }
}

/// Volatile log: entries live only as long as the process.
#[derive(Clone)]
pub struct MemoryLog {
    buffer: Arc<LogBuffer>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(LogBuffer::new(Vec::new())),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicatedLog for MemoryLog {
    async fn append(&self, payload: Vec<u8>) -> anyhow::Result<LogIndex> {
        self.buffer.append_with(payload, |_| Ok(()))
    }

    async fn read_from(&self, from: LogIndex, max: usize) -> anyhow::Result<Vec<LogEntry>> {
        Ok(self.buffer.read_from(from, max))
    }

    fn last_index(&self) -> LogIndex {
        self.buffer.last_index()
    }

    async fn wait_for(&self, index: LogIndex) {
        self.buffer.wait_for(index).await
    }
}
