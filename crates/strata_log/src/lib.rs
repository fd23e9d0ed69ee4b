//! Replicated metadata log contracts.
//!
//! This crate is the narrow seam between the metadata core and whatever
//! replication layer sits underneath it. Higher layers append opaque payloads
//! on the leader and run a `StateMachine` over the ordered entries on every
//! node via `follow`.

mod file;
mod follow;
mod memory;
mod types;

pub use file::{FileLog, SyncMode, MAX_RECORD_BYTES};
pub use follow::{follow, FOLLOW_BATCH_MAX};
pub use memory::MemoryLog;
pub use types::{unix_time_ms, LogEntry, LogIndex, NodeId, ReplicatedLog, StateMachine};
