//! Metadata coordination core of a frontend node.
//!
//! - `job`: alter jobs (online optimize) and their per-partition tasks
//! - `replay`: rebuilds job state on every node from the replicated log
//! - `scheduler`: leader-side driver that steps jobs and appends snapshots
//! - `history`: bounded record of finished task runs
//! - `forward`: relays statements from any node to the leader
//! - `node`: starts and stops all of the above together

pub mod config;
pub mod error;
pub mod forward;
pub mod history;
pub mod job;
pub mod job_store;
pub mod local;
pub mod membership;
pub mod node;
pub mod replay;
pub mod scheduler;
pub mod warehouse;

pub use config::{MetaConfig, NodeArgs};
pub use error::{MetaError, Result};
pub use job_store::JobStore;
pub use node::{MetaNode, NodeDeps};
pub use replay::JobReplayEngine;
pub use scheduler::{AlterJobScheduler, SchedulerHandle};
