use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::types::{LogIndex, ReplicatedLog, StateMachine};

/// Maximum number of entries applied per read.
pub const FOLLOW_BATCH_MAX: usize = 256;

/// Apply every entry from `from` onwards to `machine`, in log order, until
/// `cancel` fires.
///
/// Returns the index of the last applied entry. A failing `apply` stops the
/// follower with an error: the log is trusted to be well formed, so a bad
/// entry is not skipped.
pub async fn follow(
    log: Arc<dyn ReplicatedLog>,
    machine: Arc<dyn StateMachine>,
    from: LogIndex,
    cancel: CancellationToken,
) -> anyhow::Result<LogIndex> {
    let mut next = from.max(1);
    loop {
        if cancel.is_cancelled() {
            return Ok(next - 1);
        }
        let batch = log.read_from(next, FOLLOW_BATCH_MAX).await?;
        if batch.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(next - 1),
                _ = log.wait_for(next) => continue,
            }
        }
        for entry in &batch {
            machine
                .apply(entry)
                .with_context(|| format!("apply log entry {}", entry.index))?;
            next = entry.index + 1;
        }
        tracing::trace!(applied = next - 1, "log follower applied batch");
    }
}
