//! Queue workers: long-running consumer loops over the message bus.
//!
//! Each worker reads under a stable consumer name, so unacked entries from a
//! crashed run are redelivered to its replacement. Acks happen strictly after
//! the work succeeds.

pub mod processing;
pub mod sender;

use std::time::Duration;

use tracing::{error, warn};

use crate::bus::{MessageBus, QueueEntry};
use crate::config::WorkerConfig;
use crate::error::QueueError;

pub use processing::ProcessingWorker;
pub use sender::SenderWorker;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// One blocking read with group recovery. A missing group (fresh database,
/// external reset) is recreated in place; other errors back off
/// exponentially up to the configured ceiling. Always returns a batch,
/// possibly empty.
async fn read_or_recover(
    bus: &dyn MessageBus,
    stream: &str,
    group: &str,
    config: &WorkerConfig,
    backoff: &mut Duration,
) -> Vec<QueueEntry> {
    match bus
        .read_group(
            stream,
            group,
            &config.consumer_name,
            config.batch_size,
            config.block_timeout,
        )
        .await
    {
        Ok(entries) => {
            *backoff = INITIAL_BACKOFF;
            entries
        }
        Err(QueueError::NoSuchGroup { .. }) => {
            warn!(stream, group, "Consumer group missing; recreating");
            if let Err(e) = bus.ensure_group(stream, group).await {
                error!(stream, group, "Group recreation failed: {e}");
                tokio::time::sleep(*backoff).await;
                *backoff = (*backoff * 2).min(config.max_backoff);
            }
            Vec::new()
        }
        Err(e) => {
            warn!(stream, "Queue read failed: {e}; backing off");
            tokio::time::sleep(*backoff).await;
            *backoff = (*backoff * 2).min(config.max_backoff);
            Vec::new()
        }
    }
}

async fn ack_or_warn(bus: &dyn MessageBus, stream: &str, group: &str, entry_id: u64) {
    if let Err(e) = bus.ack(stream, group, entry_id).await {
        // The work is done; a failed ack only risks one redelivery.
        warn!(stream, entry_id, "Ack failed: {e}");
    }
}
