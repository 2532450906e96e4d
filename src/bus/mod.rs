//! Durable message bus with consumer-group semantics.
//!
//! Streams are append-only logs of JSON payloads. A consumer group tracks a
//! delivery cursor per stream; each entry is delivered to exactly one consumer
//! in the group and stays pending until acknowledged. Unacknowledged entries
//! are redelivered to the same consumer on its next read, so a crashed worker
//! picks its work back up on restart under the same consumer name.

pub mod libsql;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connectors::SendOptions;
use crate::error::QueueError;
use crate::model::TicketSource;

pub use libsql::LibSqlBus;
pub use memory::MemoryBus;

// ── Streams and groups ──────────────────────────────────────────────

/// Jobs for the triage pipeline.
pub const STREAM_TICKET_PROCESSING: &str = "ticket_processing";
/// Replies and prompts waiting to be sent out on a channel.
pub const STREAM_OUTBOUND_MESSAGES: &str = "outbound_messages";
/// Resolution announcements fanned out to the originating channel.
pub const STREAM_RESOLUTION_NOTIFICATIONS: &str = "resolution_notifications";

pub const GROUP_PROCESSORS: &str = "processors";
pub const GROUP_SENDERS: &str = "senders";

// ── Payloads ────────────────────────────────────────────────────────

/// One unit of pipeline work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketProcessingJob {
    pub ticket_id: Uuid,
    /// True when a new user message triggered the job. Re-runs of already
    /// classified tickets are skipped unless set.
    pub is_new: bool,
    pub source: TicketSource,
    pub timestamp: DateTime<Utc>,
}

impl TicketProcessingJob {
    pub fn new(ticket_id: Uuid, is_new: bool, source: TicketSource) -> Self {
        Self {
            ticket_id,
            is_new,
            source,
            timestamp: Utc::now(),
        }
    }
}

/// A reply queued for delivery on a channel conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub ticket_id: Uuid,
    pub source: TicketSource,
    pub source_id: String,
    pub message: String,
    pub options: SendOptions,
}

/// Announcement that a ticket was resolved, delivered back to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionNotification {
    pub ticket_id: Uuid,
    pub resolution: String,
}

// ── Trait ───────────────────────────────────────────────────────────

/// One delivered stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: u64,
    pub payload: serde_json::Value,
}

impl QueueEntry {
    /// Deserialize the payload into a concrete job type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Append/read/ack interface over a durable stream backend.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a payload; returns the assigned entry id (monotonic per stream).
    async fn append(&self, stream: &str, payload: &serde_json::Value)
    -> Result<u64, QueueError>;

    /// Create a consumer group if it does not exist. Idempotent. New groups
    /// start at the current stream tail and only see later entries.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError>;

    /// Read up to `count` entries for `consumer`: first its own unacked
    /// deliveries, then new entries past the group cursor. Blocks up to
    /// `block` when nothing is available. Errors with
    /// [`QueueError::NoSuchGroup`] when the group is missing.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Acknowledge a delivered entry. Errors with [`QueueError::NotPending`]
    /// when the entry is not in the group's pending set.
    async fn ack(&self, stream: &str, group: &str, entry_id: u64) -> Result<(), QueueError>;

    /// Number of delivered-but-unacked entries for a group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, QueueError>;
}

/// Serialize and append a typed job.
pub async fn enqueue<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    stream: &str,
    job: &T,
) -> Result<u64, QueueError> {
    let payload = serde_json::to_value(job)?;
    bus.append(stream, &payload).await
}
