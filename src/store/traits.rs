//! Unified `TicketStore` trait — single async interface for all persistence
//! the pipeline needs: tickets, messages, NLP results, audit, feedback,
//! contacts, and per-channel cursors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{Message, NlpResult, Ticket, TicketSource};

/// Channel-scoped user identity, resolved or created on every inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRef {
    pub source: TicketSource,
    pub source_user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One row in the processing audit log.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub ticket_id: Uuid,
    pub action: String,
    pub detail: String,
    pub elapsed_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(ticket_id: Uuid, action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            ticket_id,
            action: action.into(),
            detail: detail.into(),
            elapsed_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_elapsed(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }
}

/// A user rating of a resolution.
#[derive(Debug, Clone)]
pub struct FeedbackRecord {
    pub ticket_id: Uuid,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait TicketStore: Send + Sync {
    // ── Tickets ─────────────────────────────────────────────────────

    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError>;

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, DatabaseError>;

    /// Full-row update keyed by id. Tickets are never deleted.
    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError>;

    /// The routing invariant: at most one open ticket per
    /// (source, source_conversation_id). Resolved/closed rows are excluded.
    async fn find_open_ticket(
        &self,
        source: TicketSource,
        source_conversation_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError>;

    /// Most recent ticket for a conversation regardless of status. Used to
    /// attribute out-of-band feedback/confirmations that arrive after
    /// resolution.
    async fn find_latest_ticket(
        &self,
        source: TicketSource,
        source_conversation_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(&self, message: &Message) -> Result<(), DatabaseError>;

    /// Messages for a ticket in creation order.
    async fn list_messages(&self, ticket_id: Uuid) -> Result<Vec<Message>, DatabaseError>;

    // ── NLP results ─────────────────────────────────────────────────

    /// Full replace — an NLP result is regenerated wholesale per pass.
    async fn upsert_nlp_result(&self, result: &NlpResult) -> Result<(), DatabaseError>;

    async fn get_nlp_result(&self, ticket_id: Uuid) -> Result<Option<NlpResult>, DatabaseError>;

    // ── Audit / feedback ────────────────────────────────────────────

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), DatabaseError>;

    async fn list_audit(&self, ticket_id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError>;

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    async fn upsert_contact(&self, contact: &ContactRef) -> Result<(), DatabaseError>;

    async fn get_contact(
        &self,
        source: TicketSource,
        source_user_id: &str,
    ) -> Result<Option<ContactRef>, DatabaseError>;

    // ── Channel cursors ─────────────────────────────────────────────

    /// High-water mark for a polled channel (e.g. mailbox UID).
    async fn get_channel_cursor(&self, channel: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_channel_cursor(&self, channel: &str, value: &str) -> Result<(), DatabaseError>;
}
