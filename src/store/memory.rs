//! In-memory `TicketStore` backend, used by tests and small deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{Message, NlpResult, Ticket, TicketSource};
use crate::store::traits::{AuditRecord, ContactRef, FeedbackRecord, TicketStore};

#[derive(Default)]
struct Inner {
    tickets: HashMap<Uuid, Ticket>,
    messages: Vec<Message>,
    nlp_results: HashMap<Uuid, NlpResult>,
    audit: Vec<AuditRecord>,
    feedback: Vec<FeedbackRecord>,
    contacts: HashMap<(TicketSource, String), ContactRef>,
    cursors: HashMap<String, String>,
}

/// RwLock-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: number of tickets ever created.
    pub async fn ticket_count(&self) -> usize {
        self.inner.read().await.tickets.len()
    }

    /// Test helper: number of stored feedback records.
    pub async fn feedback_count(&self) -> usize {
        self.inner.read().await.feedback.len()
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        inner.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, DatabaseError> {
        Ok(self.inner.read().await.tickets.get(&id).cloned())
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        if !inner.tickets.contains_key(&ticket.id) {
            return Err(DatabaseError::ticket_not_found(ticket.id));
        }
        inner.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn find_open_ticket(
        &self,
        source: TicketSource,
        source_conversation_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tickets
            .values()
            .filter(|t| {
                t.source == source
                    && t.source_conversation_id == source_conversation_id
                    && t.status.is_open()
            })
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn find_latest_ticket(
        &self,
        source: TicketSource,
        source_conversation_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tickets
            .values()
            .filter(|t| t.source == source && t.source_conversation_id == source_conversation_id)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn append_message(&self, message: &Message) -> Result<(), DatabaseError> {
        self.inner.write().await.messages.push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, ticket_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut msgs: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.ticket_id == ticket_id)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.created_at);
        Ok(msgs)
    }

    async fn upsert_nlp_result(&self, result: &NlpResult) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .nlp_results
            .insert(result.ticket_id, result.clone());
        Ok(())
    }

    async fn get_nlp_result(&self, ticket_id: Uuid) -> Result<Option<NlpResult>, DatabaseError> {
        Ok(self.inner.read().await.nlp_results.get(&ticket_id).cloned())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), DatabaseError> {
        self.inner.write().await.audit.push(record.clone());
        Ok(())
    }

    async fn list_audit(&self, ticket_id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit
            .iter()
            .filter(|a| a.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), DatabaseError> {
        self.inner.write().await.feedback.push(record.clone());
        Ok(())
    }

    async fn upsert_contact(&self, contact: &ContactRef) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .contacts
            .insert((contact.source, contact.source_user_id.clone()), contact.clone());
        Ok(())
    }

    async fn get_contact(
        &self,
        source: TicketSource,
        source_user_id: &str,
    ) -> Result<Option<ContactRef>, DatabaseError> {
        Ok(self
            .inner
            .read()
            .await
            .contacts
            .get(&(source, source_user_id.to_string()))
            .cloned())
    }

    async fn get_channel_cursor(&self, channel: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.inner.read().await.cursors.get(channel).cloned())
    }

    async fn set_channel_cursor(&self, channel: &str, value: &str) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .cursors
            .insert(channel.to_string(), value.to_string());
        Ok(())
    }
}
