//! Connector router — the seam between channels and the ticket pipeline.
//!
//! Owns the connector registry, consumes normalized connector events, applies
//! the one-open-ticket-per-conversation invariant, and enqueues pipeline
//! work. Inbound handling never propagates downstream failures back into a
//! channel; everything is logged and the poll loops keep running.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{MessageBus, STREAM_TICKET_PROCESSING, TicketProcessingJob, enqueue};
use crate::connectors::{Connector, ConnectorEvent, HealthSnapshot, InboundEvent, SendOptions};
use crate::error::{ChannelError, DatabaseError, Error, Result};
use crate::model::{Message, SenderType, Ticket, TicketSource, TicketStatus};
use crate::store::{FeedbackRecord, TicketStore};

/// Aggregate channel health. Healthy only when every connector is.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouterHealth {
    pub healthy: bool,
    pub connectors: Vec<HealthSnapshot>,
}

pub struct ConnectorRouter {
    connectors: HashMap<TicketSource, Arc<dyn Connector>>,
    store: Arc<dyn TicketStore>,
    bus: Arc<dyn MessageBus>,
}

impl ConnectorRouter {
    pub fn new(store: Arc<dyn TicketStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            connectors: HashMap::new(),
            store,
            bus,
        }
    }

    /// Register a connector. Registering the same source twice replaces the
    /// previous instance.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        let source = connector.name();
        if self.connectors.insert(source, connector).is_some() {
            warn!(source = %source, "Connector re-registered; previous instance replaced");
        } else {
            info!(source = %source, "Connector registered");
        }
    }

    fn connector(&self, source: TicketSource) -> Result<&Arc<dyn Connector>> {
        self.connectors
            .get(&source)
            .ok_or_else(|| {
                Error::Channel(ChannelError::UnknownSource {
                    channel: source.to_string(),
                })
            })
    }

    /// Consume connector events until the channel closes.
    pub async fn run(&self, mut rx: mpsc::Receiver<ConnectorEvent>) {
        info!("Router consuming connector events");
        while let Some(event) = rx.recv().await {
            match event {
                ConnectorEvent::Inbound(inbound) => self.handle_incoming(inbound).await,
                ConnectorEvent::Confirmation {
                    source,
                    source_id,
                    accepted,
                } => {
                    if let Err(e) = self.handle_confirmation(source, &source_id, accepted).await {
                        error!(source = %source, "Confirmation handling failed: {e}");
                    }
                }
                ConnectorEvent::Feedback {
                    source,
                    source_id,
                    rating,
                    comment,
                } => {
                    if let Err(e) = self
                        .handle_feedback(source, &source_id, rating, comment)
                        .await
                    {
                        error!(source = %source, "Feedback handling failed: {e}");
                    }
                }
                ConnectorEvent::StatusQuery { source, source_id } => {
                    self.handle_status_query(source, &source_id).await;
                }
            }
        }
        info!("Connector event channel closed; router stopping");
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Route one inbound message. Infallible by design: a failing store or
    /// bus must not wedge a channel's poll loop.
    pub async fn handle_incoming(&self, event: InboundEvent) {
        if let Err(e) = self.store.upsert_contact(&event.user).await {
            warn!(source = %event.source, "Contact upsert failed: {e}");
        }

        let existing = match self
            .store
            .find_open_ticket(event.source, &event.source_id)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                error!(source = %event.source, "Open-ticket lookup failed: {e}");
                return;
            }
        };

        let (ticket_id, is_new) = match existing {
            Some(mut ticket) => {
                let message = Message::new(
                    ticket.id,
                    &event.user.source_user_id,
                    SenderType::User,
                    &event.body,
                )
                .with_attachments(event.attachments.clone());
                if let Err(e) = self.store.append_message(&message).await {
                    error!(ticket_id = %ticket.id, "Message append failed: {e}");
                    return;
                }

                // A reply from the user takes the ticket off the waiting
                // shelf.
                if ticket.status == TicketStatus::WaitingUser {
                    ticket.status = TicketStatus::InProgress;
                    if let Err(e) = self.store.update_ticket(&ticket).await {
                        error!(ticket_id = %ticket.id, "Status flip failed: {e}");
                    }
                }
                info!(ticket_id = %ticket.id, source = %event.source, "Message appended to open ticket");
                (ticket.id, false)
            }
            None => {
                let ticket = Ticket::new(
                    event.source,
                    event.source_id.clone(),
                    event.subject.clone(),
                    event.body.clone(),
                );
                if let Err(e) = self.store.create_ticket(&ticket).await {
                    error!(source = %event.source, "Ticket create failed: {e}");
                    return;
                }
                let message = Message::new(
                    ticket.id,
                    &event.user.source_user_id,
                    SenderType::User,
                    &event.body,
                )
                .with_attachments(event.attachments.clone());
                if let Err(e) = self.store.append_message(&message).await {
                    error!(ticket_id = %ticket.id, "Initial message append failed: {e}");
                }
                info!(ticket_id = %ticket.id, source = %event.source, "Ticket created");

                // Best-effort acknowledgement; a failed ack never blocks
                // ingestion.
                self.send_ack(&event, &ticket).await;
                (ticket.id, true)
            }
        };

        let job = TicketProcessingJob::new(ticket_id, is_new, event.source);
        if let Err(e) = enqueue(self.bus.as_ref(), STREAM_TICKET_PROCESSING, &job).await {
            error!(ticket_id = %ticket_id, "Processing job enqueue failed: {e}");
        }
    }

    async fn send_ack(&self, event: &InboundEvent, ticket: &Ticket) {
        let Ok(connector) = self.connector(event.source) else {
            return;
        };
        let short_id = &ticket.id.to_string()[..8];
        let ack = format!(
            "We received your request and created ticket #{short_id}. \
             Our team will get back to you shortly."
        );
        if let Err(e) = connector
            .send_message(&event.source_id, &ack, &SendOptions::default())
            .await
        {
            warn!(ticket_id = %ticket.id, "Ticket ack send failed: {e}");
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Deliver a reply for a ticket. Errors propagate so the sender worker
    /// leaves the queue entry unacked.
    pub async fn send_response(
        &self,
        ticket_id: Uuid,
        text: &str,
        opts: &SendOptions,
    ) -> Result<()> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| Error::Database(DatabaseError::ticket_not_found(ticket_id)))?;
        let connector = self.connector(ticket.source)?;

        let formatted = format_response(&ticket, text, opts);
        connector
            .send_message(&ticket.source_conversation_id, &formatted, opts)
            .await?;

        let (sender_type, sender_id) = match &opts.operator_name {
            Some(name) => (SenderType::Operator, name.clone()),
            None => (SenderType::Bot, "pipeline".to_string()),
        };
        let record = Message::new(ticket_id, sender_id, sender_type, text);
        self.store.append_message(&record).await?;
        info!(ticket_id = %ticket_id, auto = opts.is_auto_response, "Response delivered");
        Ok(())
    }

    /// Deliver a resolution notice. Same error discipline as
    /// [`Self::send_response`].
    pub async fn notify_resolved(&self, ticket_id: Uuid, resolution: &str) -> Result<()> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| Error::Database(DatabaseError::ticket_not_found(ticket_id)))?;
        let connector = self.connector(ticket.source)?;

        let text = format!(
            "Your ticket \"{}\" has been resolved.\n\n{resolution}",
            ticket.subject
        );
        let text = with_subject_for_email(&ticket, &text);
        connector
            .send_message(&ticket.source_conversation_id, &text, &SendOptions::default())
            .await?;

        let record = Message::new(ticket_id, "system", SenderType::System, resolution);
        self.store.append_message(&record).await?;
        info!(ticket_id = %ticket_id, "Resolution notice delivered");
        Ok(())
    }

    // ── Signals ─────────────────────────────────────────────────────

    /// Apply a user's yes/no answer to the confirmation prompt. Signals
    /// arrive with only a conversation id, so they attach to the most recent
    /// ticket regardless of status.
    pub async fn handle_confirmation(
        &self,
        source: TicketSource,
        source_id: &str,
        accepted: bool,
    ) -> Result<()> {
        let Some(mut ticket) = self.store.find_latest_ticket(source, source_id).await? else {
            warn!(source = %source, "Confirmation with no matching ticket");
            return Ok(());
        };

        if accepted {
            ticket.status = TicketStatus::Resolved;
            ticket.resolved_by = Some("auto-confirmed".to_string());
            ticket.resolved_at = Some(Utc::now());
            if ticket.resolution_text.is_none() {
                ticket.resolution_text = ticket.suggested_response.clone();
            }
            self.store.update_ticket(&ticket).await?;
            info!(ticket_id = %ticket.id, "Ticket resolved by user confirmation");
        } else {
            ticket.status = TicketStatus::InProgress;
            self.store.update_ticket(&ticket).await?;
            let note = Message::new(
                ticket.id,
                "system",
                SenderType::System,
                "User reported the automated suggestion did not resolve the issue.",
            );
            self.store.append_message(&note).await?;
            info!(ticket_id = %ticket.id, "Automation declined; ticket routed to operators");
        }
        Ok(())
    }

    pub async fn handle_feedback(
        &self,
        source: TicketSource,
        source_id: &str,
        rating: u8,
        comment: Option<String>,
    ) -> Result<()> {
        let Some(ticket) = self.store.find_latest_ticket(source, source_id).await? else {
            warn!(source = %source, "Feedback with no matching ticket");
            return Ok(());
        };
        self.store
            .record_feedback(&FeedbackRecord {
                ticket_id: ticket.id,
                rating,
                comment,
                created_at: Utc::now(),
            })
            .await?;
        info!(ticket_id = %ticket.id, rating, "Feedback recorded");
        Ok(())
    }

    /// Best-effort status reply.
    pub async fn handle_status_query(&self, source: TicketSource, source_id: &str) {
        let reply = match self.store.find_latest_ticket(source, source_id).await {
            Ok(Some(ticket)) => format!(
                "Ticket #{}: {} (status: {})",
                &ticket.id.to_string()[..8],
                ticket.subject,
                ticket.status
            ),
            Ok(None) => "You have no tickets yet.".to_string(),
            Err(e) => {
                error!(source = %source, "Status lookup failed: {e}");
                return;
            }
        };
        let Ok(connector) = self.connector(source) else {
            return;
        };
        if let Err(e) = connector
            .send_message(source_id, &reply, &SendOptions::default())
            .await
        {
            warn!(source = %source, "Status reply failed: {e}");
        }
    }

    // ── Health ──────────────────────────────────────────────────────

    pub fn health_check(&self) -> RouterHealth {
        let connectors: Vec<HealthSnapshot> =
            self.connectors.values().map(|c| c.health()).collect();
        RouterHealth {
            healthy: connectors.iter().all(|h| h.healthy),
            connectors,
        }
    }
}

// ── Formatting ──────────────────────────────────────────────────────

/// Compose the channel-facing reply text. Auto responses carry a citations
/// footer; operator responses are signed. Channel-specific confirmation
/// affordances are attached by the connectors themselves.
fn format_response(ticket: &Ticket, text: &str, opts: &SendOptions) -> String {
    let mut out = text.to_string();
    if opts.is_auto_response {
        if !opts.kb_refs.is_empty() {
            out.push_str("\n\nSources:\n");
            for kb_ref in &opts.kb_refs {
                out.push_str(&format!("  - {kb_ref}\n"));
            }
        }
    } else if let Some(name) = &opts.operator_name {
        out.push_str(&format!("\n\n— {name}, support team"));
    }
    with_subject_for_email(ticket, &out)
}

/// Email replies thread under the original subject via the
/// `Subject: ...` first-line convention the mailbox connector understands.
fn with_subject_for_email(ticket: &Ticket, text: &str) -> String {
    if ticket.source == TicketSource::Email {
        format!("Subject: Re: {}\n{text}", ticket.subject)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::watch;

    use crate::bus::{GROUP_PROCESSORS, MemoryBus};
    use crate::connectors::SessionState;
    use crate::store::{ContactRef, MemoryStore};

    struct MockConnector {
        source: TicketSource,
        connected: bool,
        sent: tokio::sync::Mutex<Vec<(String, String, SendOptions)>>,
        session_tx: watch::Sender<SessionState>,
    }

    impl MockConnector {
        fn new(source: TicketSource) -> Self {
            let (session_tx, _) = watch::channel(SessionState::Connected);
            Self {
                source,
                connected: true,
                sent: tokio::sync::Mutex::new(Vec::new()),
                session_tx,
            }
        }

        fn disconnected(source: TicketSource) -> Self {
            let mut c = Self::new(source);
            c.connected = false;
            c
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn name(&self) -> TicketSource {
            self.source
        }

        async fn start(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn send_message(
            &self,
            recipient_id: &str,
            text: &str,
            opts: &SendOptions,
        ) -> std::result::Result<(), ChannelError> {
            if !self.connected {
                return Err(ChannelError::NotConnected {
                    name: self.source.to_string(),
                });
            }
            self.sent
                .lock()
                .await
                .push((recipient_id.to_string(), text.to_string(), opts.clone()));
            Ok(())
        }

        fn health(&self) -> HealthSnapshot {
            if self.connected {
                HealthSnapshot::healthy(self.source)
            } else {
                HealthSnapshot::unhealthy(self.source, "disconnected", "mock down")
            }
        }

        fn session(&self) -> watch::Receiver<SessionState> {
            self.session_tx.subscribe()
        }
    }

    fn inbound(source: TicketSource, source_id: &str, body: &str) -> InboundEvent {
        InboundEvent {
            source,
            source_id: source_id.to_string(),
            user: ContactRef {
                source,
                source_user_id: source_id.to_string(),
                name: Some("Ivan".into()),
                email: None,
                phone: None,
            },
            subject: body.lines().next().unwrap_or_default().to_string(),
            body: body.to_string(),
            attachments: Vec::new(),
            raw: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    struct Fixture {
        router: ConnectorRouter,
        store: Arc<MemoryStore>,
        bus: Arc<MemoryBus>,
        connector: Arc<MockConnector>,
    }

    async fn fixture(connector: MockConnector) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        bus.ensure_group(STREAM_TICKET_PROCESSING, GROUP_PROCESSORS)
            .await
            .unwrap();
        let connector = Arc::new(connector);
        let mut router = ConnectorRouter::new(store.clone(), bus.clone());
        router.register(connector.clone());
        Fixture {
            router,
            store,
            bus,
            connector,
        }
    }

    #[tokio::test]
    async fn first_message_creates_ticket_with_ack_and_job() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "VPN не работает"))
            .await;

        let ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::New);
        assert_eq!(ticket.body, "VPN не работает");

        let messages = f.store.list_messages(ticket.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_type, SenderType::User);

        let sent = f.connector.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("created ticket"));

        let entries = f
            .bus
            .read_group(
                STREAM_TICKET_PROCESSING,
                GROUP_PROCESSORS,
                "t",
                10,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let job: TicketProcessingJob = entries[0].decode().unwrap();
        assert_eq!(job.ticket_id, ticket.id);
        assert!(job.is_new);
    }

    #[tokio::test]
    async fn second_message_reuses_the_open_ticket() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "first"))
            .await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "second"))
            .await;

        assert_eq!(f.store.ticket_count().await, 1);
        let ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();
        let messages = f.store.list_messages(ticket.id).await.unwrap();
        assert_eq!(messages.len(), 2);

        // Only the first message triggers an ack.
        assert_eq!(f.connector.sent.lock().await.len(), 1);

        let entries = f
            .bus
            .read_group(
                STREAM_TICKET_PROCESSING,
                GROUP_PROCESSORS,
                "t",
                10,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        let second: TicketProcessingJob = entries[1].decode().unwrap();
        assert!(!second.is_new);
    }

    #[tokio::test]
    async fn reply_flips_waiting_user_to_in_progress() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "help"))
            .await;
        let mut ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();
        ticket.status = TicketStatus::WaitingUser;
        f.store.update_ticket(&ticket).await.unwrap();

        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "still broken"))
            .await;
        let ticket = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn resolved_ticket_gets_a_fresh_one() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "first issue"))
            .await;
        let mut ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();
        ticket.status = TicketStatus::Resolved;
        f.store.update_ticket(&ticket).await.unwrap();

        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "new issue"))
            .await;
        assert_eq!(f.store.ticket_count().await, 2);
    }

    #[tokio::test]
    async fn failed_ack_does_not_block_ticket_creation() {
        let f = fixture(MockConnector::disconnected(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "help"))
            .await;
        assert_eq!(f.store.ticket_count().await, 1);
        let entries = f
            .bus
            .read_group(
                STREAM_TICKET_PROCESSING,
                GROUP_PROCESSORS,
                "t",
                10,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn send_response_formats_and_records_bot_message() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "vpn down"))
            .await;
        let ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();

        f.router
            .send_response(
                ticket.id,
                "Try restarting the VPN client.",
                &SendOptions::auto(vec!["KB-101: VPN troubleshooting".into()]),
            )
            .await
            .unwrap();

        let sent = f.connector.sent.lock().await;
        let auto = sent.last().unwrap();
        assert!(auto.1.contains("Try restarting"));
        assert!(auto.1.contains("KB-101"));
        assert!(auto.2.is_auto_response);

        let messages = f.store.list_messages(ticket.id).await.unwrap();
        assert_eq!(messages.last().unwrap().sender_type, SenderType::Bot);
    }

    #[tokio::test]
    async fn operator_response_is_signed() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "hi"))
            .await;
        let ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();

        f.router
            .send_response(ticket.id, "We replaced the cable.", &SendOptions::operator("Dana"))
            .await
            .unwrap();

        let sent = f.connector.sent.lock().await;
        assert!(sent.last().unwrap().1.contains("Dana, support team"));
        let messages = f.store.list_messages(ticket.id).await.unwrap();
        assert_eq!(messages.last().unwrap().sender_type, SenderType::Operator);
    }

    #[tokio::test]
    async fn email_responses_thread_under_original_subject() {
        let f = fixture(MockConnector::new(TicketSource::Email)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Email, "u@x.com", "Printer broken"))
            .await;
        let ticket = f
            .store
            .find_open_ticket(TicketSource::Email, "u@x.com")
            .await
            .unwrap()
            .unwrap();

        f.router
            .send_response(ticket.id, "Please power-cycle it.", &SendOptions::default())
            .await
            .unwrap();
        let sent = f.connector.sent.lock().await;
        assert!(sent.last().unwrap().1.starts_with("Subject: Re: Printer broken\n"));
    }

    #[tokio::test]
    async fn send_response_errors_propagate_for_redelivery() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        let err = f
            .router
            .send_response(Uuid::new_v4(), "text", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Database(DatabaseError::NotFound { .. })
        ));

        // Unknown source: ticket exists but no connector registered.
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let router = ConnectorRouter::new(store.clone(), bus);
        let ticket = Ticket::new(TicketSource::Whatsapp, "79001", "s", "b");
        store.create_ticket(&ticket).await.unwrap();
        let err = router
            .send_response(ticket.id, "text", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Channel(ChannelError::UnknownSource { .. })
        ));
    }

    #[tokio::test]
    async fn confirmation_yes_resolves_no_reopens() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "vpn down"))
            .await;
        let mut ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();
        ticket.status = TicketStatus::DraftPending;
        ticket.suggested_response = Some("Restart the client.".into());
        f.store.update_ticket(&ticket).await.unwrap();

        f.router
            .handle_confirmation(TicketSource::Telegram, "123", true)
            .await
            .unwrap();
        let resolved = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, TicketStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("auto-confirmed"));
        assert_eq!(
            resolved.resolution_text.as_deref(),
            Some("Restart the client.")
        );
        assert!(resolved.resolved_at.is_some());

        // Declined confirmation on the (now latest) ticket reopens it.
        f.router
            .handle_confirmation(TicketSource::Telegram, "123", false)
            .await
            .unwrap();
        let reopened = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(reopened.status, TicketStatus::InProgress);
        let messages = f.store.list_messages(ticket.id).await.unwrap();
        assert_eq!(messages.last().unwrap().sender_type, SenderType::System);
    }

    #[tokio::test]
    async fn feedback_lands_on_latest_ticket_even_after_resolution() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "vpn down"))
            .await;
        let mut ticket = f
            .store
            .find_open_ticket(TicketSource::Telegram, "123")
            .await
            .unwrap()
            .unwrap();
        ticket.status = TicketStatus::Resolved;
        f.store.update_ticket(&ticket).await.unwrap();

        f.router
            .handle_feedback(TicketSource::Telegram, "123", 5, None)
            .await
            .unwrap();
        assert_eq!(f.store.feedback_count().await, 1);
    }

    #[tokio::test]
    async fn status_query_gets_a_reply() {
        let f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        f.router
            .handle_incoming(inbound(TicketSource::Telegram, "123", "vpn down"))
            .await;
        f.router
            .handle_status_query(TicketSource::Telegram, "123")
            .await;
        let sent = f.connector.sent.lock().await;
        assert!(sent.last().unwrap().1.contains("status: new"));
    }

    #[tokio::test]
    async fn health_aggregates_across_connectors() {
        let mut f = fixture(MockConnector::new(TicketSource::Telegram)).await;
        assert!(f.router.health_check().healthy);
        f.router
            .register(Arc::new(MockConnector::disconnected(TicketSource::Whatsapp)));
        let health = f.router.health_check();
        assert!(!health.healthy);
        assert_eq!(health.connectors.len(), 2);
    }
}
