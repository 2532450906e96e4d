//! WhatsApp connector over a QR-authenticated HTTP gateway.
//!
//! The gateway (WAHA-style) owns the actual WhatsApp session; we drive it
//! through a status poll loop and mirror its lifecycle into our session FSM:
//!
//! ```text
//! Disconnected -> AwaitingManualAuth -> Authenticating -> Connected
//!       ^                                                    |
//!       +----------------- logout / invalidation ------------+
//! ```
//!
//! The QR artifact only exists while `AwaitingManualAuth` and is refreshed
//! when it outlives its TTL. An irrecoverable auth failure parks the
//! connector in `Disconnected` with an unhealthy snapshot; it never crashes
//! the process.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::WhatsappConfig;
use crate::connectors::connector::{
    Connector, ConnectorEvent, HealthSnapshot, InboundEvent, SendOptions, SessionState,
};
use crate::error::ChannelError;
use crate::model::TicketSource;
use crate::store::ContactRef;

pub struct WhatsappConnector {
    config: WhatsappConfig,
    client: reqwest::Client,
    events: mpsc::Sender<ConnectorEvent>,
    running: Arc<AtomicBool>,
    session_tx: watch::Sender<SessionState>,
    /// Gateway message ids already emitted, so poll overlap never
    /// double-ingests.
    seen_ids: Arc<Mutex<SeenIds>>,
}

/// Bounded dedup window over gateway message ids. The gateway serves a
/// last-50 window per poll, so a few hundred retained ids cover any overlap
/// without growing for the process lifetime.
struct SeenIds {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenIds {
    const CAPACITY: usize = 500;

    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(Self::CAPACITY),
            set: HashSet::with_capacity(Self::CAPACITY),
        }
    }

    /// Returns false when the id was already seen. Inserting past capacity
    /// evicts the oldest id.
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > Self::CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
        true
    }
}

impl WhatsappConnector {
    pub fn new(config: WhatsappConfig, events: mpsc::Sender<ConnectorEvent>) -> Self {
        let (session_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            client: reqwest::Client::new(),
            events,
            running: Arc::new(AtomicBool::new(false)),
            session_tx,
            seen_ids: Arc::new(Mutex::new(SeenIds::new())),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.config.gateway_url.trim_end_matches('/'));
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.config.api_key {
            req = req.header("X-Api-Key", key.expose_secret());
        }
        req
    }

    async fn gateway_status(&self) -> Result<String, ChannelError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/api/sessions/{}", self.config.session_name),
            )
            .send()
            .await
            .map_err(|e| ChannelError::AuthFailed {
                name: "whatsapp".into(),
                reason: e.to_string(),
            })?;
        let data: Value = resp.json().await.map_err(|e| ChannelError::AuthFailed {
            name: "whatsapp".into(),
            reason: e.to_string(),
        })?;
        Ok(data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string())
    }

    async fn fetch_qr(&self) -> Result<String, ChannelError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/api/{}/auth/qr?format=raw", self.config.session_name),
            )
            .send()
            .await
            .map_err(|e| ChannelError::AuthFailed {
                name: "whatsapp".into(),
                reason: e.to_string(),
            })?;
        let data: Value = resp.json().await.map_err(|e| ChannelError::AuthFailed {
            name: "whatsapp".into(),
            reason: e.to_string(),
        })?;
        data.get("value")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ChannelError::AuthFailed {
                name: "whatsapp".into(),
                reason: "gateway returned no QR payload".into(),
            })
    }

    /// Apply one gateway status onto the FSM. Returns false on an
    /// irrecoverable failure.
    async fn apply_status(&self, status: &str) -> bool {
        let current = self.session_tx.borrow().clone();
        match status {
            "SCAN_QR_CODE" => {
                let needs_qr = match &current {
                    SessionState::AwaitingManualAuth { issued_at, .. } => {
                        // Refresh the artifact once it outlives its TTL.
                        Utc::now()
                            .signed_duration_since(*issued_at)
                            .num_seconds()
                            .unsigned_abs()
                            >= self.config.qr_ttl.as_secs()
                    }
                    _ => true,
                };
                if needs_qr {
                    match self.fetch_qr().await {
                        Ok(qr) => {
                            info!("WhatsApp pairing required; QR issued");
                            let _ = self.session_tx.send(SessionState::AwaitingManualAuth {
                                qr,
                                issued_at: Utc::now(),
                            });
                        }
                        Err(e) => warn!("WhatsApp QR fetch failed: {e}"),
                    }
                }
                true
            }
            "STARTING" => {
                if !matches!(current, SessionState::Authenticating) {
                    let _ = self.session_tx.send(SessionState::Authenticating);
                }
                true
            }
            "WORKING" => {
                if !current.is_connected() {
                    info!("WhatsApp session connected");
                    let _ = self.session_tx.send(SessionState::Connected);
                }
                true
            }
            "FAILED" => {
                warn!("WhatsApp session failed irrecoverably");
                let _ = self.session_tx.send(SessionState::Disconnected);
                false
            }
            other => {
                if current.is_connected() {
                    warn!(status = other, "WhatsApp session invalidated");
                }
                let _ = self.session_tx.send(SessionState::Disconnected);
                true
            }
        }
    }

    async fn poll_messages(&self) {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/api/{}/messages?limit=50&downloadMedia=false",
                    self.config.session_name
                ),
            )
            .send()
            .await;
        let data: Value = match resp {
            Ok(r) => match r.json().await {
                Ok(d) => d,
                Err(e) => {
                    warn!("WhatsApp message parse error: {e}");
                    return;
                }
            },
            Err(e) => {
                warn!("WhatsApp message poll error: {e}");
                return;
            }
        };

        let Some(messages) = data.as_array() else {
            return;
        };
        for raw in messages {
            let Some(id) = raw.get("id").and_then(Value::as_str) else {
                continue;
            };
            if !self.seen_ids.lock().await.insert(id) {
                continue;
            }
            let Some(event) = normalize_gateway_message(raw) else {
                continue;
            };
            if self.events.send(event).await.is_err() {
                info!("WhatsApp event channel closed");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[async_trait]
impl Connector for WhatsappConnector {
    fn name(&self) -> TicketSource {
        TicketSource::Whatsapp
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("WhatsApp connector already running");
            return Ok(());
        }

        // Ask the gateway to start the session; already-started is fine.
        let _ = self
            .request(reqwest::Method::POST, "/api/sessions/start")
            .json(&json!({"name": self.config.session_name}))
            .send()
            .await;

        let this = self.clone_for_task();
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                match this.gateway_status().await {
                    Ok(status) => {
                        if !this.apply_status(&status).await {
                            break;
                        }
                        if this.session_tx.borrow().is_connected() {
                            this.poll_messages().await;
                        }
                    }
                    Err(e) => {
                        warn!("WhatsApp status poll failed: {e}");
                        let _ = this.session_tx.send(SessionState::Disconnected);
                    }
                }
                tokio::time::sleep(interval).await;
            }
            let _ = this.session_tx.send(SessionState::Disconnected);
        });

        info!(session = %self.config.session_name, "WhatsApp connector started");
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.session_tx.send(SessionState::Disconnected);
        info!("WhatsApp connector stopped");
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        opts: &SendOptions,
    ) -> Result<(), ChannelError> {
        if !self.session_tx.borrow().is_connected() {
            return Err(ChannelError::NotConnected {
                name: "whatsapp".into(),
            });
        }

        let mut body = text.to_string();
        if opts.is_auto_response {
            body.push_str("\n\nReply \"yes\" if this solved your problem, \"no\" to reach an operator.");
        }

        let resp = self
            .request(reqwest::Method::POST, "/api/sendText")
            .json(&json!({
                "session": self.config.session_name,
                "chatId": recipient_id,
                "text": body,
            }))
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: format!("sendText returned {status}: {err}"),
            });
        }
        debug!(chat_id = recipient_id, "WhatsApp message sent");
        Ok(())
    }

    fn health(&self) -> HealthSnapshot {
        let state = self.session_tx.borrow().clone();
        if state.is_connected() {
            HealthSnapshot::healthy(TicketSource::Whatsapp)
        } else {
            HealthSnapshot::unhealthy(
                TicketSource::Whatsapp,
                state.label(),
                "gateway session not connected",
            )
        }
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }
}

impl WhatsappConnector {
    /// Cheap clone for the poll task. `watch::Sender` is shared via clone;
    /// the config and client are clonable.
    fn clone_for_task(&self) -> Self {
        Self {
            config: self.config.clone(),
            client: self.client.clone(),
            events: self.events.clone(),
            running: self.running.clone(),
            session_tx: self.session_tx.clone(),
            seen_ids: self.seen_ids.clone(),
        }
    }
}

// ── Message normalization ───────────────────────────────────────────

/// Map one gateway message onto a typed event. Self-authored and empty
/// messages are dropped. Bare confirmation words and bare 1..=5 ratings
/// become signals instead of inbound messages.
fn normalize_gateway_message(raw: &Value) -> Option<ConnectorEvent> {
    if raw.get("fromMe").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let body = raw.get("body").and_then(Value::as_str)?.trim();
    if body.is_empty() {
        return None;
    }
    let chat_id = raw.get("from").and_then(Value::as_str)?.to_string();

    match body.to_lowercase().as_str() {
        "yes" | "да" => {
            return Some(ConnectorEvent::Confirmation {
                source: TicketSource::Whatsapp,
                source_id: chat_id,
                accepted: true,
            });
        }
        "no" | "нет" => {
            return Some(ConnectorEvent::Confirmation {
                source: TicketSource::Whatsapp,
                source_id: chat_id,
                accepted: false,
            });
        }
        "/status" => {
            return Some(ConnectorEvent::StatusQuery {
                source: TicketSource::Whatsapp,
                source_id: chat_id,
            });
        }
        _ => {}
    }
    if body.len() == 1
        && let Some(rating) = body.chars().next().and_then(|c| c.to_digit(10))
        && (1..=5).contains(&rating)
    {
        return Some(ConnectorEvent::Feedback {
            source: TicketSource::Whatsapp,
            source_id: chat_id,
            rating: rating as u8,
            comment: None,
        });
    }

    let phone = chat_id.split('@').next().unwrap_or(&chat_id).to_string();
    let name = raw
        .get("notifyName")
        .and_then(Value::as_str)
        .map(String::from);

    Some(ConnectorEvent::Inbound(InboundEvent {
        source: TicketSource::Whatsapp,
        source_id: chat_id.clone(),
        user: ContactRef {
            source: TicketSource::Whatsapp,
            source_user_id: chat_id,
            name,
            email: None,
            phone: Some(phone),
        },
        subject: body.lines().next().unwrap_or_default().to_string(),
        body: body.to_string(),
        attachments: Vec::new(),
        raw: raw.clone(),
        timestamp: Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn test_config() -> WhatsappConfig {
        WhatsappConfig {
            gateway_url: "http://localhost:3000".into(),
            api_key: Some(SecretString::from("key")),
            session_name: "default".into(),
            poll_interval_secs: 3,
            qr_ttl: Duration::from_secs(60),
        }
    }

    fn gateway_message(body: &str) -> Value {
        json!({
            "id": "msg-1",
            "from": "79001234567@c.us",
            "fromMe": false,
            "body": body,
            "notifyName": "Ivan",
        })
    }

    #[test]
    fn inbound_message_normalizes_with_phone_identity() {
        let event = normalize_gateway_message(&gateway_message("Не могу войти в аккаунт")).unwrap();
        let ConnectorEvent::Inbound(inbound) = event else {
            panic!("expected inbound");
        };
        assert_eq!(inbound.source, TicketSource::Whatsapp);
        assert_eq!(inbound.source_id, "79001234567@c.us");
        assert_eq!(inbound.user.phone.as_deref(), Some("79001234567"));
        assert_eq!(inbound.user.name.as_deref(), Some("Ivan"));
    }

    #[test]
    fn self_authored_and_empty_messages_are_dropped() {
        let mut own = gateway_message("hello");
        own["fromMe"] = json!(true);
        assert!(normalize_gateway_message(&own).is_none());
        assert!(normalize_gateway_message(&gateway_message("   ")).is_none());
    }

    #[test]
    fn bare_confirmations_and_ratings_become_signals() {
        assert!(matches!(
            normalize_gateway_message(&gateway_message("Yes")).unwrap(),
            ConnectorEvent::Confirmation { accepted: true, .. }
        ));
        assert!(matches!(
            normalize_gateway_message(&gateway_message("нет")).unwrap(),
            ConnectorEvent::Confirmation { accepted: false, .. }
        ));
        assert!(matches!(
            normalize_gateway_message(&gateway_message("5")).unwrap(),
            ConnectorEvent::Feedback { rating: 5, .. }
        ));
        // 0 and 9 are ordinary messages, not ratings
        assert!(matches!(
            normalize_gateway_message(&gateway_message("9")).unwrap(),
            ConnectorEvent::Inbound(_)
        ));
    }

    #[tokio::test]
    async fn qr_state_carries_artifact_and_leaves_with_state() {
        let (tx, _rx) = mpsc::channel(8);
        let connector = WhatsappConnector::new(test_config(), tx);
        let mut session = connector.session();

        // Late subscriber sees current state first.
        assert_eq!(*session.borrow_and_update(), SessionState::Disconnected);

        connector
            .session_tx
            .send(SessionState::AwaitingManualAuth {
                qr: "qr-payload".into(),
                issued_at: Utc::now(),
            })
            .unwrap();
        session.changed().await.unwrap();
        let SessionState::AwaitingManualAuth { qr, .. } = session.borrow_and_update().clone()
        else {
            panic!("expected awaiting state");
        };
        assert_eq!(qr, "qr-payload");

        // Artifact gone once the state moves on.
        connector.session_tx.send(SessionState::Connected).unwrap();
        session.changed().await.unwrap();
        assert!(session.borrow().is_connected());
    }

    #[test]
    fn seen_ids_dedup_and_evict_oldest_at_capacity() {
        let mut seen = SeenIds::new();
        assert!(seen.insert("msg-1"));
        assert!(!seen.insert("msg-1"));

        for i in 0..SeenIds::CAPACITY {
            seen.insert(&format!("fill-{i}"));
        }
        assert_eq!(seen.set.len(), SeenIds::CAPACITY);
        assert_eq!(seen.order.len(), SeenIds::CAPACITY);
        // The oldest id was evicted and would be treated as new again.
        assert!(seen.insert("msg-1"));
    }

    #[tokio::test]
    async fn send_fails_when_disconnected() {
        let (tx, _rx) = mpsc::channel(8);
        let connector = WhatsappConnector::new(test_config(), tx);
        let err = connector
            .send_message("79001234567@c.us", "hi", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected { .. }));
        let health = connector.health();
        assert!(!health.healthy);
        assert_eq!(health.state, "disconnected");
    }
}
