//! The `Connector` abstraction and the normalized event types every channel
//! produces.
//!
//! Connectors are constructed with an `mpsc::Sender<ConnectorEvent>`; the
//! router owns the receiving end. Each connector normalizes its channel's
//! native payloads into these types and filters noise (empty bodies,
//! self-authored messages, auto-replies) before emitting anything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ChannelError;
use crate::model::{Attachment, TicketSource};
use crate::store::ContactRef;

/// Connector session lifecycle. Only QR-authenticated channels pass through
/// the middle states; bot-token and mailbox channels jump straight to
/// `Connected`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Disconnected,
    /// Waiting for a human to scan the pairing QR. The artifact is only
    /// valid while in this state.
    AwaitingManualAuth { qr: String, issued_at: DateTime<Utc> },
    Authenticating,
    Connected,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Label for logs and status replies.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::AwaitingManualAuth { .. } => "awaiting_manual_auth",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        }
    }
}

/// Point-in-time connector health. Reporting never fails; a broken channel
/// shows up as `healthy: false` with a reason.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub source: TicketSource,
    pub healthy: bool,
    pub state: String,
    pub detail: Option<String>,
}

impl HealthSnapshot {
    pub fn healthy(source: TicketSource) -> Self {
        Self {
            source,
            healthy: true,
            state: "connected".to_string(),
            detail: None,
        }
    }

    pub fn unhealthy(source: TicketSource, state: &str, detail: impl Into<String>) -> Self {
        Self {
            source,
            healthy: false,
            state: state.to_string(),
            detail: Some(detail.into()),
        }
    }
}

/// Delivery options attached to an outbound send. Serialized into queue
/// payloads, so connectors downstream of the bus see the same options the
/// router computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// Pipeline-drafted reply. Channels attach their confirmation
    /// affordance (inline keyboard, reply prompt) when set.
    pub is_auto_response: bool,
    /// Present for operator-authored replies; used for signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_name: Option<String>,
    /// Knowledge-base citations appended as a footer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kb_refs: Vec<String>,
}

impl SendOptions {
    pub fn auto(kb_refs: Vec<String>) -> Self {
        Self {
            is_auto_response: true,
            operator_name: None,
            kb_refs,
        }
    }

    pub fn operator(name: impl Into<String>) -> Self {
        Self {
            is_auto_response: false,
            operator_name: Some(name.into()),
            kb_refs: Vec::new(),
        }
    }
}

/// A channel message normalized into the shape the router stores.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub source: TicketSource,
    /// Channel-native conversation id (chat id, phone, email address).
    pub source_id: String,
    pub user: ContactRef,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    /// Original channel payload, kept for audit and debugging.
    pub raw: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Typed events connectors push to the router.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Inbound(InboundEvent),
    /// User rated a resolution (1..=5).
    Feedback {
        source: TicketSource,
        source_id: String,
        rating: u8,
        comment: Option<String>,
    },
    /// User answered the "did this solve it?" prompt.
    Confirmation {
        source: TicketSource,
        source_id: String,
        accepted: bool,
    },
    /// User asked for their ticket's current status.
    StatusQuery {
        source: TicketSource,
        source_id: String,
    },
}

/// A bidirectional channel adapter.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> TicketSource;

    /// Start background session/polling tasks. Idempotent: calling on a
    /// running connector logs and returns Ok.
    async fn start(&self) -> Result<(), ChannelError>;

    /// Stop background tasks. Safe to call when never started.
    async fn stop(&self);

    /// Deliver text to a channel conversation. Errors with
    /// [`ChannelError::NotConnected`] when the session is down.
    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        opts: &SendOptions,
    ) -> Result<(), ChannelError>;

    fn health(&self) -> HealthSnapshot;

    /// Session state feed. New subscribers observe the current state first,
    /// then deltas.
    fn session(&self) -> watch::Receiver<SessionState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_labels() {
        assert_eq!(SessionState::Disconnected.label(), "disconnected");
        assert!(SessionState::Connected.is_connected());
        let awaiting = SessionState::AwaitingManualAuth {
            qr: "data".into(),
            issued_at: Utc::now(),
        };
        assert_eq!(awaiting.label(), "awaiting_manual_auth");
        assert!(!awaiting.is_connected());
    }

    #[test]
    fn send_options_serialization_skips_empty_fields() {
        let opts = SendOptions::auto(vec![]);
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json, serde_json::json!({"is_auto_response": true}));

        let opts = SendOptions::operator("Alice");
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["operator_name"], "Alice");
    }
}
