//! Per-ticket message history. Append-only; ordering is creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Bot,
    Operator,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
            Self::Operator => "operator",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "bot" => Some(Self::Bot),
            "operator" => Some(Self::Operator),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// An attachment carried by an inbound or outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Option<String>,
    pub mime_type: Option<String>,
}

/// One message in a ticket's history, owned by exactly one ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_type: SenderType,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        ticket_id: Uuid,
        sender_id: impl Into<String>,
        sender_type: SenderType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id,
            sender_id: sender_id.into(),
            sender_name: None,
            sender_type,
            content: content.into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builder() {
        let tid = Uuid::new_v4();
        let msg = Message::new(tid, "u1", SenderType::User, "hello")
            .with_sender_name("Alice")
            .with_attachments(vec![Attachment {
                kind: "image".into(),
                url: Some("https://x/y.png".into()),
                mime_type: Some("image/png".into()),
            }]);
        assert_eq!(msg.ticket_id, tid);
        assert_eq!(msg.sender_name.as_deref(), Some("Alice"));
        assert_eq!(msg.attachments.len(), 1);
    }

    #[test]
    fn sender_type_round_trips() {
        for s in [
            SenderType::User,
            SenderType::Bot,
            SenderType::Operator,
            SenderType::System,
        ] {
            assert_eq!(SenderType::parse(s.as_str()), Some(s));
        }
    }
}
