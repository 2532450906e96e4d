//! Ticket entity and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::nlp::TriageVerdict;

/// Which external channel a ticket arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSource {
    Telegram,
    Whatsapp,
    Email,
}

impl TicketSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(Self::Telegram),
            "whatsapp" => Some(Self::Whatsapp),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Just created, not yet processed.
    New,
    /// Routed to an operator (or automation declined).
    InProgress,
    /// Automation drafted a reply; awaiting human approval.
    DraftPending,
    /// Waiting on the user to respond.
    WaitingUser,
    /// Escalation keyword or verdict forced high-priority routing.
    Escalated,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::DraftPending => "draft_pending",
            Self::WaitingUser => "waiting_user",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "in_progress" => Some(Self::InProgress),
            "draft_pending" => Some(Self::DraftPending),
            "waiting_user" => Some(Self::WaitingUser),
            "escalated" => Some(Self::Escalated),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Open tickets accept new inbound messages; resolved/closed do not.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Resolved | Self::Closed)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One support conversation. At most one open ticket exists per
/// (source, source_conversation_id) pair; routing lookups filter out
/// resolved/closed rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub source: TicketSource,
    /// Channel-native thread/contact id (chat id, phone, email address).
    pub source_conversation_id: String,
    pub subject: String,
    pub body: String,
    pub language: Option<String>,
    pub category: Option<String>,
    pub category_confidence: Option<f32>,
    pub priority: Priority,
    pub priority_confidence: Option<f32>,
    pub triage_verdict: Option<TriageVerdict>,
    pub triage_confidence: Option<f32>,
    pub status: TicketStatus,
    pub assigned_to: Option<String>,
    pub suggested_response: Option<String>,
    pub summary: Option<String>,
    pub resolution_text: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Create a fresh ticket for a first inbound message.
    pub fn new(
        source: TicketSource,
        source_conversation_id: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source,
            source_conversation_id: source_conversation_id.into(),
            subject: subject.into(),
            body: body.into(),
            language: None,
            category: None,
            category_confidence: None,
            priority: Priority::Medium,
            priority_confidence: None,
            triage_verdict: None,
            triage_confidence: None,
            status: TicketStatus::New,
            assigned_to: None,
            suggested_response: None,
            summary: None,
            resolution_text: None,
            resolved_by: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    /// The processing worker skips re-classification unless the job
    /// carries a new user message.
    pub fn is_classified(&self) -> bool {
        self.category.is_some()
    }
}
