//! NLP processing result — regenerated wholesale on each processing pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a ticket can be safely automated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageVerdict {
    /// Knowledge base coverage is good enough to propose a draft reply.
    AutoResolvable,
    /// Route to an operator.
    NeedsHuman,
    /// Risk signals present; bypass normal thresholds.
    Escalate,
}

impl TriageVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoResolvable => "auto_resolvable",
            Self::NeedsHuman => "needs_human",
            Self::Escalate => "escalate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_resolvable" => Some(Self::AutoResolvable),
            "needs_human" => Some(Self::NeedsHuman),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }
}

/// 1:1 with a ticket, upserted as a full replace — never partially merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpResult {
    pub ticket_id: Uuid,
    pub category: String,
    pub category_confidence: f32,
    pub priority: crate::model::Priority,
    pub priority_confidence: f32,
    pub triage_verdict: TriageVerdict,
    pub triage_confidence: f32,
    pub summary: Option<String>,
    pub suggested_response: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_round_trips() {
        for v in [
            TriageVerdict::AutoResolvable,
            TriageVerdict::NeedsHuman,
            TriageVerdict::Escalate,
        ] {
            assert_eq!(TriageVerdict::parse(v.as_str()), Some(v));
        }
        assert_eq!(TriageVerdict::parse("maybe"), None);
    }
}
