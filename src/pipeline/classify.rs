//! Ticket classification: LLM-backed with a keyword-overlap fallback, plus
//! escalation keyword screening.
//!
//! Classification never leaves a ticket uncategorized. A failed or
//! unparseable completion falls back to keyword scoring against the closed
//! category set.

use serde::Deserialize;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::model::{Priority, TriageVerdict};
use crate::services::extract_json_object;

/// One full classification pass: category, priority, and triage verdict,
/// each with a confidence in [0, 1].
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: String,
    pub category_confidence: f32,
    pub priority: Priority,
    pub priority_confidence: f32,
    pub triage_verdict: TriageVerdict,
    pub triage_confidence: f32,
    pub summary: Option<String>,
}

/// Scan for escalation keywords. Returns the first match; any match forces
/// priority `critical` regardless of classifier output.
pub fn find_escalation_keyword<'a>(config: &'a PipelineConfig, text: &str) -> Option<&'a str> {
    let lower = text.to_lowercase();
    config
        .escalation_keywords
        .iter()
        .find(|kw| lower.contains(&kw.to_lowercase()))
        .map(String::as_str)
}

// ── Prompts ─────────────────────────────────────────────────────────

pub fn build_classification_system_prompt(config: &PipelineConfig) -> String {
    format!(
        "You are a support ticket classifier for an IT helpdesk.\n\n\
         Classify the ticket into exactly one category from this set:\n{}\n\n\
         Also assess:\n\
         - priority: one of low, medium, high, critical\n\
         - triage_verdict: \"auto_resolvable\" when a standard knowledge-base answer \
           likely solves it, \"needs_human\" when an operator should handle it, \
           \"escalate\" for incidents needing immediate senior attention\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"category\": \"...\", \"category_confidence\": 0.0, \
         \"priority\": \"...\", \"priority_confidence\": 0.0, \
         \"triage_verdict\": \"...\", \"triage_confidence\": 0.0, \
         \"summary\": \"one sentence\"}}\n\n\
         Rules:\n\
         - Confidences are honest estimates in [0.0, 1.0]\n\
         - High confidence (>0.85) only when the ticket is unambiguous\n\
         - The summary is in English regardless of the ticket language",
        config
            .categories
            .iter()
            .map(|c| format!("  - {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

pub fn build_classification_user_prompt(
    subject: &str,
    body: &str,
    language: Option<&str>,
) -> String {
    let mut prompt = String::with_capacity(512);
    if let Some(lang) = language {
        prompt.push_str(&format!("Language: {lang}\n"));
    }
    prompt.push_str(&format!("Subject: {subject}\n"));
    let body_preview: String = body.chars().take(1500).collect();
    prompt.push_str(&format!("\nTicket:\n{body_preview}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    category: String,
    #[serde(default)]
    category_confidence: f32,
    #[serde(default)]
    priority: String,
    #[serde(default)]
    priority_confidence: f32,
    #[serde(default)]
    triage_verdict: String,
    #[serde(default)]
    triage_confidence: f32,
    #[serde(default)]
    summary: String,
}

/// Parse the completion output. Errors (unknown category, missing JSON)
/// route the caller to the keyword fallback.
pub fn parse_classification_response(
    config: &PipelineConfig,
    raw: &str,
) -> Result<Classification, String> {
    let json_str = extract_json_object(raw).ok_or("no JSON object in response")?;
    let response: ClassificationResponse =
        serde_json::from_str(json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let category = config
        .categories
        .iter()
        .find(|c| c.eq_ignore_ascii_case(&response.category))
        .cloned()
        .ok_or_else(|| format!("category '{}' outside the closed set", response.category))?;

    Ok(Classification {
        category,
        category_confidence: response.category_confidence.clamp(0.0, 1.0),
        priority: Priority::parse(&response.priority.to_lowercase()).unwrap_or(Priority::Medium),
        priority_confidence: response.priority_confidence.clamp(0.0, 1.0),
        triage_verdict: TriageVerdict::parse(&response.triage_verdict.to_lowercase())
            .unwrap_or(TriageVerdict::NeedsHuman),
        triage_confidence: response.triage_confidence.clamp(0.0, 1.0),
        summary: (!response.summary.is_empty()).then_some(response.summary),
    })
}

// ── Keyword fallback ────────────────────────────────────────────────

/// Per-category keyword hints for the fallback scorer. Category names
/// themselves always count as keywords.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("vpn", &["vpn", "впн", "tunnel", "remote access"]),
    (
        "account_access",
        &[
            "password", "login", "account", "locked", "2fa", "пароль", "логин", "вход",
            "аккаунт", "заблокирован",
        ],
    ),
    (
        "hardware",
        &[
            "laptop", "printer", "monitor", "keyboard", "mouse", "ноутбук", "принтер",
            "монитор", "клавиатура",
        ],
    ),
    (
        "software",
        &[
            "install", "application", "update", "crash", "программа", "приложение",
            "установить", "обновление",
        ],
    ),
    (
        "network",
        &["wifi", "wi-fi", "internet", "network", "dns", "сеть", "интернет"],
    ),
    (
        "billing",
        &["invoice", "payment", "billing", "charge", "счет", "счёт", "оплата"],
    ),
];

/// Keyword-overlap scoring against the category set. Always produces a
/// result; unknown topics land in `other` with low confidence.
pub fn fallback_classification(config: &PipelineConfig, text: &str) -> Classification {
    let lower = text.to_lowercase();
    let mut best: Option<(&str, usize)> = None;

    for category in &config.categories {
        let mut hits = 0usize;
        if lower.contains(&category.to_lowercase()) {
            hits += 1;
        }
        if let Some((_, keywords)) = CATEGORY_KEYWORDS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(category))
        {
            hits += keywords.iter().filter(|kw| lower.contains(*kw)).count();
        }
        if hits > 0 && best.is_none_or(|(_, b)| hits > b) {
            best = Some((category, hits));
        }
    }

    let (category, confidence) = match best {
        Some((category, hits)) => {
            let confidence = (0.3 + 0.1 * hits as f32).min(0.6);
            (category.to_string(), confidence)
        }
        None => ("other".to_string(), 0.2),
    };
    debug!(category = %category, confidence, "Keyword fallback classification");

    Classification {
        category,
        category_confidence: confidence,
        priority: Priority::Medium,
        priority_confidence: 0.5,
        triage_verdict: TriageVerdict::NeedsHuman,
        triage_confidence: 0.5,
        summary: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_keywords_match_case_insensitively_across_languages() {
        let cfg = PipelineConfig::default();
        assert_eq!(
            find_escalation_keyword(&cfg, "We may have a DATA BREACH here"),
            Some("data breach")
        );
        assert_eq!(
            find_escalation_keyword(&cfg, "Похоже, у нас УТЕЧКА ДАННЫХ из базы"),
            Some("утечка данных")
        );
        assert_eq!(find_escalation_keyword(&cfg, "printer jam"), None);
    }

    #[test]
    fn well_formed_response_parses() {
        let cfg = PipelineConfig::default();
        let raw = r#"{"category": "vpn", "category_confidence": 0.93,
            "priority": "high", "priority_confidence": 0.9,
            "triage_verdict": "auto_resolvable", "triage_confidence": 0.88,
            "summary": "VPN connection failure"}"#;
        let c = parse_classification_response(&cfg, raw).unwrap();
        assert_eq!(c.category, "vpn");
        assert!((c.category_confidence - 0.93).abs() < 1e-6);
        assert_eq!(c.priority, Priority::High);
        assert_eq!(c.triage_verdict, TriageVerdict::AutoResolvable);
        assert_eq!(c.summary.as_deref(), Some("VPN connection failure"));
    }

    #[test]
    fn markdown_wrapped_response_parses() {
        let cfg = PipelineConfig::default();
        let raw = "```json\n{\"category\": \"hardware\", \"category_confidence\": 0.7}\n```";
        let c = parse_classification_response(&cfg, raw).unwrap();
        assert_eq!(c.category, "hardware");
        // Missing fields take safe defaults.
        assert_eq!(c.priority, Priority::Medium);
        assert_eq!(c.triage_verdict, TriageVerdict::NeedsHuman);
    }

    #[test]
    fn invented_category_and_garbage_are_rejected() {
        let cfg = PipelineConfig::default();
        assert!(
            parse_classification_response(&cfg, r#"{"category": "quantum_flux"}"#).is_err()
        );
        assert!(parse_classification_response(&cfg, "not json at all").is_err());
    }

    #[test]
    fn confidences_are_clamped() {
        let cfg = PipelineConfig::default();
        let raw = r#"{"category": "vpn", "category_confidence": 1.7,
            "triage_verdict": "needs_human", "triage_confidence": -0.2}"#;
        let c = parse_classification_response(&cfg, raw).unwrap();
        assert_eq!(c.category_confidence, 1.0);
        assert_eq!(c.triage_confidence, 0.0);
    }

    #[test]
    fn fallback_scores_keywords_in_both_languages() {
        let cfg = PipelineConfig::default();
        let c = fallback_classification(&cfg, "Не могу подключиться: впн выдает ошибку");
        assert_eq!(c.category, "vpn");
        assert!(c.category_confidence < cfg.draft_min_threshold);
        assert_eq!(c.triage_verdict, TriageVerdict::NeedsHuman);

        let c = fallback_classification(&cfg, "forgot my password, account locked");
        assert_eq!(c.category, "account_access");

        let c = fallback_classification(&cfg, "mysterious gibberish request");
        assert_eq!(c.category, "other");
        assert!((c.category_confidence - 0.2).abs() < 1e-6);
    }

    #[test]
    fn system_prompt_lists_the_configured_categories() {
        let cfg = PipelineConfig::default();
        let prompt = build_classification_system_prompt(&cfg);
        for category in &cfg.categories {
            assert!(prompt.contains(category.as_str()));
        }
        assert!(prompt.contains("JSON"));
    }
}
