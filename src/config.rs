//! Configuration types, built from environment variables.

use std::time::Duration;

use secrecy::SecretString;

/// Decision pipeline configuration: thresholds, category set, escalation
/// keywords.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Closed category set the classifier must choose from.
    pub categories: Vec<String>,
    /// Categories eligible for auto-resolution drafting.
    pub auto_resolvable_categories: Vec<String>,
    /// Any match forces priority `critical` and escalation.
    pub escalation_keywords: Vec<String>,
    /// Category confidence gate for the auto-resolve path.
    pub auto_resolve_threshold: f32,
    /// Triage confidence gate for the auto-resolve path.
    pub triage_threshold: f32,
    /// Minimum category confidence to queue a draft at all.
    pub draft_min_threshold: f32,
    /// Max KB excerpts fed to the drafting prompt.
    pub search_limit: usize,
    /// Hard budget per external call (classification/search/completion).
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            categories: default_list(DEFAULT_CATEGORIES),
            auto_resolvable_categories: default_list(DEFAULT_AUTO_RESOLVABLE),
            escalation_keywords: default_list(DEFAULT_ESCALATION_KEYWORDS),
            auto_resolve_threshold: 0.90,
            triage_threshold: 0.85,
            draft_min_threshold: 0.60,
            search_limit: 3,
            stage_timeout: Duration::from_secs(30),
        }
    }
}

const DEFAULT_CATEGORIES: &[&str] = &[
    "account_access",
    "vpn",
    "hardware",
    "software",
    "network",
    "billing",
    "other",
];

const DEFAULT_AUTO_RESOLVABLE: &[&str] = &["account_access", "vpn", "software", "network"];

const DEFAULT_ESCALATION_KEYWORDS: &[&str] = &[
    "data breach",
    "security incident",
    "ransomware",
    "lawsuit",
    "legal action",
    "угроза безопасности",
    "утечка данных",
];

fn default_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl PipelineConfig {
    /// Build from environment, falling back to defaults per field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            categories: env_csv("DESKFLOW_CATEGORIES").unwrap_or(defaults.categories),
            auto_resolvable_categories: env_csv("DESKFLOW_AUTO_RESOLVABLE_CATEGORIES")
                .unwrap_or(defaults.auto_resolvable_categories),
            escalation_keywords: env_csv("DESKFLOW_ESCALATION_KEYWORDS")
                .unwrap_or(defaults.escalation_keywords),
            auto_resolve_threshold: env_parse("DESKFLOW_AUTO_RESOLVE_THRESHOLD")
                .unwrap_or(defaults.auto_resolve_threshold),
            triage_threshold: env_parse("DESKFLOW_TRIAGE_THRESHOLD")
                .unwrap_or(defaults.triage_threshold),
            draft_min_threshold: env_parse("DESKFLOW_DRAFT_MIN_THRESHOLD")
                .unwrap_or(defaults.draft_min_threshold),
            search_limit: env_parse("DESKFLOW_SEARCH_LIMIT").unwrap_or(defaults.search_limit),
            stage_timeout: env_parse("DESKFLOW_STAGE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stage_timeout),
        }
    }

    pub fn is_auto_resolvable_category(&self, category: &str) -> bool {
        self.auto_resolvable_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}

/// Telegram bot connector configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Long-poll timeout passed to getUpdates.
    pub poll_timeout_secs: u64,
}

impl TelegramConfig {
    /// Returns `None` when `TELEGRAM_BOT_TOKEN` is unset (channel disabled).
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        Some(Self {
            bot_token,
            poll_timeout_secs: env_parse("TELEGRAM_POLL_TIMEOUT_SECS").unwrap_or(30),
        })
    }
}

/// QR-authenticated WhatsApp gateway configuration.
#[derive(Debug, Clone)]
pub struct WhatsappConfig {
    /// Base URL of the WhatsApp HTTP gateway (WAHA-style).
    pub gateway_url: String,
    pub api_key: Option<SecretString>,
    pub session_name: String,
    pub poll_interval_secs: u64,
    /// QR artifacts are discarded after this long even if unscanned.
    pub qr_ttl: Duration,
}

impl WhatsappConfig {
    /// Returns `None` when `WHATSAPP_GATEWAY_URL` is unset (channel disabled).
    pub fn from_env() -> Option<Self> {
        let gateway_url = std::env::var("WHATSAPP_GATEWAY_URL").ok()?;
        Some(Self {
            gateway_url,
            api_key: std::env::var("WHATSAPP_API_KEY").ok().map(SecretString::from),
            session_name: std::env::var("WHATSAPP_SESSION")
                .unwrap_or_else(|_| "default".to_string()),
            poll_interval_secs: env_parse("WHATSAPP_POLL_INTERVAL_SECS").unwrap_or(3),
            qr_ttl: Duration::from_secs(env_parse("WHATSAPP_QR_TTL_SECS").unwrap_or(60)),
        })
    }
}

/// Polled mailbox connector configuration.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub poll_interval_secs: u64,
}

impl MailboxConfig {
    /// Returns `None` when `MAIL_IMAP_HOST` is unset (channel disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("MAIL_IMAP_HOST").ok()?;
        let username = std::env::var("MAIL_USERNAME").unwrap_or_default();
        Some(Self {
            smtp_host: std::env::var("MAIL_SMTP_HOST")
                .unwrap_or_else(|_| imap_host.replace("imap", "smtp")),
            imap_port: env_parse("MAIL_IMAP_PORT").unwrap_or(993),
            smtp_port: env_parse("MAIL_SMTP_PORT").unwrap_or(587),
            password: std::env::var("MAIL_PASSWORD").unwrap_or_default(),
            from_address: std::env::var("MAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone()),
            poll_interval_secs: env_parse("MAIL_POLL_INTERVAL_SECS").unwrap_or(60),
            username,
            imap_host,
        })
    }
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Distinct per process so consumer-group delivery stays exclusive.
    pub consumer_name: String,
    /// Blocking-read timeout per poll.
    pub block_timeout: Duration,
    /// Entries pulled per read.
    pub batch_size: usize,
    /// Backoff ceiling for queue error retry loops.
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("worker-{}", std::process::id()),
            block_timeout: Duration::from_secs(5),
            batch_size: 8,
            max_backoff: Duration::from_secs(30),
        }
    }
}

// ── env helpers ─────────────────────────────────────────────────────

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_csv(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() { None } else { Some(items) }
}
