//! Telegram connector — long-polls the Bot API for updates.
//!
//! `message` updates normalize into inbound events; `callback_query` updates
//! carry the confirmation/rating buttons attached to auto responses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::connectors::connector::{
    Connector, ConnectorEvent, HealthSnapshot, InboundEvent, SendOptions, SessionState,
};
use crate::error::ChannelError;
use crate::model::TicketSource;
use crate::store::ContactRef;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Callback data attached to confirmation/rating buttons.
const CB_CONFIRM_YES: &str = "confirm_yes";
const CB_CONFIRM_NO: &str = "confirm_no";
const CB_RATE_PREFIX: &str = "rate_";

pub struct TelegramConnector {
    config: TelegramConfig,
    client: reqwest::Client,
    events: mpsc::Sender<ConnectorEvent>,
    running: Arc<AtomicBool>,
    session_tx: watch::Sender<SessionState>,
}

impl TelegramConnector {
    pub fn new(config: TelegramConfig, events: mpsc::Sender<ConnectorEvent>) -> Self {
        let (session_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            client: reqwest::Client::new(),
            events,
            running: Arc::new(AtomicBool::new(false)),
            session_tx,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.config.bot_token
        )
    }

    /// Send a single chunk (≤4096 chars), Markdown-first with plain fallback.
    async fn send_chunk(&self, chat_id: &str, text: &str, keyboard: Option<&Value>) -> Result<(), ChannelError> {
        let mut markdown_body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(kb) = keyboard {
            markdown_body["reply_markup"] = kb.clone();
        }

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = resp.status();
        warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let mut plain_body = json!({"chat_id": chat_id, "text": text});
        if let Some(kb) = keyboard {
            plain_body["reply_markup"] = kb.clone();
        }
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let plain_err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for TelegramConnector {
    fn name(&self) -> TicketSource {
        TicketSource::Telegram
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Telegram connector already running");
            return Ok(());
        }

        let client = self.client.clone();
        let bot_token = self.config.bot_token.clone();
        let poll_timeout = self.config.poll_timeout_secs;
        let events = self.events.clone();
        let running = self.running.clone();
        let session_tx = self.session_tx.clone();

        // Bot-token channels have no manual auth step.
        let _ = session_tx.send(SessionState::Connected);
        info!("Telegram connector listening for updates");

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            while running.load(Ordering::SeqCst) {
                let url = format!("https://api.telegram.org/bot{bot_token}/getUpdates");
                let body = json!({
                    "offset": offset,
                    "timeout": poll_timeout,
                    "allowed_updates": ["message", "callback_query"],
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Telegram poll error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Telegram parse error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    continue;
                };
                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }
                    let Some(event) = normalize_update(update) else {
                        continue;
                    };
                    if events.send(event).await.is_err() {
                        info!("Telegram event channel closed; stopping poll loop");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            let _ = session_tx.send(SessionState::Disconnected);
        });

        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.session_tx.send(SessionState::Disconnected);
        info!("Telegram connector stopped");
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        opts: &SendOptions,
    ) -> Result<(), ChannelError> {
        if !self.session_tx.borrow().is_connected() {
            return Err(ChannelError::NotConnected {
                name: "telegram".into(),
            });
        }

        let keyboard = opts.is_auto_response.then(confirmation_keyboard);
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            // Confirmation buttons ride on the final chunk only.
            let kb = if i == last { keyboard.as_ref() } else { None };
            self.send_chunk(recipient_id, chunk, kb).await?;
        }
        debug!(chat_id = recipient_id, chunks = chunks.len(), "Telegram message sent");
        Ok(())
    }

    fn health(&self) -> HealthSnapshot {
        let state = self.session_tx.borrow().clone();
        if state.is_connected() {
            HealthSnapshot::healthy(TicketSource::Telegram)
        } else {
            HealthSnapshot::unhealthy(TicketSource::Telegram, state.label(), "poll loop not running")
        }
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }
}

// ── Update normalization ────────────────────────────────────────────

/// Map one raw Bot API update onto a typed event. Returns `None` for noise
/// (bot-authored messages, empty text, unknown callback data).
fn normalize_update(update: &Value) -> Option<ConnectorEvent> {
    if let Some(callback) = update.get("callback_query") {
        return normalize_callback(callback);
    }

    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    if text.trim().is_empty() {
        return None;
    }
    let from = message.get("from")?;
    if from.get("is_bot").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?
        .to_string();
    let user_id = from
        .get("id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_else(|| chat_id.clone());
    let name = from
        .get("first_name")
        .and_then(Value::as_str)
        .or_else(|| from.get("username").and_then(Value::as_str))
        .map(String::from);

    if text.trim() == "/status" {
        return Some(ConnectorEvent::StatusQuery {
            source: TicketSource::Telegram,
            source_id: chat_id,
        });
    }

    Some(ConnectorEvent::Inbound(InboundEvent {
        source: TicketSource::Telegram,
        source_id: chat_id,
        user: ContactRef {
            source: TicketSource::Telegram,
            source_user_id: user_id,
            name,
            email: None,
            phone: None,
        },
        subject: first_line(text),
        body: text.to_string(),
        attachments: Vec::new(),
        raw: message.clone(),
        timestamp: Utc::now(),
    }))
}

fn normalize_callback(callback: &Value) -> Option<ConnectorEvent> {
    let data = callback.get("data").and_then(Value::as_str)?;
    let chat_id = callback
        .get("message")
        .and_then(|m| m.get("chat"))
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?
        .to_string();

    match data {
        CB_CONFIRM_YES => Some(ConnectorEvent::Confirmation {
            source: TicketSource::Telegram,
            source_id: chat_id,
            accepted: true,
        }),
        CB_CONFIRM_NO => Some(ConnectorEvent::Confirmation {
            source: TicketSource::Telegram,
            source_id: chat_id,
            accepted: false,
        }),
        other => {
            let rating: u8 = other.strip_prefix(CB_RATE_PREFIX)?.parse().ok()?;
            (1..=5).contains(&rating).then(|| ConnectorEvent::Feedback {
                source: TicketSource::Telegram,
                source_id: chat_id,
                rating,
                comment: None,
            })
        }
    }
}

fn confirmation_keyboard() -> Value {
    json!({
        "inline_keyboard": [[
            {"text": "✅ Yes, solved", "callback_data": CB_CONFIRM_YES},
            {"text": "❌ No, need help", "callback_data": CB_CONFIRM_NO},
        ]]
    })
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > 80 {
        line.chars().take(77).collect::<String>() + "..."
    } else {
        line.to_string()
    }
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        // Largest cut that fits and lands on a char boundary.
        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            // Never split at position 0
            .filter(|&at| at > 0)
            .unwrap_or(cut);
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}
