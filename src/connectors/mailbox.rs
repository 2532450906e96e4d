//! Mailbox connector — IMAP polling for inbound, SMTP via lettre for
//! outbound.
//!
//! Inbound polling tracks a UID high-water mark persisted as a channel
//! cursor, so restarts never re-ingest mail. The mark advances only after a
//! message is normalized and emitted; a mid-batch failure leaves the mark at
//! the last good message.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message as LettreMessage, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::connectors::connector::{
    Connector, ConnectorEvent, HealthSnapshot, InboundEvent, SendOptions, SessionState,
};
use crate::error::ChannelError;
use crate::model::TicketSource;
use crate::store::{ContactRef, TicketStore};

/// Channel cursor key for the persisted UID mark.
const CURSOR_CHANNEL: &str = "mailbox";

/// Consecutive poll failures before the session is marked disconnected.
const MAX_POLL_FAILURES: u32 = 3;

pub struct MailboxConnector {
    config: MailboxConfig,
    store: Arc<dyn TicketStore>,
    events: mpsc::Sender<ConnectorEvent>,
    running: Arc<AtomicBool>,
    session_tx: watch::Sender<SessionState>,
    poll_failures: Arc<AtomicU32>,
    last_poll_error: Arc<Mutex<Option<String>>>,
}

impl MailboxConnector {
    pub fn new(
        config: MailboxConfig,
        store: Arc<dyn TicketStore>,
        events: mpsc::Sender<ConnectorEvent>,
    ) -> Self {
        let (session_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            store,
            events,
            running: Arc::new(AtomicBool::new(false)),
            session_tx,
            poll_failures: Arc::new(AtomicU32::new(0)),
            last_poll_error: Arc::new(Mutex::new(None)),
        }
    }
}

/// Count a failed poll; repeated failures flip the session to disconnected
/// so health reporting surfaces a dead or misconfigured mailbox.
fn record_poll_failure(
    failures: &AtomicU32,
    last_error: &Mutex<Option<String>>,
    session_tx: &watch::Sender<SessionState>,
    reason: String,
) {
    let n = failures.fetch_add(1, Ordering::SeqCst) + 1;
    if let Ok(mut slot) = last_error.lock() {
        *slot = Some(reason);
    }
    if n >= MAX_POLL_FAILURES && session_tx.borrow().is_connected() {
        warn!(failures = n, "Mailbox marked disconnected after repeated poll failures");
        let _ = session_tx.send(SessionState::Disconnected);
    }
}

fn record_poll_success(
    failures: &AtomicU32,
    last_error: &Mutex<Option<String>>,
    session_tx: &watch::Sender<SessionState>,
) {
    failures.store(0, Ordering::SeqCst);
    if let Ok(mut slot) = last_error.lock() {
        slot.take();
    }
    if !session_tx.borrow().is_connected() {
        info!("Mailbox polling recovered");
        let _ = session_tx.send(SessionState::Connected);
    }
}

/// Send an email via SMTP. Blocking; callers run it in `spawn_blocking`.
fn send_email_blocking(
    config: &MailboxConfig,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<(), ChannelError> {
    let creds = Credentials::new(config.username.clone(), config.password.clone());

    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let email = LettreMessage::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| ChannelError::SendFailed {
                    name: "email".into(),
                    reason: format!("Invalid from address: {e}"),
                })?,
        )
        .to(to.parse().map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("Invalid to address: {e}"),
        })?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("Failed to build email: {e}"),
        })?;

    transport
        .send(&email)
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("SMTP send failed: {e}"),
        })?;

    info!("Email sent to {to}");
    Ok(())
}

#[async_trait]
impl Connector for MailboxConnector {
    fn name(&self) -> TicketSource {
        TicketSource::Email
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Mailbox connector already running");
            return Ok(());
        }

        let config = self.config.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let session_tx = self.session_tx.clone();
        let poll_failures = self.poll_failures.clone();
        let last_poll_error = self.last_poll_error.clone();
        let own_address = self.config.from_address.to_lowercase();

        let _ = session_tx.send(SessionState::Connected);
        info!(
            host = %config.imap_host,
            interval_secs = config.poll_interval_secs,
            "Mailbox connector polling"
        );

        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
            loop {
                tick.tick().await;
                if !running.load(Ordering::SeqCst) {
                    info!("Mailbox poll loop shutting down");
                    break;
                }

                let mark: u32 = match store.get_channel_cursor(CURSOR_CHANNEL).await {
                    Ok(v) => v.and_then(|s| s.parse().ok()).unwrap_or(0),
                    Err(e) => {
                        error!("Mailbox cursor load failed: {e}");
                        continue;
                    }
                };

                let cfg = config.clone();
                let fetched =
                    match tokio::task::spawn_blocking(move || fetch_above_mark(&cfg, mark)).await {
                        Ok(Ok(mails)) => {
                            record_poll_success(&poll_failures, &last_poll_error, &session_tx);
                            mails
                        }
                        Ok(Err(e)) => {
                            error!("Mailbox poll failed: {e}");
                            record_poll_failure(
                                &poll_failures,
                                &last_poll_error,
                                &session_tx,
                                e.to_string(),
                            );
                            continue;
                        }
                        Err(e) => {
                            error!("Mailbox poll task panicked: {e}");
                            record_poll_failure(
                                &poll_failures,
                                &last_poll_error,
                                &session_tx,
                                format!("poll task panicked: {e}"),
                            );
                            continue;
                        }
                    };

                for mail in fetched {
                    // Filtered mail is handled mail; the mark still advances.
                    let event = normalize_mail(&mail, &own_address);
                    if let Some(event) = event
                        && events.send(event).await.is_err()
                    {
                        info!("Mailbox event channel closed; stopping");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    if let Err(e) = store
                        .set_channel_cursor(CURSOR_CHANNEL, &mail.uid.to_string())
                        .await
                    {
                        // Do not advance past a cursor write failure.
                        error!("Mailbox cursor persist failed: {e}");
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
        info!("Mailbox connector stopped");
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        opts: &SendOptions,
    ) -> Result<(), ChannelError> {
        if !self.session_tx.borrow().is_connected() {
            return Err(ChannelError::NotConnected {
                name: "email".into(),
            });
        }

        let (subject, body) = extract_subject(text);
        let mut body = body.to_string();
        if opts.is_auto_response {
            body.push_str(
                "\n\nIf this solved your problem, reply \"yes\". \
                 Reply \"no\" to reach an operator.",
            );
        }

        let config = self.config.clone();
        let to = recipient_id.to_string();
        tokio::task::spawn_blocking(move || send_email_blocking(&config, &to, &subject, &body))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("send task panicked: {e}"),
            })?
    }

    fn health(&self) -> HealthSnapshot {
        let state = self.session_tx.borrow().clone();
        let last_error = self.last_poll_error.lock().ok().and_then(|slot| slot.clone());
        if state.is_connected() {
            match last_error {
                // A failure below the disconnect threshold still shows up.
                Some(e) => HealthSnapshot {
                    source: TicketSource::Email,
                    healthy: true,
                    state: state.label().to_string(),
                    detail: Some(e),
                },
                None => HealthSnapshot::healthy(TicketSource::Email),
            }
        } else {
            HealthSnapshot::unhealthy(
                TicketSource::Email,
                state.label(),
                last_error.unwrap_or_else(|| "poll loop not running".to_string()),
            )
        }
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }
}

// ── Normalization (public within crate for testing) ─────────────────

/// A fetched email, pre-parse.
#[derive(Debug, Clone)]
pub(crate) struct FetchedMail {
    pub uid: u32,
    pub message_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub auto_submitted: bool,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Normalize one mail into an inbound event. Returns `None` for self-sent
/// and automated mail or mail that strips down to nothing.
pub(crate) fn normalize_mail(mail: &FetchedMail, own_address: &str) -> Option<ConnectorEvent> {
    if mail.sender.eq_ignore_ascii_case(own_address) {
        return None;
    }
    if mail.auto_submitted || is_auto_reply_subject(&mail.subject) {
        return None;
    }
    let body = strip_quoted_history(&mail.body);
    if body.trim().is_empty() {
        return None;
    }

    Some(ConnectorEvent::Inbound(InboundEvent {
        source: TicketSource::Email,
        source_id: mail.sender.to_lowercase(),
        user: ContactRef {
            source: TicketSource::Email,
            source_user_id: mail.sender.to_lowercase(),
            name: mail.sender_name.clone(),
            email: Some(mail.sender.to_lowercase()),
            phone: None,
        },
        subject: normalize_subject(&mail.subject),
        body,
        attachments: Vec::new(),
        raw: serde_json::json!({
            "message_id": mail.message_id,
            "uid": mail.uid,
            "subject": mail.subject,
        }),
        timestamp: mail.timestamp,
    }))
}

/// Automated-mail subjects that must never open tickets.
fn is_auto_reply_subject(subject: &str) -> bool {
    let lower = subject.trim().to_lowercase();
    lower.starts_with("auto:")
        || lower.starts_with("automatic reply")
        || lower.starts_with("autoreply")
        || lower.starts_with("out of office")
}

/// Drop `Re:`/`Fwd:` prefixes so threaded replies keep one subject.
fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        match ["re:", "fwd:", "fw:"]
            .iter()
            .find_map(|p| strip_prefix_ci(s, p))
        {
            Some(rest) => s = rest.trim_start(),
            None => break,
        }
    }
    if s.is_empty() {
        "(no subject)".to_string()
    } else {
        s.to_string()
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &s[prefix.len()..])
}

/// Strip quoted/forwarded history from a reply body, keeping only the new
/// text the user wrote.
pub(crate) fn strip_quoted_history(body: &str) -> String {
    let mut kept = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("-----Original Message-----")
            || trimmed.starts_with("---------- Forwarded message")
            || is_attribution_line(trimmed)
            || is_separator_line(trimmed)
        {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    // Drop trailing blank lines left behind by the cut.
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    kept.join("\n")
}

/// "On <date>, <someone> wrote:" attribution lines.
fn is_attribution_line(line: &str) -> bool {
    (line.starts_with("On ") || line.starts_with("Am ") || line.starts_with("Le "))
        && line.trim_end().ends_with("wrote:")
}

/// Horizontal-rule separators mail clients insert above quoted history.
fn is_separator_line(line: &str) -> bool {
    line.len() >= 10 && (line.chars().all(|c| c == '-') || line.chars().all(|c| c == '_'))
}

/// Extract subject from outgoing content. Content starting with
/// `Subject: ...` uses that line as the subject; otherwise a default.
pub(crate) fn extract_subject(content: &str) -> (String, &str) {
    if content.starts_with("Subject: ")
        && let Some(pos) = content.find('\n')
    {
        let subject = content[9..pos].trim().to_string();
        let body = content[pos + 1..].trim_start();
        return (subject, body);
    }
    ("Support ticket update".to_string(), content)
}

// ── Raw IMAP fetch (blocking — run in spawn_blocking) ───────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// Fetch mail with UID strictly above `mark` via raw IMAP over TLS.
fn fetch_above_mark(config: &MailboxConfig, mark: u32) -> Result<Vec<FetchedMail>, ImapError> {
    use std::sync::Arc as StdArc;

    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = StdArc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let read_line = |tls: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>|
     -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(tls, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let send_cmd = |tls: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
                    tag: &str,
                    cmd: &str|
     -> Result<Vec<String>, ImapError> {
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(tls, full.as_bytes())?;
        IoWrite::flush(tls)?;
        let mut lines = Vec::new();
        loop {
            let line = read_line(tls)?;
            let done = line.starts_with(tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    };

    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!("LOGIN \"{}\" \"{}\"", config.username, config.password),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    let search_resp = send_cmd(&mut tls, "A3", &format!("UID SEARCH UID {}:*", mark + 1))?;
    let mut uids: Vec<u32> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            for part in line.split_whitespace().skip(2) {
                if let Ok(uid) = part.parse::<u32>() {
                    // UID n:* always matches the newest message; keep
                    // strictly above the mark.
                    if uid > mark {
                        uids.push(uid);
                    }
                }
            }
        }
    }
    uids.sort_unstable();

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;
    for uid in uids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("UID FETCH {uid} RFC822"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            results.push(parsed_to_mail(uid, &parsed));
        } else {
            warn!(uid, "Unparseable message; skipping");
        }
    }

    let _logout = send_cmd(&mut tls, &format!("A{tag_counter}"), "LOGOUT");
    Ok(results)
}

fn parsed_to_mail(uid: u32, parsed: &mail_parser::Message) -> FetchedMail {
    let from = parsed.from().and_then(|addr| addr.first());
    let sender = from
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let sender_name = from.and_then(|a| a.name()).map(|s| s.to_string());

    let auto_submitted = parsed
        .header("Auto-Submitted")
        .and_then(|h| h.as_text())
        .is_some_and(|v| !v.eq_ignore_ascii_case("no"))
        || parsed
            .header("Precedence")
            .and_then(|h| h.as_text())
            .is_some_and(|v| {
                v.eq_ignore_ascii_case("bulk")
                    || v.eq_ignore_ascii_case("junk")
                    || v.eq_ignore_ascii_case("auto_reply")
            });

    let timestamp = parsed
        .date()
        .and_then(|d| {
            chrono::DateTime::parse_from_rfc3339(&d.to_rfc3339())
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
        .unwrap_or_else(Utc::now);

    FetchedMail {
        uid,
        message_id: parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4())),
        sender,
        sender_name,
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: extract_text(parsed),
        auto_submitted,
        timestamp,
    }
}

/// Extract readable text from a parsed email, falling back to stripped HTML
/// and then to text attachments.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    String::new()
}

/// Strip HTML tags from content (basic).
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
