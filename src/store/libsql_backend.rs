//! libSQL backend — async `TicketStore` implementation.
//!
//! Supports local file and in-memory databases. A single `Connection` is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and safe
//! for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    Attachment, Message, NlpResult, Priority, SenderType, Ticket, TicketSource, TicketStatus,
    TriageVerdict,
};
use crate::store::traits::{AuditRecord, ContactRef, FeedbackRecord, TicketStore};

/// libSQL ticket store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        for (name, sql) in SCHEMA {
            self.conn
                .execute_batch(sql)
                .await
                .map_err(|e| DatabaseError::Migration(format!("{name}: {e}")))?;
        }
        debug!("Schema initialized");
        Ok(())
    }
}

/// Schema statements, applied idempotently at startup.
static SCHEMA: &[(&str, &str)] = &[
    (
        "tickets",
        r#"
        CREATE TABLE IF NOT EXISTS tickets (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            source_conversation_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            language TEXT,
            category TEXT,
            category_confidence REAL,
            priority TEXT NOT NULL,
            priority_confidence REAL,
            triage_verdict TEXT,
            triage_confidence REAL,
            status TEXT NOT NULL,
            assigned_to TEXT,
            suggested_response TEXT,
            summary TEXT,
            resolution_text TEXT,
            resolved_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            resolved_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tickets_conversation
            ON tickets(source, source_conversation_id, status);
        "#,
    ),
    (
        "messages",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            ticket_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            sender_name TEXT,
            sender_type TEXT NOT NULL,
            content TEXT NOT NULL,
            attachments TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_ticket ON messages(ticket_id);
        "#,
    ),
    (
        "nlp_results",
        r#"
        CREATE TABLE IF NOT EXISTS nlp_results (
            ticket_id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            category_confidence REAL NOT NULL,
            priority TEXT NOT NULL,
            priority_confidence REAL NOT NULL,
            triage_verdict TEXT NOT NULL,
            triage_confidence REAL NOT NULL,
            summary TEXT,
            suggested_response TEXT,
            processed_at TEXT NOT NULL
        );
        "#,
    ),
    (
        "audit_feedback_contacts_cursors",
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id TEXT NOT NULL,
            action TEXT NOT NULL,
            detail TEXT NOT NULL,
            elapsed_ms INTEGER,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_ticket ON audit_log(ticket_id);

        CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id TEXT NOT NULL,
            rating INTEGER NOT NULL,
            comment TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contacts (
            source TEXT NOT NULL,
            source_user_id TEXT NOT NULL,
            name TEXT,
            email TEXT,
            phone TEXT,
            PRIMARY KEY (source, source_user_id)
        );

        CREATE TABLE IF NOT EXISTS channel_cursors (
            channel TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    ),
];

// ── Row mapping helpers ─────────────────────────────────────────────

/// Parse an RFC 3339 datetime string (our canonical write format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(f64::from(v)),
        None => libsql::Value::Null,
    }
}

const TICKET_COLUMNS: &str = "id, source, source_conversation_id, subject, body, language, \
     category, category_confidence, priority, priority_confidence, triage_verdict, \
     triage_confidence, status, assigned_to, suggested_response, summary, resolution_text, \
     resolved_by, created_at, updated_at, resolved_at";

fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, DatabaseError> {
    let id: String = get_text(row, 0)?;
    let source: String = get_text(row, 1)?;
    let priority: String = get_text(row, 8)?;
    let status: String = get_text(row, 12)?;
    let created: String = get_text(row, 18)?;
    let updated: String = get_text(row, 19)?;
    let resolved: Option<String> = row.get(20).ok();

    Ok(Ticket {
        id: Uuid::parse_str(&id)
            .map_err(|e| DatabaseError::Serialization(format!("ticket id: {e}")))?,
        source: TicketSource::parse(&source)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown source: {source}")))?,
        source_conversation_id: get_text(row, 2)?,
        subject: get_text(row, 3)?,
        body: get_text(row, 4)?,
        language: row.get(5).ok(),
        category: row.get(6).ok(),
        category_confidence: row.get::<f64>(7).ok().map(|v| v as f32),
        priority: Priority::parse(&priority).unwrap_or(Priority::Medium),
        priority_confidence: row.get::<f64>(9).ok().map(|v| v as f32),
        triage_verdict: row
            .get::<String>(10)
            .ok()
            .and_then(|s| TriageVerdict::parse(&s)),
        triage_confidence: row.get::<f64>(11).ok().map(|v| v as f32),
        status: TicketStatus::parse(&status)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown status: {status}")))?,
        assigned_to: row.get(13).ok(),
        suggested_response: row.get(14).ok(),
        summary: row.get(15).ok(),
        resolution_text: row.get(16).ok(),
        resolved_by: row.get(17).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        resolved_at: resolved.map(|s| parse_datetime(&s)),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id: String = get_text(row, 0)?;
    let ticket_id: String = get_text(row, 1)?;
    let sender_type: String = get_text(row, 4)?;
    let attachments: String = get_text(row, 6)?;
    let created: String = get_text(row, 7)?;

    Ok(Message {
        id: Uuid::parse_str(&id)
            .map_err(|e| DatabaseError::Serialization(format!("message id: {e}")))?,
        ticket_id: Uuid::parse_str(&ticket_id)
            .map_err(|e| DatabaseError::Serialization(format!("message ticket_id: {e}")))?,
        sender_id: get_text(row, 2)?,
        sender_name: row.get(3).ok(),
        sender_type: SenderType::parse(&sender_type).unwrap_or(SenderType::User),
        content: get_text(row, 5)?,
        attachments: serde_json::from_str::<Vec<Attachment>>(&attachments).unwrap_or_default(),
        created_at: parse_datetime(&created),
    })
}

fn get_text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn get_real(row: &libsql::Row, idx: i32) -> Result<f64, DatabaseError> {
    row.get(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TicketStore for LibSqlStore {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tickets ({TICKET_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21)"
                ),
                params![
                    ticket.id.to_string(),
                    ticket.source.as_str(),
                    ticket.source_conversation_id.clone(),
                    ticket.subject.clone(),
                    ticket.body.clone(),
                    opt_text_owned(ticket.language.clone()),
                    opt_text_owned(ticket.category.clone()),
                    opt_real(ticket.category_confidence),
                    ticket.priority.as_str(),
                    opt_real(ticket.priority_confidence),
                    opt_text_owned(ticket.triage_verdict.map(|v| v.as_str().to_string())),
                    opt_real(ticket.triage_confidence),
                    ticket.status.as_str(),
                    opt_text_owned(ticket.assigned_to.clone()),
                    opt_text_owned(ticket.suggested_response.clone()),
                    opt_text_owned(ticket.summary.clone()),
                    opt_text_owned(ticket.resolution_text.clone()),
                    opt_text_owned(ticket.resolved_by.clone()),
                    ticket.created_at.to_rfc3339(),
                    ticket.updated_at.to_rfc3339(),
                    opt_text_owned(ticket.resolved_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_ticket: {e}")))?;

        debug!(ticket_id = %ticket.id, source = %ticket.source, "Ticket created");
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_ticket: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_ticket: {e}")))?
        {
            Some(row) => Ok(Some(row_to_ticket(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tickets SET subject = ?2, body = ?3, language = ?4, category = ?5, \
                 category_confidence = ?6, priority = ?7, priority_confidence = ?8, \
                 triage_verdict = ?9, triage_confidence = ?10, status = ?11, assigned_to = ?12, \
                 suggested_response = ?13, summary = ?14, resolution_text = ?15, \
                 resolved_by = ?16, updated_at = ?17, resolved_at = ?18 WHERE id = ?1",
                params![
                    ticket.id.to_string(),
                    ticket.subject.clone(),
                    ticket.body.clone(),
                    opt_text_owned(ticket.language.clone()),
                    opt_text_owned(ticket.category.clone()),
                    opt_real(ticket.category_confidence),
                    ticket.priority.as_str(),
                    opt_real(ticket.priority_confidence),
                    opt_text_owned(ticket.triage_verdict.map(|v| v.as_str().to_string())),
                    opt_real(ticket.triage_confidence),
                    ticket.status.as_str(),
                    opt_text_owned(ticket.assigned_to.clone()),
                    opt_text_owned(ticket.suggested_response.clone()),
                    opt_text_owned(ticket.summary.clone()),
                    opt_text_owned(ticket.resolution_text.clone()),
                    opt_text_owned(ticket.resolved_by.clone()),
                    Utc::now().to_rfc3339(),
                    opt_text_owned(ticket.resolved_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_ticket: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::ticket_not_found(ticket.id));
        }
        Ok(())
    }

    async fn find_open_ticket(
        &self,
        source: TicketSource,
        source_conversation_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets \
                     WHERE source = ?1 AND source_conversation_id = ?2 \
                       AND status NOT IN ('resolved', 'closed') \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![source.as_str(), source_conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_open_ticket: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_open_ticket: {e}")))?
        {
            Some(row) => Ok(Some(row_to_ticket(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_latest_ticket(
        &self,
        source: TicketSource,
        source_conversation_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets \
                     WHERE source = ?1 AND source_conversation_id = ?2 \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![source.as_str(), source_conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_latest_ticket: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_latest_ticket: {e}")))?
        {
            Some(row) => Ok(Some(row_to_ticket(&row)?)),
            None => Ok(None),
        }
    }

    async fn append_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let attachments = serde_json::to_string(&message.attachments)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO messages (id, ticket_id, sender_id, sender_name, sender_type, \
                 content, attachments, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id.to_string(),
                    message.ticket_id.to_string(),
                    message.sender_id.clone(),
                    opt_text_owned(message.sender_name.clone()),
                    message.sender_type.as_str(),
                    message.content.clone(),
                    attachments,
                    message.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;
        Ok(())
    }

    async fn list_messages(&self, ticket_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, ticket_id, sender_id, sender_name, sender_type, content, \
                 attachments, created_at FROM messages WHERE ticket_id = ?1 ORDER BY created_at",
                params![ticket_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn upsert_nlp_result(&self, result: &NlpResult) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO nlp_results (ticket_id, category, category_confidence, priority, \
                 priority_confidence, triage_verdict, triage_confidence, summary, \
                 suggested_response, processed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(ticket_id) DO UPDATE SET category = ?2, category_confidence = ?3, \
                 priority = ?4, priority_confidence = ?5, triage_verdict = ?6, \
                 triage_confidence = ?7, summary = ?8, suggested_response = ?9, \
                 processed_at = ?10",
                params![
                    result.ticket_id.to_string(),
                    result.category.clone(),
                    f64::from(result.category_confidence),
                    result.priority.as_str(),
                    f64::from(result.priority_confidence),
                    result.triage_verdict.as_str(),
                    f64::from(result.triage_confidence),
                    opt_text_owned(result.summary.clone()),
                    opt_text_owned(result.suggested_response.clone()),
                    result.processed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_nlp_result: {e}")))?;
        Ok(())
    }

    async fn get_nlp_result(&self, ticket_id: Uuid) -> Result<Option<NlpResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT ticket_id, category, category_confidence, priority, priority_confidence, \
                 triage_verdict, triage_confidence, summary, suggested_response, processed_at \
                 FROM nlp_results WHERE ticket_id = ?1",
                params![ticket_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_nlp_result: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_nlp_result: {e}")))?
        else {
            return Ok(None);
        };

        let priority: String = get_text(&row, 3)?;
        let verdict: String = get_text(&row, 5)?;
        let processed: String = get_text(&row, 9)?;
        Ok(Some(NlpResult {
            ticket_id,
            category: get_text(&row, 1)?,
            category_confidence: get_real(&row, 2)? as f32,
            priority: Priority::parse(&priority).unwrap_or(Priority::Medium),
            priority_confidence: get_real(&row, 4)? as f32,
            triage_verdict: TriageVerdict::parse(&verdict).unwrap_or(TriageVerdict::NeedsHuman),
            triage_confidence: get_real(&row, 6)? as f32,
            summary: row.get(7).ok(),
            suggested_response: row.get(8).ok(),
            processed_at: parse_datetime(&processed),
        }))
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO audit_log (ticket_id, action, detail, elapsed_ms, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.ticket_id.to_string(),
                    record.action.clone(),
                    record.detail.clone(),
                    match record.elapsed_ms {
                        Some(ms) => libsql::Value::Integer(ms as i64),
                        None => libsql::Value::Null,
                    },
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_audit: {e}")))?;
        Ok(())
    }

    async fn list_audit(&self, ticket_id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT ticket_id, action, detail, elapsed_ms, created_at FROM audit_log \
                 WHERE ticket_id = ?1 ORDER BY id",
                params![ticket_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_audit: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_audit: {e}")))?
        {
            let created: String = get_text(&row, 4)?;
            records.push(AuditRecord {
                ticket_id,
                action: get_text(&row, 1)?,
                detail: get_text(&row, 2)?,
                elapsed_ms: row.get::<i64>(3).ok().map(|v| v as u64),
                created_at: parse_datetime(&created),
            });
        }
        Ok(records)
    }

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO feedback (ticket_id, rating, comment, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.ticket_id.to_string(),
                    i64::from(record.rating),
                    opt_text_owned(record.comment.clone()),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_feedback: {e}")))?;
        Ok(())
    }

    async fn upsert_contact(&self, contact: &ContactRef) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO contacts (source, source_user_id, name, email, phone) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(source, source_user_id) DO UPDATE SET \
                 name = COALESCE(?3, name), email = COALESCE(?4, email), \
                 phone = COALESCE(?5, phone)",
                params![
                    contact.source.as_str(),
                    contact.source_user_id.clone(),
                    opt_text_owned(contact.name.clone()),
                    opt_text_owned(contact.email.clone()),
                    opt_text_owned(contact.phone.clone()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_contact: {e}")))?;
        Ok(())
    }

    async fn get_contact(
        &self,
        source: TicketSource,
        source_user_id: &str,
    ) -> Result<Option<ContactRef>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT source, source_user_id, name, email, phone FROM contacts \
                 WHERE source = ?1 AND source_user_id = ?2",
                params![source.as_str(), source_user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact: {e}")))?
        {
            Some(row) => Ok(Some(ContactRef {
                source,
                source_user_id: get_text(&row, 1)?,
                name: row.get(2).ok(),
                email: row.get(3).ok(),
                phone: row.get(4).ok(),
            })),
            None => Ok(None),
        }
    }

    async fn get_channel_cursor(&self, channel: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM channel_cursors WHERE channel = ?1",
                params![channel],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_channel_cursor: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_channel_cursor: {e}")))?
        {
            Some(row) => Ok(Some(get_text(&row, 0)?)),
            None => Ok(None),
        }
    }

    async fn set_channel_cursor(&self, channel: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO channel_cursors (channel, value) VALUES (?1, ?2) \
                 ON CONFLICT(channel) DO UPDATE SET value = ?2",
                params![channel, value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_channel_cursor: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SenderType;

    #[tokio::test]
    async fn ticket_round_trip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut ticket = Ticket::new(TicketSource::Telegram, "123", "VPN", "VPN не работает");
        ticket.language = Some("ru".into());
        store.create_ticket(&ticket).await.unwrap();

        let loaded = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(loaded.source, TicketSource::Telegram);
        assert_eq!(loaded.source_conversation_id, "123");
        assert_eq!(loaded.body, "VPN не работает");
        assert_eq!(loaded.language.as_deref(), Some("ru"));
        assert_eq!(loaded.status, TicketStatus::New);
    }

    #[tokio::test]
    async fn open_lookup_skips_resolved_rows() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut ticket = Ticket::new(TicketSource::Email, "a@x.com", "s", "b");
        store.create_ticket(&ticket).await.unwrap();

        ticket.status = TicketStatus::Resolved;
        ticket.resolved_at = Some(Utc::now());
        store.update_ticket(&ticket).await.unwrap();

        assert!(store
            .find_open_ticket(TicketSource::Email, "a@x.com")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_latest_ticket(TicketSource::Email, "a@x.com")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn update_ticket_persists_classification_fields() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut ticket = Ticket::new(TicketSource::Whatsapp, "79001", "s", "b");
        store.create_ticket(&ticket).await.unwrap();

        ticket.category = Some("vpn".into());
        ticket.category_confidence = Some(0.93);
        ticket.triage_verdict = Some(TriageVerdict::AutoResolvable);
        ticket.triage_confidence = Some(0.88);
        ticket.status = TicketStatus::DraftPending;
        ticket.suggested_response = Some("Try restarting the VPN client.".into());
        store.update_ticket(&ticket).await.unwrap();

        let loaded = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(loaded.category.as_deref(), Some("vpn"));
        assert!((loaded.category_confidence.unwrap() - 0.93).abs() < 1e-6);
        assert_eq!(loaded.triage_verdict, Some(TriageVerdict::AutoResolvable));
        assert_eq!(loaded.status, TicketStatus::DraftPending);
    }

    #[tokio::test]
    async fn message_and_nlp_round_trip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let ticket = Ticket::new(TicketSource::Telegram, "55", "s", "b");
        store.create_ticket(&ticket).await.unwrap();

        let msg = Message::new(ticket.id, "55", SenderType::User, "hello")
            .with_sender_name("Ivan")
            .with_attachments(vec![Attachment {
                kind: "image".into(),
                url: Some("https://cdn/x.png".into()),
                mime_type: Some("image/png".into()),
            }]);
        store.append_message(&msg).await.unwrap();

        let msgs = store.list_messages(ticket.id).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].sender_name.as_deref(), Some("Ivan"));
        assert_eq!(msgs[0].attachments, msg.attachments);

        let nlp = NlpResult {
            ticket_id: ticket.id,
            category: "vpn".into(),
            category_confidence: 0.9,
            priority: Priority::High,
            priority_confidence: 0.8,
            triage_verdict: TriageVerdict::AutoResolvable,
            triage_confidence: 0.85,
            summary: Some("vpn down".into()),
            suggested_response: None,
            processed_at: Utc::now(),
        };
        store.upsert_nlp_result(&nlp).await.unwrap();

        // Upsert replaces wholesale
        let nlp2 = NlpResult {
            category: "network".into(),
            suggested_response: Some("draft".into()),
            ..nlp
        };
        store.upsert_nlp_result(&nlp2).await.unwrap();

        let loaded = store.get_nlp_result(ticket.id).await.unwrap().unwrap();
        assert_eq!(loaded.category, "network");
        assert_eq!(loaded.suggested_response.as_deref(), Some("draft"));
    }

    #[tokio::test]
    async fn audit_contact_and_cursor_round_trip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let ticket = Ticket::new(TicketSource::Email, "u@x.com", "s", "b");
        store.create_ticket(&ticket).await.unwrap();

        store
            .append_audit(&AuditRecord::new(ticket.id, "classified", "vpn 0.93").with_elapsed(120))
            .await
            .unwrap();
        let audit = store.list_audit(ticket.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "classified");
        assert_eq!(audit[0].elapsed_ms, Some(120));

        let contact = ContactRef {
            source: TicketSource::Email,
            source_user_id: "u@x.com".into(),
            name: Some("User".into()),
            email: Some("u@x.com".into()),
            phone: None,
        };
        store.upsert_contact(&contact).await.unwrap();
        let loaded = store
            .get_contact(TicketSource::Email, "u@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name.as_deref(), Some("User"));

        store.set_channel_cursor("mailbox", "99").await.unwrap();
        store.set_channel_cursor("mailbox", "120").await.unwrap();
        assert_eq!(
            store.get_channel_cursor("mailbox").await.unwrap().as_deref(),
            Some("120")
        );
    }
}
