//! Ticket processor — runs the full decision pipeline for one job.
//!
//! Stage order is fixed: language, classification, escalation screen,
//! retrieval, drafting, then the ordered status decision. Every stage with
//! an external call is bounded by the configured timeout. Classification has
//! a keyword fallback; retrieval/drafting failures force the ticket to
//! `in_progress` so a human picks it up. Auto-drafted replies always stop at
//! `draft_pending` — the pipeline never resolves a ticket on its own.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::TicketProcessingJob;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, ServiceError};
use crate::model::{NlpResult, Priority, Ticket, TicketStatus, TriageVerdict};
use crate::pipeline::classify::{
    Classification, build_classification_system_prompt, build_classification_user_prompt,
    fallback_classification, find_escalation_keyword, parse_classification_response,
};
use crate::pipeline::language::detect_language;
use crate::services::{CompletionService, SearchHit, SearchService};
use crate::store::{AuditRecord, TicketStore};

/// Sentinel the drafting prompt demands when the excerpts cannot answer the
/// ticket.
const DECLINE_SENTINEL: &str = "CANNOT_ANSWER";

pub struct TicketProcessor {
    store: Arc<dyn TicketStore>,
    completion: Arc<dyn CompletionService>,
    search: Arc<dyn SearchService>,
    config: PipelineConfig,
}

impl TicketProcessor {
    pub fn new(
        store: Arc<dyn TicketStore>,
        completion: Arc<dyn CompletionService>,
        search: Arc<dyn SearchService>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            completion,
            search,
            config,
        }
    }

    /// Process one job to completion. Pipeline-stage failures are absorbed
    /// (the ticket lands in `in_progress`); only persistence failures
    /// propagate, leaving the queue entry unacked for redelivery.
    pub async fn process(&self, job: &TicketProcessingJob) -> Result<()> {
        let started = Instant::now();
        let Some(mut ticket) = self.store.get_ticket(job.ticket_id).await? else {
            warn!(ticket_id = %job.ticket_id, "Job references a missing ticket; skipping");
            return Ok(());
        };
        if ticket.is_classified() && !job.is_new {
            debug!(ticket_id = %ticket.id, "Already classified and no new message; skipping");
            return Ok(());
        }

        match self.run_stages(&mut ticket).await {
            Ok(detail) => {
                let nlp = build_nlp_result(&ticket);
                self.store.upsert_nlp_result(&nlp).await?;
                self.store.update_ticket(&ticket).await?;
                let elapsed = started.elapsed().as_millis() as u64;
                self.store
                    .append_audit(
                        &AuditRecord::new(ticket.id, "pipeline_decision", &detail)
                            .with_elapsed(elapsed),
                    )
                    .await?;
                info!(
                    ticket_id = %ticket.id,
                    status = %ticket.status,
                    elapsed_ms = elapsed,
                    "Ticket processed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(ticket_id = %ticket.id, "Pipeline failed: {e}; routing to operators");
                ticket.status = TicketStatus::InProgress;
                self.store.update_ticket(&ticket).await?;
                self.store
                    .append_audit(
                        &AuditRecord::new(ticket.id, "processing_failed", e.to_string())
                            .with_elapsed(started.elapsed().as_millis() as u64),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Run the decision stages, mutating the ticket in place. Returns the
    /// audit detail line for the decision taken.
    async fn run_stages(&self, ticket: &mut Ticket) -> std::result::Result<String, PipelineError> {
        // 1. Language
        let text = format!("{}\n{}", ticket.subject, ticket.body);
        let language =
            detect_language(self.completion.as_ref(), self.config.stage_timeout, &text).await;
        ticket.language = Some(language.clone());

        // 2. Classification, with the keyword fallback on any failure.
        let classification = self.classify(ticket).await;

        // 3. Escalation screen overrides everything else.
        if let Some(keyword) = find_escalation_keyword(&self.config, &text) {
            apply_classification(ticket, &classification);
            ticket.priority = Priority::Critical;
            ticket.priority_confidence = Some(1.0);
            ticket.triage_verdict = Some(TriageVerdict::Escalate);
            ticket.triage_confidence = Some(1.0);
            ticket.status = TicketStatus::Escalated;
            return Ok(format!(
                "status=escalated keyword=\"{keyword}\" category={}",
                classification.category
            ));
        }

        apply_classification(ticket, &classification);

        // 4. Retrieval + drafting, only on the auto-resolve path.
        let category_auto = self
            .config
            .is_auto_resolvable_category(&classification.category);
        let mut verdict = classification.triage_verdict;
        let mut hits: Vec<SearchHit> = Vec::new();

        if category_auto && verdict == TriageVerdict::AutoResolvable {
            hits = self.search_kb(ticket, &classification.category).await?;
            if hits.is_empty() {
                verdict = TriageVerdict::NeedsHuman;
            }
        } else if verdict == TriageVerdict::AutoResolvable {
            verdict = TriageVerdict::NeedsHuman;
        }

        let draft = if verdict == TriageVerdict::AutoResolvable
            && classification.category_confidence >= self.config.draft_min_threshold
        {
            self.draft_response(ticket, &language, &hits).await?
        } else {
            None
        };

        ticket.triage_verdict = Some(verdict);
        ticket.suggested_response = draft.clone();

        // 5. Ordered status decision.
        ticket.status = decide_status(
            &self.config,
            &classification,
            verdict,
            category_auto,
            draft.is_some(),
        );

        Ok(format!(
            "status={} category={} ({:.2}) priority={} verdict={} ({:.2}) drafted={}",
            ticket.status,
            classification.category,
            classification.category_confidence,
            classification.priority,
            verdict.as_str(),
            classification.triage_confidence,
            draft.is_some(),
        ))
    }

    async fn classify(&self, ticket: &Ticket) -> Classification {
        let system = build_classification_system_prompt(&self.config);
        let user = build_classification_user_prompt(
            &ticket.subject,
            &ticket.body,
            ticket.language.as_deref(),
        );

        let raw = match tokio::time::timeout(
            self.config.stage_timeout,
            self.completion.complete(&system, &user),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(ticket_id = %ticket.id, "Classification call failed: {e}; using keyword fallback");
                return fallback_classification(&self.config, &ticket.body);
            }
            Err(_) => {
                warn!(ticket_id = %ticket.id, "Classification timed out; using keyword fallback");
                return fallback_classification(&self.config, &ticket.body);
            }
        };

        match parse_classification_response(&self.config, &raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(ticket_id = %ticket.id, "Unusable classification ({e}); using keyword fallback");
                fallback_classification(&self.config, &ticket.body)
            }
        }
    }

    async fn search_kb(
        &self,
        ticket: &Ticket,
        category: &str,
    ) -> std::result::Result<Vec<SearchHit>, PipelineError> {
        let body_preview: String = ticket.body.chars().take(300).collect();
        let query = format!("{category} {} {body_preview}", ticket.subject);
        match tokio::time::timeout(
            self.config.stage_timeout,
            self.search.search(&query, self.config.search_limit),
        )
        .await
        {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) => Err(PipelineError::Triage(format!("knowledge search: {e}"))),
            Err(_) => Err(PipelineError::StageTimeout {
                stage: "search",
                timeout: self.config.stage_timeout,
            }),
        }
    }

    async fn draft_response(
        &self,
        ticket: &Ticket,
        language: &str,
        hits: &[SearchHit],
    ) -> std::result::Result<Option<String>, PipelineError> {
        if hits.is_empty() {
            return Ok(None);
        }
        let system = build_draft_system_prompt(language);
        let user = build_draft_user_prompt(&ticket.subject, &ticket.body, hits);

        let raw: std::result::Result<String, ServiceError> = match tokio::time::timeout(
            self.config.stage_timeout,
            self.completion.complete(&system, &user),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                return Err(PipelineError::StageTimeout {
                    stage: "draft",
                    timeout: self.config.stage_timeout,
                });
            }
        };

        let raw = raw.map_err(|e| PipelineError::Drafting(e.to_string()))?;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains(DECLINE_SENTINEL) {
            debug!(ticket_id = %ticket.id, "Drafting declined; no grounded answer");
            return Ok(None);
        }
        Ok(Some(trimmed.to_string()))
    }
}

// ── Decision logic ──────────────────────────────────────────────────

/// The ordered status decision; first match wins. Auto-drafted replies stop
/// at `draft_pending` for human approval in every case.
fn decide_status(
    config: &PipelineConfig,
    classification: &Classification,
    verdict: TriageVerdict,
    category_auto: bool,
    drafted: bool,
) -> TicketStatus {
    if category_auto
        && verdict == TriageVerdict::AutoResolvable
        && classification.category_confidence >= config.auto_resolve_threshold
        && classification.triage_confidence >= config.triage_threshold
        && drafted
    {
        return TicketStatus::DraftPending;
    }
    if classification.category_confidence >= config.draft_min_threshold && drafted {
        return TicketStatus::DraftPending;
    }
    TicketStatus::InProgress
}

fn apply_classification(ticket: &mut Ticket, c: &Classification) {
    ticket.category = Some(c.category.clone());
    ticket.category_confidence = Some(c.category_confidence);
    ticket.priority = c.priority;
    ticket.priority_confidence = Some(c.priority_confidence);
    ticket.triage_verdict = Some(c.triage_verdict);
    ticket.triage_confidence = Some(c.triage_confidence);
    ticket.summary = c.summary.clone();
}

/// Snapshot the ticket's pipeline fields into the 1:1 NLP record.
fn build_nlp_result(ticket: &Ticket) -> NlpResult {
    NlpResult {
        ticket_id: ticket.id,
        category: ticket.category.clone().unwrap_or_else(|| "other".into()),
        category_confidence: ticket.category_confidence.unwrap_or(0.0),
        priority: ticket.priority,
        priority_confidence: ticket.priority_confidence.unwrap_or(0.0),
        triage_verdict: ticket.triage_verdict.unwrap_or(TriageVerdict::NeedsHuman),
        triage_confidence: ticket.triage_confidence.unwrap_or(0.0),
        summary: ticket.summary.clone(),
        suggested_response: ticket.suggested_response.clone(),
        processed_at: Utc::now(),
    }
}

// ── Drafting prompts ────────────────────────────────────────────────

fn build_draft_system_prompt(language: &str) -> String {
    format!(
        "You draft support replies for an IT helpdesk.\n\n\
         Rules:\n\
         - Use ONLY the provided knowledge-base excerpts; never invent steps\n\
         - If the excerpts do not contain the answer, reply with exactly {DECLINE_SENTINEL}\n\
         - Write the reply in the user's language ({language})\n\
         - Be concise and actionable; numbered steps where natural\n\
         - No greetings boilerplate beyond one short opening line"
    )
}

fn build_draft_user_prompt(subject: &str, body: &str, hits: &[SearchHit]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str("Knowledge-base excerpts:\n");
    for (i, hit) in hits.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n{}\n\n", i + 1, hit.title, hit.snippet));
    }
    prompt.push_str(&format!("Ticket subject: {subject}\n"));
    let body_preview: String = body.chars().take(1500).collect();
    prompt.push_str(&format!("Ticket:\n{body_preview}"));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::model::TicketSource;
    use crate::store::MemoryStore;

    /// Scripted completion service. Routes on the system prompt: language
    /// probe, classifier, or drafter.
    struct MockCompletion {
        classification: Option<String>,
        draft: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockCompletion {
        fn new(classification: &str, draft: &str) -> Self {
            Self {
                classification: Some(classification.to_string()),
                draft: Some(draft.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                classification: None,
                draft: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionService for MockCompletion {
        async fn complete(
            &self,
            system: &str,
            _user: &str,
        ) -> std::result::Result<String, ServiceError> {
            let kind = if system.contains("ISO 639-1") {
                "language"
            } else if system.contains("ticket classifier") {
                "classify"
            } else {
                "draft"
            };
            self.calls.lock().unwrap().push(kind.to_string());
            let scripted = match kind {
                "language" => Some("en".to_string()),
                "classify" => self.classification.clone(),
                _ => self.draft.clone(),
            };
            scripted.ok_or_else(|| ServiceError::Completion("scripted failure".into()))
        }
    }

    struct MockSearch {
        hits: Vec<SearchHit>,
        fail: bool,
    }

    impl MockSearch {
        fn with_hits(n: usize) -> Self {
            Self {
                hits: (0..n)
                    .map(|i| SearchHit {
                        title: format!("KB-10{i}: VPN troubleshooting"),
                        snippet: "Restart the VPN client, then re-enter credentials.".into(),
                        url: None,
                        score: 0.9,
                    })
                    .collect(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                hits: Vec::new(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl SearchService for MockSearch {
        async fn search(
            &self,
            _query: &str,
            limit: usize,
        ) -> std::result::Result<Vec<SearchHit>, ServiceError> {
            if self.fail {
                return Err(ServiceError::Search("scripted failure".into()));
            }
            Ok(self.hits.iter().take(limit).cloned().collect())
        }
    }

    const VPN_CLASSIFICATION: &str = r#"{"category": "vpn", "category_confidence": 0.93,
        "priority": "high", "priority_confidence": 0.9,
        "triage_verdict": "auto_resolvable", "triage_confidence": 0.88,
        "summary": "VPN connection failure"}"#;

    async fn processor_with(
        completion: MockCompletion,
        search: MockSearch,
    ) -> (TicketProcessor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let processor = TicketProcessor::new(
            store.clone(),
            Arc::new(completion),
            Arc::new(search),
            PipelineConfig::default(),
        );
        (processor, store)
    }

    async fn seeded_ticket(store: &MemoryStore, body: &str) -> Ticket {
        let ticket = Ticket::new(TicketSource::Telegram, "123", body, body);
        store.create_ticket(&ticket).await.unwrap();
        ticket
    }

    #[tokio::test]
    async fn high_confidence_vpn_ticket_stops_at_draft_pending() {
        let (processor, store) = processor_with(
            MockCompletion::new(VPN_CLASSIFICATION, "Попробуйте перезапустить VPN-клиент."),
            MockSearch::with_hits(2),
        )
        .await;
        let ticket = seeded_ticket(&store, "VPN не работает").await;

        processor
            .process(&TicketProcessingJob::new(
                ticket.id,
                true,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();

        let processed = store.get_ticket(ticket.id).await.unwrap().unwrap();
        // 0.93 >= 0.90 and 0.88 >= 0.85, but approval is still required.
        assert_eq!(processed.status, TicketStatus::DraftPending);
        assert_ne!(processed.status, TicketStatus::Resolved);
        assert_eq!(processed.language.as_deref(), Some("ru"));
        assert_eq!(processed.category.as_deref(), Some("vpn"));
        assert_eq!(processed.priority, Priority::High);
        assert_eq!(processed.triage_verdict, Some(TriageVerdict::AutoResolvable));
        assert_eq!(
            processed.suggested_response.as_deref(),
            Some("Попробуйте перезапустить VPN-клиент.")
        );

        let nlp = store.get_nlp_result(ticket.id).await.unwrap().unwrap();
        assert!((nlp.category_confidence - 0.93).abs() < 1e-6);
        assert!((nlp.triage_confidence - 0.88).abs() < 1e-6);

        let audit = store.list_audit(ticket.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].detail.contains("status=draft_pending"));
    }

    #[tokio::test]
    async fn escalation_keyword_always_wins() {
        // Classifier claims a calm, auto-resolvable ticket; the keyword
        // screen must override it.
        let calm = r#"{"category": "software", "category_confidence": 0.95,
            "priority": "low", "priority_confidence": 0.9,
            "triage_verdict": "auto_resolvable", "triage_confidence": 0.95}"#;
        let (processor, store) =
            processor_with(MockCompletion::new(calm, "draft"), MockSearch::with_hits(1)).await;
        let ticket = seeded_ticket(&store, "I think we have a data breach in the portal").await;

        processor
            .process(&TicketProcessingJob::new(
                ticket.id,
                true,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();

        let processed = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(processed.status, TicketStatus::Escalated);
        assert_eq!(processed.priority, Priority::Critical);
        assert_eq!(processed.triage_verdict, Some(TriageVerdict::Escalate));
        assert!(processed.suggested_response.is_none());

        let audit = store.list_audit(ticket.id).await.unwrap();
        assert!(audit[0].detail.contains("escalated"));
    }

    #[tokio::test]
    async fn classification_failure_falls_back_to_keywords() {
        let (processor, store) =
            processor_with(MockCompletion::failing(), MockSearch::with_hits(1)).await;
        let ticket = seeded_ticket(&store, "the vpn tunnel keeps dropping").await;

        processor
            .process(&TicketProcessingJob::new(
                ticket.id,
                true,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();

        let processed = store.get_ticket(ticket.id).await.unwrap().unwrap();
        // Never left unclassified, but low fallback confidence means no
        // draft and operator routing.
        assert_eq!(processed.category.as_deref(), Some("vpn"));
        assert_eq!(processed.status, TicketStatus::InProgress);
        assert!(processed.suggested_response.is_none());
    }

    #[tokio::test]
    async fn zero_hits_flip_verdict_to_needs_human() {
        let (processor, store) = processor_with(
            MockCompletion::new(VPN_CLASSIFICATION, "unused"),
            MockSearch::with_hits(0),
        )
        .await;
        let ticket = seeded_ticket(&store, "VPN не работает").await;

        processor
            .process(&TicketProcessingJob::new(
                ticket.id,
                true,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();

        let processed = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(processed.status, TicketStatus::InProgress);
        assert_eq!(processed.triage_verdict, Some(TriageVerdict::NeedsHuman));
        assert!(processed.suggested_response.is_none());
    }

    #[tokio::test]
    async fn declined_draft_keeps_suggestion_empty() {
        let (processor, store) = processor_with(
            MockCompletion::new(VPN_CLASSIFICATION, "CANNOT_ANSWER"),
            MockSearch::with_hits(2),
        )
        .await;
        let ticket = seeded_ticket(&store, "VPN не работает").await;

        processor
            .process(&TicketProcessingJob::new(
                ticket.id,
                true,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();

        let processed = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert!(processed.suggested_response.is_none());
        assert_eq!(processed.status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn search_failure_forces_in_progress_and_audits() {
        let (processor, store) = processor_with(
            MockCompletion::new(VPN_CLASSIFICATION, "unused"),
            MockSearch::failing(),
        )
        .await;
        let ticket = seeded_ticket(&store, "VPN не работает").await;

        processor
            .process(&TicketProcessingJob::new(
                ticket.id,
                true,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();

        let processed = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(processed.status, TicketStatus::InProgress);
        let audit = store.list_audit(ticket.id).await.unwrap();
        assert_eq!(audit[0].action, "processing_failed");
    }

    #[tokio::test]
    async fn classified_ticket_without_new_message_is_skipped() {
        let (processor, store) = processor_with(
            MockCompletion::new(VPN_CLASSIFICATION, "draft"),
            MockSearch::with_hits(1),
        )
        .await;
        let mut ticket = seeded_ticket(&store, "VPN не работает").await;
        ticket.category = Some("vpn".into());
        ticket.status = TicketStatus::DraftPending;
        store.update_ticket(&ticket).await.unwrap();

        processor
            .process(&TicketProcessingJob::new(
                ticket.id,
                false,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();

        // Untouched: no audit row, status unchanged.
        assert!(store.list_audit(ticket.id).await.unwrap().is_empty());
        let unchanged = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TicketStatus::DraftPending);
    }

    #[tokio::test]
    async fn missing_ticket_is_a_clean_skip() {
        let (processor, _store) = processor_with(
            MockCompletion::new(VPN_CLASSIFICATION, "draft"),
            MockSearch::with_hits(1),
        )
        .await;
        processor
            .process(&TicketProcessingJob::new(
                uuid::Uuid::new_v4(),
                true,
                TicketSource::Telegram,
            ))
            .await
            .unwrap();
    }

    #[test]
    fn status_decision_ordering() {
        let cfg = PipelineConfig::default();
        let classification = |cat_conf: f32, triage_conf: f32| Classification {
            category: "vpn".into(),
            category_confidence: cat_conf,
            priority: Priority::Medium,
            priority_confidence: 0.5,
            triage_verdict: TriageVerdict::AutoResolvable,
            triage_confidence: triage_conf,
            summary: None,
        };

        // Full auto-resolve gate met, still only draft_pending.
        assert_eq!(
            decide_status(&cfg, &classification(0.93, 0.88), TriageVerdict::AutoResolvable, true, true),
            TicketStatus::DraftPending
        );
        // Below the auto gates but above draft_min with a draft.
        assert_eq!(
            decide_status(&cfg, &classification(0.70, 0.70), TriageVerdict::AutoResolvable, true, true),
            TicketStatus::DraftPending
        );
        // Draft required for either draft_pending rule.
        assert_eq!(
            decide_status(&cfg, &classification(0.95, 0.95), TriageVerdict::AutoResolvable, true, false),
            TicketStatus::InProgress
        );
        // Confidence below draft_min.
        assert_eq!(
            decide_status(&cfg, &classification(0.50, 0.95), TriageVerdict::AutoResolvable, true, true),
            TicketStatus::InProgress,
        );
    }
}
