//! Processing worker — drains `ticket_processing` through the decision
//! pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{
    GROUP_PROCESSORS, MessageBus, QueueEntry, STREAM_TICKET_PROCESSING, TicketProcessingJob,
};
use crate::config::WorkerConfig;
use crate::pipeline::TicketProcessor;

use super::{INITIAL_BACKOFF, ack_or_warn, read_or_recover};

pub struct ProcessingWorker {
    bus: Arc<dyn MessageBus>,
    processor: Arc<TicketProcessor>,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
}

impl ProcessingWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        processor: Arc<TicketProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            bus,
            processor,
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Spawn the consume loop. Clearing the returned flag stops it at the
    /// next poll boundary.
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        processor: Arc<TicketProcessor>,
        config: WorkerConfig,
    ) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let worker = Self::new(bus, processor, config);
        let running = worker.running.clone();
        (tokio::spawn(async move { worker.run().await }), running)
    }

    pub async fn run(&self) {
        if let Err(e) = self
            .bus
            .ensure_group(STREAM_TICKET_PROCESSING, GROUP_PROCESSORS)
            .await
        {
            error!("Processor group setup failed: {e}");
        }
        info!(consumer = %self.config.consumer_name, "Processing worker started");

        let mut backoff = INITIAL_BACKOFF;
        while self.running.load(Ordering::SeqCst) {
            let entries = read_or_recover(
                self.bus.as_ref(),
                STREAM_TICKET_PROCESSING,
                GROUP_PROCESSORS,
                &self.config,
                &mut backoff,
            )
            .await;
            for entry in entries {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.handle(entry).await;
            }
        }
        info!(consumer = %self.config.consumer_name, "Processing worker stopped");
    }

    async fn handle(&self, entry: QueueEntry) {
        let job: TicketProcessingJob = match entry.decode() {
            Ok(job) => job,
            Err(e) => {
                // Redelivery cannot fix a malformed payload; drop it.
                error!(entry_id = entry.id, "Undecodable processing job: {e}");
                ack_or_warn(
                    self.bus.as_ref(),
                    STREAM_TICKET_PROCESSING,
                    GROUP_PROCESSORS,
                    entry.id,
                )
                .await;
                return;
            }
        };

        match self.processor.process(&job).await {
            Ok(()) => {
                ack_or_warn(
                    self.bus.as_ref(),
                    STREAM_TICKET_PROCESSING,
                    GROUP_PROCESSORS,
                    entry.id,
                )
                .await;
            }
            Err(e) => {
                // Left pending; the same consumer picks it back up.
                warn!(ticket_id = %job.ticket_id, "Processing failed, entry kept for redelivery: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::bus::{MemoryBus, enqueue};
    use crate::config::PipelineConfig;
    use crate::error::ServiceError;
    use crate::model::{Ticket, TicketSource, TicketStatus};
    use crate::services::{CompletionService, SearchHit, SearchService};
    use crate::store::{MemoryStore, TicketStore};

    struct ScriptedCompletion;

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        async fn complete(
            &self,
            system: &str,
            _user: &str,
        ) -> Result<String, ServiceError> {
            if system.contains("ISO 639-1") {
                return Ok("en".into());
            }
            if system.contains("ticket classifier") {
                return Ok(r#"{"category": "vpn", "category_confidence": 0.93,
                    "priority": "high", "priority_confidence": 0.9,
                    "triage_verdict": "auto_resolvable", "triage_confidence": 0.88}"#
                    .into());
            }
            Ok("Restart the VPN client.".into())
        }
    }

    struct OneHit;

    #[async_trait]
    impl SearchService for OneHit {
        async fn search(
            &self,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<SearchHit>, ServiceError> {
            Ok(vec![SearchHit {
                title: "KB-101".into(),
                snippet: "Restart the client.".into(),
                url: None,
                score: 0.9,
            }])
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            consumer_name: "test-worker".into(),
            block_timeout: Duration::from_millis(50),
            batch_size: 8,
            max_backoff: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn worker_processes_and_acks_jobs() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let processor = Arc::new(TicketProcessor::new(
            store.clone(),
            Arc::new(ScriptedCompletion),
            Arc::new(OneHit),
            PipelineConfig::default(),
        ));

        let (handle, running) =
            ProcessingWorker::spawn(bus.clone(), processor, test_config());
        // Let the worker create its group before appending.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ticket = Ticket::new(TicketSource::Telegram, "123", "vpn down", "my vpn is down");
        store.create_ticket(&ticket).await.unwrap();
        enqueue(
            bus.as_ref(),
            STREAM_TICKET_PROCESSING,
            &TicketProcessingJob::new(ticket.id, true, TicketSource::Telegram),
        )
        .await
        .unwrap();

        let mut processed = false;
        for _ in 0..100 {
            let t = store.get_ticket(ticket.id).await.unwrap().unwrap();
            let pending = bus
                .pending_count(STREAM_TICKET_PROCESSING, GROUP_PROCESSORS)
                .await
                .unwrap();
            if t.status == TicketStatus::DraftPending && pending == 0 {
                processed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(processed, "job was not processed and acked in time");

        running.store(false, Ordering::SeqCst);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_not_looped() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let processor = Arc::new(TicketProcessor::new(
            store,
            Arc::new(ScriptedCompletion),
            Arc::new(OneHit),
            PipelineConfig::default(),
        ));

        let (handle, running) =
            ProcessingWorker::spawn(bus.clone(), processor, test_config());
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.append(
            STREAM_TICKET_PROCESSING,
            &serde_json::json!({"not": "a job"}),
        )
        .await
        .unwrap();

        let mut drained = false;
        for _ in 0..100 {
            if bus
                .pending_count(STREAM_TICKET_PROCESSING, GROUP_PROCESSORS)
                .await
                .unwrap()
                == 0
            {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drained, "malformed entry was not acked away");

        running.store(false, Ordering::SeqCst);
        handle.await.unwrap();
    }
}
