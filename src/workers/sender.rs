//! Sender worker — drains `outbound_messages` and
//! `resolution_notifications` through the connector router.
//!
//! Delivery is at-least-once: an entry is acked only after the channel send
//! succeeds, so a connector outage leaves replies pending instead of
//! dropping them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{
    GROUP_SENDERS, MessageBus, OutboundMessage, QueueEntry, ResolutionNotification,
    STREAM_OUTBOUND_MESSAGES, STREAM_RESOLUTION_NOTIFICATIONS,
};
use crate::config::WorkerConfig;
use crate::router::ConnectorRouter;

use super::{INITIAL_BACKOFF, ack_or_warn, read_or_recover};

pub struct SenderWorker {
    bus: Arc<dyn MessageBus>,
    router: Arc<ConnectorRouter>,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
}

impl SenderWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        router: Arc<ConnectorRouter>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            bus,
            router,
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Spawn the consume loop. Clearing the returned flag stops it at the
    /// next poll boundary.
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        router: Arc<ConnectorRouter>,
        config: WorkerConfig,
    ) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let worker = Self::new(bus, router, config);
        let running = worker.running.clone();
        (tokio::spawn(async move { worker.run().await }), running)
    }

    pub async fn run(&self) {
        for stream in [STREAM_OUTBOUND_MESSAGES, STREAM_RESOLUTION_NOTIFICATIONS] {
            if let Err(e) = self.bus.ensure_group(stream, GROUP_SENDERS).await {
                error!(stream, "Sender group setup failed: {e}");
            }
        }
        info!(consumer = %self.config.consumer_name, "Sender worker started");

        let mut backoff = INITIAL_BACKOFF;
        while self.running.load(Ordering::SeqCst) {
            let entries = read_or_recover(
                self.bus.as_ref(),
                STREAM_OUTBOUND_MESSAGES,
                GROUP_SENDERS,
                &self.config,
                &mut backoff,
            )
            .await;
            for entry in entries {
                self.deliver_outbound(entry).await;
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let entries = read_or_recover(
                self.bus.as_ref(),
                STREAM_RESOLUTION_NOTIFICATIONS,
                GROUP_SENDERS,
                &self.config,
                &mut backoff,
            )
            .await;
            for entry in entries {
                self.deliver_resolution(entry).await;
            }
        }
        info!(consumer = %self.config.consumer_name, "Sender worker stopped");
    }

    async fn deliver_outbound(&self, entry: QueueEntry) {
        let job: OutboundMessage = match entry.decode() {
            Ok(job) => job,
            Err(e) => {
                error!(entry_id = entry.id, "Undecodable outbound message: {e}");
                ack_or_warn(
                    self.bus.as_ref(),
                    STREAM_OUTBOUND_MESSAGES,
                    GROUP_SENDERS,
                    entry.id,
                )
                .await;
                return;
            }
        };

        match self
            .router
            .send_response(job.ticket_id, &job.message, &job.options)
            .await
        {
            Ok(()) => {
                ack_or_warn(
                    self.bus.as_ref(),
                    STREAM_OUTBOUND_MESSAGES,
                    GROUP_SENDERS,
                    entry.id,
                )
                .await;
            }
            Err(e) => {
                warn!(ticket_id = %job.ticket_id, "Send failed, reply kept for redelivery: {e}");
            }
        }
    }

    async fn deliver_resolution(&self, entry: QueueEntry) {
        let job: ResolutionNotification = match entry.decode() {
            Ok(job) => job,
            Err(e) => {
                error!(entry_id = entry.id, "Undecodable resolution notice: {e}");
                ack_or_warn(
                    self.bus.as_ref(),
                    STREAM_RESOLUTION_NOTIFICATIONS,
                    GROUP_SENDERS,
                    entry.id,
                )
                .await;
                return;
            }
        };

        match self
            .router
            .notify_resolved(job.ticket_id, &job.resolution)
            .await
        {
            Ok(()) => {
                ack_or_warn(
                    self.bus.as_ref(),
                    STREAM_RESOLUTION_NOTIFICATIONS,
                    GROUP_SENDERS,
                    entry.id,
                )
                .await;
            }
            Err(e) => {
                warn!(ticket_id = %job.ticket_id, "Resolution notice failed, kept for redelivery: {e}");
            }
        }
    }
}
