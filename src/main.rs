use std::sync::Arc;
use std::sync::atomic::Ordering;

use deskflow::bus::{LibSqlBus, MessageBus};
use deskflow::config::{
    MailboxConfig, PipelineConfig, TelegramConfig, WhatsappConfig, WorkerConfig,
};
use deskflow::connectors::{
    Connector, ConnectorEvent, MailboxConnector, TelegramConnector, WhatsappConnector,
};
use deskflow::pipeline::TicketProcessor;
use deskflow::router::ConnectorRouter;
use deskflow::services::{HttpSearchService, OpenAiCompletionService};
use deskflow::store::{LibSqlStore, TicketStore};
use deskflow::workers::{ProcessingWorker, SenderWorker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    eprintln!("🎫 Deskflow v{}", env!("CARGO_PKG_VERSION"));

    // ── AI services ──────────────────────────────────────────────────────
    let completion = Arc::new(OpenAiCompletionService::from_env().unwrap_or_else(|| {
        eprintln!("Error: COMPLETION_API_KEY not set");
        eprintln!("  export COMPLETION_API_KEY=sk-...");
        std::process::exit(1);
    }));
    let search = Arc::new(HttpSearchService::from_env().unwrap_or_else(|| {
        eprintln!("Error: SEARCH_API_URL not set");
        eprintln!("  export SEARCH_API_URL=https://kb.example.com/search");
        std::process::exit(1);
    }));

    // ── Storage ──────────────────────────────────────────────────────────
    let db_path =
        std::env::var("DESKFLOW_DB_PATH").unwrap_or_else(|_| "./data/deskflow.db".to_string());
    let store: Arc<dyn TicketStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    let bus_path =
        std::env::var("DESKFLOW_BUS_PATH").unwrap_or_else(|_| "./data/deskflow-bus.db".to_string());
    let bus: Arc<dyn MessageBus> = Arc::new(
        LibSqlBus::new_local(std::path::Path::new(&bus_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open bus database at {bus_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Bus: {bus_path}");

    // ── Connectors + router ──────────────────────────────────────────────
    let (events_tx, events_rx) = tokio::sync::mpsc::channel::<ConnectorEvent>(256);
    let mut router = ConnectorRouter::new(store.clone(), bus.clone());
    let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();

    if let Some(config) = TelegramConfig::from_env() {
        let connector = Arc::new(TelegramConnector::new(config, events_tx.clone()));
        router.register(connector.clone());
        connectors.push(connector);
        eprintln!("   Telegram: enabled");
    } else {
        eprintln!("   Telegram: disabled (TELEGRAM_BOT_TOKEN not set)");
    }

    if let Some(config) = WhatsappConfig::from_env() {
        let connector = Arc::new(WhatsappConnector::new(config, events_tx.clone()));
        router.register(connector.clone());
        connectors.push(connector);
        eprintln!("   WhatsApp: enabled");
    } else {
        eprintln!("   WhatsApp: disabled (WHATSAPP_GATEWAY_URL not set)");
    }

    if let Some(config) = MailboxConfig::from_env() {
        let connector = Arc::new(MailboxConnector::new(config, store.clone(), events_tx.clone()));
        router.register(connector.clone());
        connectors.push(connector);
        eprintln!("   Mailbox: enabled");
    } else {
        eprintln!("   Mailbox: disabled (MAIL_IMAP_HOST not set)");
    }

    if connectors.is_empty() {
        eprintln!("   Warning: no channels configured; only queued work will be handled");
    }
    drop(events_tx);

    let router = Arc::new(router);
    let router_handle = {
        let router = router.clone();
        tokio::spawn(async move { router.run(events_rx).await })
    };

    for connector in &connectors {
        if let Err(e) = connector.start().await {
            tracing::error!(source = %connector.name(), "Connector failed to start: {e}");
        }
    }

    // ── Workers ──────────────────────────────────────────────────────────
    let pipeline_config = PipelineConfig::from_env();
    let processor = Arc::new(TicketProcessor::new(
        store.clone(),
        completion,
        search,
        pipeline_config,
    ));

    let processing_config = WorkerConfig {
        consumer_name: format!("processor-{}", std::process::id()),
        ..WorkerConfig::default()
    };
    let (processing_handle, processing_running) =
        ProcessingWorker::spawn(bus.clone(), processor, processing_config);

    let sender_config = WorkerConfig {
        consumer_name: format!("sender-{}", std::process::id()),
        ..WorkerConfig::default()
    };
    let (sender_handle, sender_running) =
        SenderWorker::spawn(bus.clone(), router.clone(), sender_config);

    eprintln!("   Workers: processing + sender started\n");

    // ── Shutdown ─────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");

    for connector in &connectors {
        connector.stop().await;
    }
    processing_running.store(false, Ordering::SeqCst);
    sender_running.store(false, Ordering::SeqCst);
    let _ = processing_handle.await;
    let _ = sender_handle.await;
    // Registered connectors keep event-sender clones alive, so the channel
    // never closes on its own.
    router_handle.abort();
    let _ = router_handle.await;

    eprintln!("Bye.");
    Ok(())
}
