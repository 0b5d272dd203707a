//! Consume scan results from Kafka and keep the newest one per (ip, port, service).
use std::sync::Arc;

use envconfig::Envconfig;
use scan_common::manager::ScanManager;
use scan_common::memory::MemoryRepository;
use scan_common::metrics::{serve, setup_metrics_router};
use scan_common::pgstore::PgScanStore;
use scan_common::repository::ScanRepository;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scan_consumer::config::{Config, ConfigError, DecodeFailurePolicy, StoreBackend};
use scan_consumer::dead_letter::KafkaDeadLetterSink;
use scan_consumer::error::ConsumerError;
use scan_consumer::ingest::{IngestLoop, PoisonPolicy};
use scan_consumer::kafka::KafkaTransport;

async fn shutdown(mut term: Signal, mut interrupt: Signal, token: CancellationToken) {
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = token.cancelled() => return,
    };

    info!("shutting down, finishing in-flight messages");
    token.cancel();
}

async fn build_repository(config: &Config) -> Result<Arc<dyn ScanRepository>, ConsumerError> {
    let repository: Arc<dyn ScanRepository> = match config.store_backend {
        StoreBackend::Postgres => Arc::new(
            PgScanStore::new(
                config.table_name.as_str(),
                &config.database_url,
                config.max_pg_connections,
            )
            .await?,
        ),
        StoreBackend::Memory => Arc::new(
            MemoryRepository::in_memory().max_attempts(config.optimistic_max_attempts),
        ),
    };

    info!(backend = ?config.store_backend, "scan store ready");
    Ok(repository)
}

fn build_policy(config: &Config) -> Result<PoisonPolicy, ConsumerError> {
    Ok(match config.decode_failure_policy {
        DecodeFailurePolicy::Nack => PoisonPolicy::Nack,
        DecodeFailurePolicy::Drop => PoisonPolicy::Drop,
        DecodeFailurePolicy::DeadLetter => {
            let topic = config
                .dead_letter_topic
                .as_ref()
                .ok_or(ConfigError::MissingDeadLetterTopic)?;
            PoisonPolicy::DeadLetter(Arc::new(KafkaDeadLetterSink::new(
                &config.kafka,
                topic.as_str(),
                config.dead_letter_timeout.0,
            )?))
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env()?;
    config.validate()?;

    let term = signal(SignalKind::terminate())?;
    let interrupt = signal(SignalKind::interrupt())?;

    let manager = ScanManager::new(build_repository(&config).await?);
    let policy = build_policy(&config)?;
    let transport = KafkaTransport::new(&config.kafka)?;

    let router = setup_metrics_router()?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(%error, %bind, "failed to serve metrics");
        }
    });

    let token = CancellationToken::new();
    tokio::task::spawn(shutdown(term, interrupt, token.clone()));

    let ingest = IngestLoop::new(
        transport,
        manager,
        policy,
        config.consumers,
        config.max_outstanding,
    );
    let summary = ingest.run(token.clone()).await;
    token.cancel();

    let summary = summary?;
    info!(
        processed = summary.processed,
        failed = summary.failed,
        stale = summary.stale,
        dead_lettered = summary.dead_lettered,
        "scan consumer exiting"
    );

    Ok(())
}
