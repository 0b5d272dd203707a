use metrics_exporter_prometheus::BuildError;
use rdkafka::error::KafkaError;
use scan_common::repository::StoreError;
use thiserror::Error;

use crate::config::ConfigError;

/// Fatal errors of the consumer process. Anything here stops it before or instead of consuming.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("failed to read configuration from environment: {0}")]
    EnvError(#[from] envconfig::Error),
    #[error("failed to set up scan store: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to set up kafka client: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("failed to register signal handler: {0}")]
    SignalError(#[from] std::io::Error),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] BuildError),
    #[error(transparent)]
    IngestError(#[from] IngestError),
}

/// Errors ending an ingestion loop run early.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("consumer task panicked: {0}")]
    ConsumerPanicked(#[from] tokio::task::JoinError),
}
