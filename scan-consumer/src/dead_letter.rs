use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use scan_common::decoder::DecodeError;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::KafkaConfig;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to produce to dead letter topic: {0}")]
    KafkaProduceError(KafkaError),
    #[error("dead letter sink unavailable: {0}")]
    Unavailable(String),
}

/// Somewhere to park messages that can never be decoded, keeping the raw bytes for inspection.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, payload: &[u8], reason: &DecodeError) -> Result<(), DeadLetterError>;
}

/// Produces dead letters to a Kafka topic, with the decode error in the message headers.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &KafkaConfig, topic: &str, timeout: Duration) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("message.timeout.ms", timeout.as_millis().to_string());

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        let metadata = producer
            .client()
            .fetch_metadata(Some(topic), Duration::from_secs(15))?;
        info!(
            topic,
            partitions = metadata
                .topics()
                .first()
                .map_or(0, |topic| topic.partitions().len()),
            "connected dead letter producer"
        );

        Ok(Self {
            producer,
            topic: topic.to_owned(),
            timeout,
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, payload: &[u8], reason: &DecodeError) -> Result<(), DeadLetterError> {
        let description = reason.to_string();
        let scan_key = reason.key().map(ToString::to_string);
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "decode_error_kind",
                value: Some(reason.kind()),
            })
            .insert(Header {
                key: "decode_error",
                value: Some(description.as_str()),
            })
            .insert(Header {
                key: "scan_key",
                value: scan_key.as_deref(),
            });

        let record = FutureRecord::<(), [u8]>::to(&self.topic)
            .payload(payload)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(error, _)| DeadLetterError::KafkaProduceError(error))
    }
}

/// A dead letter kept in memory by `MemoryDeadLetterSink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub kind: &'static str,
    pub key: Option<String>,
    pub reason: String,
}

/// Collects dead letters in memory. Can be made to fail to exercise the fallback path.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    failing: bool,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, payload: &[u8], reason: &DecodeError) -> Result<(), DeadLetterError> {
        if self.failing {
            return Err(DeadLetterError::Unavailable(
                "dead letter sink is failing".to_owned(),
            ));
        }

        let mut letters = self
            .letters
            .lock()
            .map_err(|_| DeadLetterError::Unavailable("poisoned lock".to_owned()))?;
        letters.push(DeadLetter {
            payload: payload.to_vec(),
            kind: reason.kind(),
            key: reason.key().map(ToString::to_string),
            reason: reason.to_string(),
        });

        Ok(())
    }
}
