use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Message, Offset};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::metrics_consts::DELIVERIES_EXHAUSTED;
use crate::offset_tracker::{NackOutcome, OffsetTracker};
use crate::transport::{Delivery, Transport, TransportError};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// A `Transport` reading scan messages from a single Kafka topic.
///
/// Deliveries are settled through an `OffsetTracker`: an ack stores the next offset to consume
/// only once every lower offset of the partition is settled, and auto-commit picks it up in the
/// background. A nack waits for an exponential backoff, then seeks the partition back to the
/// nacked offset so the message is delivered again, along with any later message of that
/// partition: duplicates are harmless as writes are idempotent. With `KAFKA_MAX_DELIVERIES` set,
/// an offset nacked that many times is skipped.
#[derive(Clone)]
pub struct KafkaTransport {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<TrackingContext>,
    topic: String,
    offsets: Arc<Mutex<OffsetTracker>>,
    nack_backoff: Duration,
    nack_backoff_max: Duration,
}

impl Inner {
    fn offsets(&self) -> MutexGuard<'_, OffsetTracker> {
        lock(&self.offsets)
    }
}

fn lock(offsets: &Mutex<OffsetTracker>) -> MutexGuard<'_, OffsetTracker> {
    offsets
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops the tracked offsets of partitions revoked by a rebalance.
struct TrackingContext {
    topic: String,
    offsets: Arc<Mutex<OffsetTracker>>,
}

impl ClientContext for TrackingContext {}

impl ConsumerContext for TrackingContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
                let mut offsets = lock(&self.offsets);
                for element in partitions.elements() {
                    if element.topic() == self.topic {
                        offsets.revoke(element.partition());
                    }
                }
            }
            Rebalance::Assign(partitions) => {
                info!("Assigning {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }
}

impl KafkaTransport {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let max_deliveries = match config.kafka_max_deliveries {
            0 => None,
            max => Some(max),
        };
        let offsets = Arc::new(Mutex::new(OffsetTracker::new(max_deliveries)));
        let context = TrackingContext {
            topic: config.kafka_consumer_topic.to_owned(),
            offsets: offsets.clone(),
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer<TrackingContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

        info!(
            topic = %config.kafka_consumer_topic,
            group = %config.kafka_consumer_group,
            max_deliveries = config.kafka_max_deliveries,
            "subscribed to scan results topic"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: config.kafka_consumer_topic.to_owned(),
                offsets,
                nack_backoff: config.kafka_nack_backoff.0,
                nack_backoff_max: config.kafka_nack_backoff_max.0,
            }),
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    type Delivery = KafkaDelivery;

    async fn receive(&self) -> Result<Option<KafkaDelivery>, TransportError> {
        let message = self.inner.consumer.recv().await?;
        let deliveries = self
            .inner
            .offsets()
            .received(message.partition(), message.offset());

        Ok(Some(KafkaDelivery {
            handle: Arc::downgrade(&self.inner),
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            deliveries,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            settled: false,
        }))
    }
}

/// How long to wait before redelivering a message nacked for the `deliveries`-th time.
pub fn nack_backoff(deliveries: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = deliveries.saturating_sub(1).min(31);
    initial.saturating_mul(1 << exponent).min(max)
}

pub struct KafkaDelivery {
    handle: Weak<Inner>,
    topic: String,
    partition: i32,
    offset: i64,
    deliveries: u32,
    payload: Vec<u8>,
    settled: bool,
}

impl KafkaDelivery {
    fn store_offset(&self, inner: &Inner, next_offset: i64) {
        debug!(id = %self.id(), next_offset, "storing offset");
        if let Err(error) = inner
            .consumer
            .store_offset(&inner.topic, self.partition, next_offset)
        {
            // The message will be seen again after a rebalance or restart.
            warn!(id = %self.id(), %error, "failed to store offset");
        }
    }

    fn rewind(&self, inner: &Inner) {
        if let Err(error) = inner.consumer.seek(
            &self.topic,
            self.partition,
            Offset::Offset(self.offset),
            SEEK_TIMEOUT,
        ) {
            error!(id = %self.id(), %error, "failed to seek back to nacked message");
        }
    }

    /// Settle as not processed. Returns whether the message must be delivered again.
    fn settle_nacked(&self, inner: &Inner) -> bool {
        let outcome = inner.offsets().nacked(self.partition, self.offset);
        match outcome {
            NackOutcome::Retry { .. } => true,
            NackOutcome::Exhausted { deliveries, commit } => {
                error!(
                    id = %self.id(),
                    deliveries,
                    "message exceeded max deliveries, skipping it"
                );
                metrics::counter!(DELIVERIES_EXHAUSTED).increment(1);
                if let Some(next_offset) = commit {
                    self.store_offset(inner, next_offset);
                }
                false
            }
        }
    }
}

#[async_trait]
impl Delivery for KafkaDelivery {
    fn id(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(mut self) {
        self.settled = true;
        let Some(inner) = self.handle.upgrade() else {
            return;
        };

        let committable = inner.offsets().acked(self.partition, self.offset);
        if let Some(next_offset) = committable {
            self.store_offset(&inner, next_offset);
        }
    }

    async fn nack(mut self) {
        self.settled = true;
        let Some(inner) = self.handle.upgrade() else {
            return;
        };

        if self.settle_nacked(&inner) {
            let backoff =
                nack_backoff(self.deliveries, inner.nack_backoff, inner.nack_backoff_max);
            debug!(id = %self.id(), ?backoff, "redelivering nacked message after backoff");
            tokio::time::sleep(backoff).await;
            self.rewind(&inner);
        }
    }
}

impl Drop for KafkaDelivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        error!(id = %self.id(), "delivery dropped without being settled, nacking");
        if let Some(inner) = self.handle.upgrade() {
            if self.settle_nacked(&inner) {
                self.rewind(&inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_backoff_grows_until_max() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(30);

        assert_eq!(nack_backoff(0, initial, max), initial);
        assert_eq!(nack_backoff(1, initial, max), initial);
        assert_eq!(nack_backoff(2, initial, max), Duration::from_millis(200));
        assert_eq!(nack_backoff(4, initial, max), Duration::from_millis(800));
        assert_eq!(nack_backoff(10, initial, max), max);
        assert_eq!(nack_backoff(u32::MAX, initial, max), max);
    }
}
