//! The ingestion loop: pull scan messages off a `Transport`, decode them and hand them to the
//! `ScanManager`, settling each delivery once its outcome is known.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scan_common::decoder::{decode, DecodeError};
use scan_common::manager::ScanManager;
use scan_common::repository::PutOutcome;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dead_letter::DeadLetterSink;
use crate::error::IngestError;
use crate::metrics_consts::{
    IN_FLIGHT, MESSAGES_DEAD_LETTERED, MESSAGES_DROPPED, MESSAGES_FAILED, MESSAGES_PROCESSED,
    MESSAGES_RECEIVED, RECEIVE_ERRORS, WRITES_STALE,
};
use crate::transport::{Delivery, Transport};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// What to do with a message that can never be decoded.
#[derive(Clone)]
pub enum PoisonPolicy {
    /// Request redelivery and let the transport's own dead-lettering deal with it.
    Nack,
    /// Ack it away.
    Drop,
    /// Hand it to a sink and ack, or nack if the sink fails.
    DeadLetter(Arc<dyn DeadLetterSink>),
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
}

/// Counters of a single loop instance.
#[derive(Default)]
struct IngestStats {
    processed: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
    dead_lettered: AtomicU64,
}

/// A snapshot of the loop counters.
///
/// `processed` counts messages that reached the store and were acked, `stale` being the part of
/// them that lost the timestamp comparison. `failed` counts decode and store failures per
/// delivery, so a message failing twice counts twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub processed: u64,
    pub failed: u64,
    pub stale: u64,
    pub dead_lettered: u64,
}

impl IngestStats {
    fn summary(&self) -> IngestSummary {
        IngestSummary {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Processes a single delivery from receipt to settlement.
#[derive(Clone)]
pub struct MessageHandler {
    manager: ScanManager,
    policy: PoisonPolicy,
    stats: Arc<IngestStats>,
}

impl MessageHandler {
    pub fn new(manager: ScanManager, policy: PoisonPolicy) -> Self {
        Self {
            manager,
            policy,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn summary(&self) -> IngestSummary {
        self.stats.summary()
    }

    pub async fn handle<D: Delivery>(&self, delivery: D) -> Settlement {
        metrics::counter!(MESSAGES_RECEIVED).increment(1);

        let decoded = decode(delivery.payload());
        let result = match decoded {
            Ok(result) => result,
            Err(error) => return self.handle_decode_failure(delivery, error).await,
        };

        match self.manager.put_scan(&result).await {
            Ok(outcome) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(MESSAGES_PROCESSED).increment(1);
                if outcome == PutOutcome::Stale {
                    self.stats.stale.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(WRITES_STALE).increment(1);
                }

                delivery.ack().await;
                Settlement::Acked
            }
            Err(error) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let labels = [("reason", "store")];
                metrics::counter!(MESSAGES_FAILED, &labels).increment(1);
                warn!(
                    id = %delivery.id(),
                    key = %result.key(),
                    data_version = %result.data_version,
                    %error,
                    "failed to store scan result, nacking"
                );

                delivery.nack().await;
                Settlement::Nacked
            }
        }
    }

    async fn handle_decode_failure<D: Delivery>(
        &self,
        delivery: D,
        error: DecodeError,
    ) -> Settlement {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        let key = error.key().map(ToString::to_string);
        let data_version = error.data_version();
        let labels = [("reason", error.kind())];
        metrics::counter!(MESSAGES_FAILED, &labels).increment(1);

        match &self.policy {
            PoisonPolicy::Nack => {
                warn!(
                    id = %delivery.id(),
                    kind = error.kind(),
                    key = ?key,
                    data_version = ?data_version,
                    %error,
                    "failed to decode message, nacking"
                );
                delivery.nack().await;
                Settlement::Nacked
            }
            PoisonPolicy::Drop => {
                error!(
                    id = %delivery.id(),
                    kind = error.kind(),
                    key = ?key,
                    data_version = ?data_version,
                    %error,
                    "failed to decode message, dropping"
                );
                metrics::counter!(MESSAGES_DROPPED).increment(1);
                delivery.ack().await;
                Settlement::Acked
            }
            PoisonPolicy::DeadLetter(sink) => {
                let payload = delivery.payload().to_vec();
                match sink.send(&payload, &error).await {
                    Ok(()) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(MESSAGES_DEAD_LETTERED).increment(1);
                        warn!(
                            id = %delivery.id(),
                            kind = error.kind(),
                            key = ?key,
                            data_version = ?data_version,
                            %error,
                            "failed to decode message, dead-lettered"
                        );
                        delivery.ack().await;
                        Settlement::Acked
                    }
                    Err(dead_letter_error) => {
                        error!(
                            id = %delivery.id(),
                            kind = error.kind(),
                            key = ?key,
                            data_version = ?data_version,
                            %error,
                            %dead_letter_error,
                            "failed to dead-letter undecodable message, nacking"
                        );
                        delivery.nack().await;
                        Settlement::Nacked
                    }
                }
            }
        }
    }
}

/// Runs `consumers` concurrent pullers against a transport, with at most `max_outstanding`
/// deliveries received but not yet settled.
pub struct IngestLoop<T: Transport> {
    transport: Arc<T>,
    handler: MessageHandler,
    consumers: usize,
    max_outstanding: u32,
}

impl<T: Transport> IngestLoop<T> {
    pub fn new(
        transport: T,
        manager: ScanManager,
        policy: PoisonPolicy,
        consumers: usize,
        max_outstanding: usize,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            handler: MessageHandler::new(manager, policy),
            consumers: consumers.max(1),
            max_outstanding: u32::try_from(max_outstanding.max(1)).unwrap_or(u32::MAX),
        }
    }

    pub fn summary(&self) -> IngestSummary {
        self.handler.summary()
    }

    /// Consume until `shutdown` is cancelled or the transport is drained.
    ///
    /// Deliveries already received when the loop stops are processed and settled before this
    /// returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<IngestSummary, IngestError> {
        let cancel = shutdown.child_token();
        let budget = Arc::new(Semaphore::new(self.max_outstanding as usize));

        info!(
            consumers = self.consumers,
            max_outstanding = self.max_outstanding,
            "starting ingestion loop"
        );

        let mut pullers = JoinSet::new();
        for consumer in 0..self.consumers {
            pullers.spawn(pull(
                consumer,
                self.transport.clone(),
                self.handler.clone(),
                budget.clone(),
                cancel.clone(),
            ));
        }

        let mut result = Ok(());
        while let Some(joined) = pullers.join_next().await {
            if let Err(join_error) = joined {
                error!(error = %join_error, "consumer task failed, stopping ingestion loop");
                cancel.cancel();
                if result.is_ok() {
                    result = Err(IngestError::ConsumerPanicked(join_error));
                }
            }
        }

        // Every permit back in the semaphore means every spawned delivery was settled.
        if let Err(error) = budget.acquire_many(self.max_outstanding).await {
            error!(%error, "in-flight budget closed before deliveries were settled");
        }

        let summary = self.summary();
        info!(
            processed = summary.processed,
            failed = summary.failed,
            stale = summary.stale,
            dead_lettered = summary.dead_lettered,
            "ingestion loop stopped"
        );

        result.map(|()| summary)
    }
}

async fn pull<T: Transport>(
    consumer: usize,
    transport: Arc<T>,
    handler: MessageHandler,
    budget: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let permit: OwnedSemaphorePermit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = budget.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = transport.receive() => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                debug!(consumer, "transport drained");
                break;
            }
            Err(error) => {
                error!(consumer, %error, "failed to receive message");
                metrics::counter!(RECEIVE_ERRORS).increment(1);
                drop(permit);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        metrics::gauge!(IN_FLIGHT).increment(1.0);
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle(delivery).await;
            metrics::gauge!(IN_FLIGHT).decrement(1.0);
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use scan_common::memory::MemoryRepository;
    use scan_common::repository::ScanRepository;
    use scan_common::scan::ScanKey;

    use super::*;
    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::transport::{MemoryDelivery, MemoryTransport};

    fn v1_message(timestamp: i64, response: &str) -> Vec<u8> {
        serde_json::json!({
            "ip": "10.0.0.1",
            "port": 8080,
            "service": "http-alt",
            "timestamp": timestamp,
            "data_version": 1,
            "data": { "response_bytes_utf8": STANDARD.encode(response) },
        })
        .to_string()
        .into_bytes()
    }

    fn handler_with(policy: PoisonPolicy) -> (MessageHandler, Arc<MemoryRepository>) {
        let repository = Arc::new(MemoryRepository::in_memory());
        let handler = MessageHandler::new(ScanManager::new(repository.clone()), policy);
        (handler, repository)
    }

    async fn deliver(transport: &MemoryTransport, payload: Vec<u8>) -> MemoryDelivery {
        transport.publish(payload);
        transport.receive().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_handle_stores_and_acks() {
        let (handler, repository) = handler_with(PoisonPolicy::Nack);
        let transport = MemoryTransport::new();

        let delivery = deliver(&transport, v1_message(10, "banner")).await;
        assert_eq!(handler.handle(delivery).await, Settlement::Acked);

        let delivery = deliver(&transport, v1_message(5, "older banner")).await;
        assert_eq!(handler.handle(delivery).await, Settlement::Acked);

        let stored = repository
            .get(&ScanKey::new("10.0.0.1", 8080, "http-alt"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.response, "banner");
        assert_eq!(
            handler.summary(),
            IngestSummary {
                processed: 2,
                stale: 1,
                ..Default::default()
            }
        );
        assert_eq!(transport.stats().acked, 2);
    }

    #[tokio::test]
    async fn test_decode_failure_nack_policy() {
        let (handler, repository) = handler_with(PoisonPolicy::Nack);
        let transport = MemoryTransport::new();

        let delivery = deliver(&transport, b"{not json".to_vec()).await;
        assert_eq!(handler.handle(delivery).await, Settlement::Nacked);

        assert_eq!(repository.store().len(), 0);
        assert_eq!(transport.stats().nacks, 1);
        assert_eq!(handler.summary().failed, 1);
    }

    #[tokio::test]
    async fn test_decode_failure_drop_policy() {
        let (handler, repository) = handler_with(PoisonPolicy::Drop);
        let transport = MemoryTransport::new();

        let delivery = deliver(&transport, b"{not json".to_vec()).await;
        assert_eq!(handler.handle(delivery).await, Settlement::Acked);

        assert!(repository.store().is_empty());
        assert_eq!(transport.stats().acked, 1);
        assert_eq!(handler.summary().failed, 1);
        assert_eq!(handler.summary().dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_decode_failure_dead_letter_policy() {
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let (handler, _) = handler_with(PoisonPolicy::DeadLetter(sink.clone()));
        let transport = MemoryTransport::new();

        let delivery = deliver(&transport, b"{not json".to_vec()).await;
        assert_eq!(handler.handle(delivery).await, Settlement::Acked);

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, b"{not json");
        assert_eq!(letters[0].kind, "malformed_envelope");
        assert_eq!(letters[0].key, None);
        assert_eq!(handler.summary().dead_lettered, 1);
        assert_eq!(transport.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_nacks() {
        let sink = Arc::new(MemoryDeadLetterSink::failing());
        let (handler, _) = handler_with(PoisonPolicy::DeadLetter(sink.clone()));
        let transport = MemoryTransport::new();

        let delivery = deliver(&transport, b"[]".to_vec()).await;
        assert_eq!(handler.handle(delivery).await, Settlement::Nacked);

        assert!(sink.letters().is_empty());
        assert_eq!(handler.summary().dead_lettered, 0);
        assert_eq!(transport.stats().nacks, 1);
    }
}
