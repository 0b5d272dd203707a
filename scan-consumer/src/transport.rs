//! The message transport seen by the ingestion loop.
//!
//! A transport hands out `Delivery`s, each of which must be settled exactly once with `ack`
//! (processed, never deliver again) or `nack` (not processed, deliver again later).
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Wait for the next message. `None` means the transport is closed and drained.
    /// Must be cancel safe: dropping the future must not lose a message.
    async fn receive(&self) -> Result<Option<Self::Delivery>, TransportError>;
}

#[async_trait]
pub trait Delivery: Send + 'static {
    /// An identifier for logs.
    fn id(&self) -> String;

    fn payload(&self) -> &[u8];

    async fn ack(self);

    async fn nack(self);
}

/// An in-process transport with redelivery on nack.
///
/// Mirrors what managed brokers offer: a nacked message is queued again, and with
/// `max_deliveries` set, a message nacked that many times is moved aside as dead-lettered
/// instead of looping forever.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    changed: Notify,
    max_deliveries: Option<u32>,
}

#[derive(Default)]
struct MemoryState {
    queue: VecDeque<QueuedMessage>,
    next_id: u64,
    outstanding: usize,
    closed: bool,
    acked: Vec<Vec<u8>>,
    nacks: u64,
    dead_lettered: Vec<Vec<u8>>,
}

struct QueuedMessage {
    id: u64,
    payload: Vec<u8>,
    deliveries: u32,
}

/// Counters describing what happened to published messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTransportStats {
    pub acked: usize,
    pub nacks: u64,
    pub dead_lettered: usize,
    pub queued: usize,
    pub outstanding: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                max_deliveries: Some(max_deliveries.max(1)),
                ..Default::default()
            }),
        }
    }

    pub fn publish(&self, payload: impl Into<Vec<u8>>) {
        self.inner.update(|state| {
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(QueuedMessage {
                id,
                payload: payload.into(),
                deliveries: 0,
            });
        });
    }

    /// Stop accepting new messages. Receivers get `None` once nothing is queued or outstanding.
    pub fn close(&self) {
        self.inner.update(|state| state.closed = true);
    }

    pub fn stats(&self) -> MemoryTransportStats {
        self.inner.read(|state| MemoryTransportStats {
            acked: state.acked.len(),
            nacks: state.nacks,
            dead_lettered: state.dead_lettered.len(),
            queued: state.queue.len(),
            outstanding: state.outstanding,
        })
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.inner.read(|state| state.acked.clone())
    }

    pub fn dead_lettered(&self) -> Vec<Vec<u8>> {
        self.inner.read(|state| state.dead_lettered.clone())
    }
}

impl MemoryInner {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate the state and wake up pending receivers.
    fn update<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let result = f(&mut self.lock());
        self.changed.notify_waiters();
        result
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        f(&self.lock())
    }

    fn settle(&self, message: QueuedMessage, acked: bool) {
        let max_deliveries = self.max_deliveries;
        self.update(|state| {
            state.outstanding -= 1;
            if acked {
                state.acked.push(message.payload);
                return;
            }

            state.nacks += 1;
            match max_deliveries {
                Some(max) if message.deliveries >= max => {
                    warn!(id = message.id, "message exceeded max deliveries");
                    state.dead_lettered.push(message.payload);
                }
                _ => state.queue.push_back(message),
            }
        });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Delivery = MemoryDelivery;

    async fn receive(&self) -> Result<Option<MemoryDelivery>, TransportError> {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            // Register before checking the state so an update in between is not missed.
            changed.as_mut().enable();

            let next = {
                let mut state = self.inner.lock();
                if let Some(mut message) = state.queue.pop_front() {
                    message.deliveries += 1;
                    state.outstanding += 1;
                    Some(Some(message))
                } else if state.closed && state.outstanding == 0 {
                    Some(None)
                } else {
                    None
                }
            };

            match next {
                Some(Some(message)) => {
                    return Ok(Some(MemoryDelivery {
                        message: Some(message),
                        inner: self.inner.clone(),
                    }))
                }
                Some(None) => return Ok(None),
                None => changed.await,
            }
        }
    }
}

pub struct MemoryDelivery {
    message: Option<QueuedMessage>,
    inner: Arc<MemoryInner>,
}

impl MemoryDelivery {
    /// How many times this message has been handed out, this delivery included.
    pub fn deliveries(&self) -> u32 {
        self.message.as_ref().map_or(0, |message| message.deliveries)
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn id(&self) -> String {
        self.message
            .as_ref()
            .map_or_else(String::new, |message| message.id.to_string())
    }

    fn payload(&self) -> &[u8] {
        match &self.message {
            Some(message) => &message.payload,
            None => &[],
        }
    }

    async fn ack(mut self) {
        if let Some(message) = self.message.take() {
            self.inner.settle(message, true);
        }
    }

    async fn nack(mut self) {
        if let Some(message) = self.message.take() {
            self.inner.settle(message, false);
        }
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            error!(id = message.id, "delivery dropped without being settled, nacking");
            self.inner.settle(message, false);
        }
    }
}
