//! Per-partition bookkeeping of the Kafka offsets handed to the ingestion loop.
//!
//! Deliveries are settled concurrently and in any order, so an ack can't simply store its own
//! offset: that would let the committed offset move past a message that is still being worked
//! on, or that was nacked, and lose it on the next rebalance or restart. The tracker keeps every
//! received but unsettled offset per partition and only ever reports a committable offset below
//! the lowest of them.
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

/// The result of nacking an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The message stays unsettled and must be delivered again.
    Retry { deliveries: u32 },
    /// The message was delivered `max_deliveries` times and is now settled without being
    /// processed. `commit` is the new committable offset, if it moved.
    Exhausted { deliveries: u32, commit: Option<i64> },
}

#[derive(Default)]
struct PartitionOffsets {
    /// Received and not yet settled offsets, with how many times each was received.
    pending: BTreeMap<i64, u32>,
    highest_settled: Option<i64>,
    /// The next offset to consume, as last reported to the caller.
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn settle(&mut self, offset: i64) -> Option<i64> {
        self.pending.remove(&offset)?;
        self.highest_settled = Some(self.highest_settled.map_or(offset, |high| high.max(offset)));

        let next = match self.pending.keys().next() {
            Some(&lowest_pending) => lowest_pending,
            None => self.highest_settled? + 1,
        };

        // Only advance, never go backwards.
        if self.committed.is_some_and(|committed| next <= committed) {
            return None;
        }
        self.committed = Some(next);
        Some(next)
    }
}

pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
    max_deliveries: Option<u32>,
}

impl OffsetTracker {
    /// `max_deliveries` bounds how many times a nacked offset is delivered again, `None` meaning
    /// forever.
    pub fn new(max_deliveries: Option<u32>) -> Self {
        Self {
            partitions: HashMap::new(),
            max_deliveries: max_deliveries.map(|max| max.max(1)),
        }
    }

    /// Record a received offset. Returns how many times it has been received while unsettled.
    pub fn received(&mut self, partition: i32, offset: i64) -> u32 {
        let deliveries = self
            .partitions
            .entry(partition)
            .or_default()
            .pending
            .entry(offset)
            .or_insert(0);
        *deliveries += 1;
        *deliveries
    }

    /// Settle an offset as processed. Returns the new committable offset if it moved forward.
    pub fn acked(&mut self, partition: i32, offset: i64) -> Option<i64> {
        self.partitions.get_mut(&partition)?.settle(offset)
    }

    pub fn nacked(&mut self, partition: i32, offset: i64) -> NackOutcome {
        let Some(state) = self.partitions.get_mut(&partition) else {
            return NackOutcome::Retry { deliveries: 0 };
        };
        let deliveries = state.pending.get(&offset).copied().unwrap_or(0);

        match self.max_deliveries {
            Some(max) if deliveries >= max => NackOutcome::Exhausted {
                deliveries,
                commit: state.settle(offset),
            },
            _ => NackOutcome::Retry { deliveries },
        }
    }

    /// Forget a partition taken away by a rebalance. Its new owner starts from the committed
    /// offset, which never passed anything unsettled here.
    pub fn revoke(&mut self, partition: i32) {
        if let Some(state) = self.partitions.remove(&partition) {
            debug!(
                partition,
                unsettled = state.pending.len(),
                "forgetting offsets of revoked partition"
            );
        }
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.partitions
            .get(&partition)
            .and_then(|state| state.committed)
    }
}
