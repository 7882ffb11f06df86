//! Ack-timeout tracker.
//!
//! Every delivered message waits here until it is acknowledged or negatively
//! acknowledged. The timeout window is the same for every record and records
//! are appended in delivery order, so only a prefix of the queue can ever be
//! due and the sweep stops at the first record that is not.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use crate::message_id::MessageId;
use crate::pure;

/// A message handed to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryRecord {
    /// The delivered message.
    pub id: MessageId,
    /// When it was handed to the application.
    pub delivered_at_ms: u64,
    /// How many times the broker had already redelivered it.
    pub redelivery_count: u32,
}

/// Delivery-ordered set of unacknowledged messages with one uniform timeout.
///
/// Disabled when constructed with a zero timeout; every method is then a
/// no-op. Superseded queue slots are skipped lazily, like the negative ack
/// tracker.
#[derive(Debug)]
pub struct UnackedMessageTracker {
    ack_timeout_ms: u64,
    queue: VecDeque<(u64, DeliveryRecord)>,
    index: HashMap<MessageId, u64>,
    next_sequence: u64,
}

impl UnackedMessageTracker {
    /// Create a tracker. `Duration::ZERO` disables it.
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            ack_timeout_ms: u64::try_from(ack_timeout.as_millis()).unwrap_or(u64::MAX),
            queue: VecDeque::new(),
            index: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// A tracker that never tracks anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Whether the tracker is active.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.ack_timeout_ms > 0
    }

    /// Record a delivery.
    ///
    /// A redelivered id replaces its previous record and moves to the back
    /// of the queue with the fresh timestamp.
    pub fn on_delivered(&mut self, id: MessageId, now_ms: u64, redelivery_count: u32) {
        if !self.is_enabled() {
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.queue.push_back((sequence, DeliveryRecord {
            id,
            delivered_at_ms: now_ms,
            redelivery_count,
        }));
        self.index.insert(id, sequence);
    }

    /// Stop tracking an acknowledged message. Returns `true` if it was tracked.
    pub fn on_acknowledged(&mut self, id: &MessageId) -> bool {
        self.index.remove(id).is_some()
    }

    /// Stop tracking a negatively acknowledged message.
    ///
    /// Responsibility for its redelivery passes to the negative ack tracker.
    pub fn on_negative_acknowledged(&mut self, id: &MessageId) -> bool {
        self.index.remove(id).is_some()
    }

    /// Whether `id` is awaiting acknowledgment.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Remove and return every record whose timeout has elapsed at `now_ms`.
    ///
    /// Pops from the front while the head record is due and stops at the
    /// first live record that is not.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<DeliveryRecord> {
        let mut due = Vec::new();
        if !self.is_enabled() {
            return due;
        }

        while let Some((sequence, record)) = self.queue.front().copied() {
            let is_live = self.index.get(&record.id) == Some(&sequence);
            if !is_live {
                self.queue.pop_front();
                continue;
            }
            if !pure::is_ack_timeout_expired(record.delivered_at_ms, self.ack_timeout_ms, now_ms) {
                break;
            }
            self.queue.pop_front();
            self.index.remove(&record.id);
            due.push(record);
        }

        due
    }

    /// Remove and return every outstanding record in delivery order.
    pub fn drain_all(&mut self) -> Vec<DeliveryRecord> {
        let index = std::mem::take(&mut self.index);
        self.queue
            .drain(..)
            .filter(|(sequence, record)| index.get(&record.id) == Some(sequence))
            .map(|(_, record)| record)
            .collect()
    }

    /// Stop tracking every id of `upto`'s partition that sorts at or before it.
    ///
    /// Used for cumulative acknowledgment. Returns the removed ids.
    pub fn remove_up_to(&mut self, upto: &MessageId) -> Vec<MessageId> {
        let mut removed: Vec<MessageId> = self
            .index
            .keys()
            .filter(|id| id.partition_index == upto.partition_index && *id <= upto)
            .copied()
            .collect();
        for id in &removed {
            self.index.remove(id);
        }
        removed.sort_unstable();
        removed
    }

    /// Number of outstanding records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
    }
}
