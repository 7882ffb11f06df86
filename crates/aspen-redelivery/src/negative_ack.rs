//! Negative acknowledgment tracker.
//!
//! Holds every negatively acknowledged message until its redelivery deadline.
//! Deadlines are grouped into coarse buckets keyed by the deadline floored to
//! the bucket width, so one periodic sweep pops whole buckets instead of
//! running a timer per message.
//!
//! # Layout
//!
//! - `buckets`: bucket start → FIFO queue of `(id, sequence)` slots
//! - `index`: id → the bucket, sequence and deadline of its live slot
//!
//! Every bucket that starts at or before `now` is visited by a sweep. All of
//! its slots are due except in the last one, where slots whose own deadline
//! is still ahead stay queued in order. An id therefore fires on the first
//! sweep at or after its deadline, not at a bucket boundary.
//!
//! Re-adding or removing an id drops its live count from the old bucket. An
//! empty bucket is removed at once and a bucket with more dead than live
//! slots is compacted, so re-nacking one id never grows the queue.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use crate::message_id::MessageId;
use crate::pure;

/// Location of an id's live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotRef {
    bucket_ms: u64,
    sequence: u64,
    redeliver_at_ms: u64,
}

/// Slots queued under one bucket start.
#[derive(Debug, Default)]
struct Bucket {
    slots: VecDeque<(MessageId, u64)>,
    live: usize,
}

/// Bucketed map from message identity to redelivery deadline.
///
/// Not synchronized; the coordinator keeps it behind a mutex shared by
/// application calls and the sweep task.
#[derive(Debug)]
pub struct NegativeAckTracker {
    granularity_ms: u64,
    buckets: BTreeMap<u64, Bucket>,
    index: HashMap<MessageId, SlotRef>,
    next_sequence: u64,
}

impl NegativeAckTracker {
    /// Create a tracker whose buckets are `granularity_ms` wide.
    pub fn new(granularity_ms: u64) -> Self {
        Self {
            granularity_ms: granularity_ms.max(1),
            buckets: BTreeMap::new(),
            index: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Schedule `id` for redelivery `delay` after `now_ms`.
    ///
    /// If `id` is already scheduled, the new deadline replaces the old one
    /// (last negative ack wins) and the id moves to the back of its new
    /// bucket. Returns `true` if the id was not already scheduled.
    pub fn add(&mut self, id: MessageId, now_ms: u64, delay: Duration) -> bool {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        // A zero delay still waits for a later sweep than the current instant.
        let redeliver_at_ms = now_ms.saturating_add(delay_ms.max(1));
        let bucket_ms = pure::bucket_start(redeliver_at_ms, self.granularity_ms);

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let bucket = self.buckets.entry(bucket_ms).or_default();
        bucket.slots.push_back((id, sequence));
        bucket.live += 1;

        let previous = self.index.insert(id, SlotRef {
            bucket_ms,
            sequence,
            redeliver_at_ms,
        });
        if let Some(previous) = previous {
            self.release(previous);
        }
        previous.is_none()
    }

    /// Stop tracking `id`. Returns `true` if it was scheduled.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        match self.index.remove(id) {
            Some(slot) => {
                self.release(slot);
                true
            }
            None => false,
        }
    }

    /// Account for a slot that is no longer live.
    ///
    /// The index must already point away from `slot`.
    fn release(&mut self, slot: SlotRef) {
        let Some(bucket) = self.buckets.get_mut(&slot.bucket_ms) else {
            return;
        };
        bucket.live = bucket.live.saturating_sub(1);
        if bucket.live == 0 {
            self.buckets.remove(&slot.bucket_ms);
            return;
        }
        if bucket.slots.len() > bucket.live.saturating_mul(2) {
            let index = &self.index;
            bucket.slots.retain(|(id, sequence)| index.get(id).is_some_and(|live| live.sequence == *sequence));
        }
    }

    /// Whether `id` is scheduled.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Redelivery deadline recorded for `id`.
    pub fn redeliver_at(&self, id: &MessageId) -> Option<u64> {
        self.index.get(id).map(|slot| slot.redeliver_at_ms)
    }

    /// Remove and return every id whose deadline is `<= now_ms`.
    ///
    /// Ids come out in bucket order, FIFO by insertion within a bucket.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<MessageId> {
        let mut due = Vec::new();
        let mut not_yet_due = Vec::new();

        while let Some(entry) = self.buckets.first_entry() {
            if *entry.key() > now_ms {
                break;
            }
            let (bucket_ms, bucket) = entry.remove_entry();

            let mut remaining = VecDeque::new();
            for (id, sequence) in bucket.slots {
                let Some(slot) = self.index.get(&id).copied() else {
                    continue;
                };
                if slot.sequence != sequence {
                    continue;
                }
                if slot.redeliver_at_ms <= now_ms {
                    self.index.remove(&id);
                    due.push(id);
                } else {
                    remaining.push_back((id, sequence));
                }
            }

            if !remaining.is_empty() {
                not_yet_due.push((bucket_ms, Bucket {
                    live: remaining.len(),
                    slots: remaining,
                }));
            }
        }

        self.buckets.extend(not_yet_due);
        due
    }

    /// Remove and return every scheduled id regardless of deadline.
    pub fn drain_all(&mut self) -> Vec<MessageId> {
        let mut ids: Vec<(u64, u64, MessageId)> =
            self.index.drain().map(|(id, slot)| (slot.bucket_ms, slot.sequence, id)).collect();
        self.buckets.clear();
        ids.sort_unstable_by_key(|(bucket_ms, sequence, _)| (*bucket_ms, *sequence));
        ids.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Remove every scheduled id matching `predicate`, returning how many were removed.
    pub fn remove_matching(&mut self, mut predicate: impl FnMut(&MessageId) -> bool) -> usize {
        let matching: Vec<MessageId> = self.index.keys().filter(|id| predicate(id)).copied().collect();
        for id in &matching {
            self.remove(id);
        }
        matching.len()
    }

    /// Earliest deadline of a scheduled id.
    pub fn next_deadline(&self) -> Option<u64> {
        self.index.values().map(|slot| slot.redeliver_at_ms).min()
    }

    /// Number of scheduled ids.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.index.clear();
    }

    #[cfg(test)]
    fn queued_slots(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.slots.len()).sum()
    }
}
