//! Batch acknowledgment state.
//!
//! One wire entry may carry many logical messages. The broker can only delete
//! the entry once every one of them is terminally acknowledged, so each
//! consumer keeps a fixed-size bitset per partially acknowledged entry.
//! Negative acknowledgment never touches the bitset.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use tracing::debug;

use crate::constants::MAX_BATCH_SIZE;
use crate::constants::MAX_RETIRED_ENTRIES;
use crate::message_id::EntryId;
use crate::message_id::MessageId;

const WORD_BITS: u32 = u64::BITS;

/// Acked sub-indices of one wire entry.
///
/// The bitset is allocated once from the entry's batch size and never grows.
/// Bits are only ever set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAckState {
    total_sub_messages: u32,
    acked_count: u32,
    words: Box<[u64]>,
}

impl BatchAckState {
    /// State for an entry holding `total_sub_messages` logical messages.
    ///
    /// Clamped to `1..=MAX_BATCH_SIZE`; a non-batched message is a one-bit entry.
    pub fn new(total_sub_messages: u32) -> Self {
        let total_sub_messages = total_sub_messages.clamp(1, MAX_BATCH_SIZE);
        let word_count = total_sub_messages.div_ceil(WORD_BITS) as usize;
        Self {
            total_sub_messages,
            acked_count: 0,
            words: vec![0u64; word_count].into_boxed_slice(),
        }
    }

    /// Number of logical messages in the entry.
    pub fn total_sub_messages(&self) -> u32 {
        self.total_sub_messages
    }

    /// Number of sub-indices acknowledged so far.
    pub fn acked_count(&self) -> u32 {
        self.acked_count
    }

    /// Whether `sub_index` has been acknowledged.
    pub fn is_acked(&self, sub_index: u32) -> bool {
        if sub_index >= self.total_sub_messages {
            return false;
        }
        let (word, mask) = Self::locate(sub_index);
        self.words[word] & mask != 0
    }

    /// Acknowledge one sub-index.
    ///
    /// Returns `true` if this call completed the entry. Out-of-range indices
    /// and repeated acks change nothing.
    pub fn mark_acked(&mut self, sub_index: u32) -> bool {
        if sub_index >= self.total_sub_messages || self.is_fully_acked() {
            return false;
        }
        self.set(sub_index);
        self.is_fully_acked()
    }

    /// Acknowledge every sub-index `<= sub_index`.
    ///
    /// Returns `true` if this call completed the entry.
    pub fn mark_acked_cumulative(&mut self, sub_index: u32) -> bool {
        if self.is_fully_acked() {
            return false;
        }
        let last = sub_index.min(self.total_sub_messages - 1);
        for index in 0..=last {
            self.set(index);
        }
        self.is_fully_acked()
    }

    /// Record a negative acknowledgment of `sub_index`.
    ///
    /// Leaves the bitset untouched. Returns the sub-index to hand to the
    /// negative ack tracker, or `None` if it is out of range or already
    /// terminally acknowledged.
    pub fn mark_negative_acked(&self, sub_index: u32) -> Option<u32> {
        (sub_index < self.total_sub_messages && !self.is_acked(sub_index)).then_some(sub_index)
    }

    /// Whether every sub-index is acknowledged.
    #[inline]
    pub fn is_fully_acked(&self) -> bool {
        self.acked_count == self.total_sub_messages
    }

    fn set(&mut self, sub_index: u32) {
        let (word, mask) = Self::locate(sub_index);
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.acked_count += 1;
        }
    }

    fn locate(sub_index: u32) -> (usize, u64) {
        ((sub_index / WORD_BITS) as usize, 1u64 << (sub_index % WORD_BITS))
    }
}

/// Outcome of acknowledging one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// The entry still has unacknowledged sub-messages.
    Partial,
    /// The entry is now fully acknowledged and can be deleted by the broker.
    EntryComplete(EntryId),
    /// The id was unknown or already acknowledged.
    Unknown,
}

/// Batch ack state for every entry a consumer has in flight.
///
/// Completed entries are retired from the table and remembered in a bounded
/// FIFO so duplicate acknowledgments after completion are recognised as
/// no-ops.
#[derive(Debug, Default)]
pub struct BatchAckTable {
    entries: HashMap<EntryId, BatchAckState>,
    retired: HashSet<EntryId>,
    retired_order: VecDeque<EntryId>,
}

impl BatchAckTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivered message, creating its entry state on first sight.
    ///
    /// Redeliveries of an entry that is already tracked reuse the existing
    /// bitset, so acknowledgments made before the redelivery still count.
    pub fn register(&mut self, id: &MessageId) {
        let entry = id.entry();
        if self.retired.contains(&entry) {
            return;
        }
        self.entries.entry(entry).or_insert_with(|| BatchAckState::new(id.entry_size()));
    }

    /// Whether the entry carrying `id` is tracked and not yet complete.
    pub fn is_tracked(&self, id: &MessageId) -> bool {
        self.entries.contains_key(&id.entry())
    }

    /// Whether `id` has been terminally acknowledged.
    pub fn is_acked(&self, id: &MessageId) -> bool {
        let entry = id.entry();
        if self.retired.contains(&entry) {
            return true;
        }
        self.entries.get(&entry).is_some_and(|state| state.is_acked(id.sub_index()))
    }

    /// Acknowledge one message.
    pub fn ack(&mut self, id: &MessageId) -> AckDecision {
        let entry = id.entry();
        let Some(state) = self.entries.get_mut(&entry) else {
            return AckDecision::Unknown;
        };
        if state.is_acked(id.sub_index()) {
            return AckDecision::Unknown;
        }
        if state.mark_acked(id.sub_index()) {
            self.retire(entry);
            AckDecision::EntryComplete(entry)
        } else {
            AckDecision::Partial
        }
    }

    /// Acknowledge `id` and everything before it in the same partition.
    ///
    /// Entries before `id`'s entry are completed outright; `id`'s own entry
    /// is acked up to its sub-index. Returns every entry this call completed,
    /// in ascending order.
    pub fn ack_cumulative(&mut self, id: &MessageId) -> Vec<EntryId> {
        let target = id.entry();
        let mut completed: Vec<EntryId> = self
            .entries
            .keys()
            .filter(|entry| entry.is_at_or_before(&target) && **entry != target)
            .copied()
            .collect();

        let is_target_complete =
            self.entries.get_mut(&target).is_some_and(|state| state.mark_acked_cumulative(id.sub_index()));
        if is_target_complete {
            completed.push(target);
        }

        completed.sort_unstable();
        for entry in &completed {
            self.retire(*entry);
        }
        completed
    }

    /// Negative acknowledgment of one message.
    ///
    /// Returns the id to schedule for redelivery, or `None` when it is
    /// unknown or already terminally acknowledged.
    pub fn negative_ack(&self, id: &MessageId) -> Option<MessageId> {
        let state = self.entries.get(&id.entry())?;
        state.mark_negative_acked(id.sub_index()).map(|_| *id)
    }

    /// Number of entries with unacknowledged sub-messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.retired.clear();
        self.retired_order.clear();
    }

    fn retire(&mut self, entry: EntryId) {
        self.entries.remove(&entry);
        if self.retired.insert(entry) {
            self.retired_order.push_back(entry);
        }
        while self.retired_order.len() > MAX_RETIRED_ENTRIES {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
                debug!(entry = %oldest, "forgetting retired batch entry");
            }
        }
    }
}
