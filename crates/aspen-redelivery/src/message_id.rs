//! Message identity types.
//!
//! A [`MessageId`] names exactly one logical message for its whole lifetime:
//! the ledger and entry the broker stored it in, the partition it came from,
//! and its position inside a batched entry.

use std::cmp::Ordering;
use std::hash::Hash;
use std::hash::Hasher;

use serde::Deserialize;
use serde::Serialize;

/// Partition index used for non-partitioned topics.
pub const NON_PARTITIONED: i32 = -1;

/// Batch index used for messages that were not published in a batch.
pub const NOT_BATCHED: i32 = -1;

/// Identity of a delivered message.
///
/// Equality, hashing and ordering consider only the identity tuple
/// `(partition_index, ledger_id, entry_id, batch_index)`. The `batch_size`
/// travels with the id so the batch ack table can size its bitset, but two
/// ids that differ only in `batch_size` are the same message.
///
/// Ordering is ascending by `(ledger_id, entry_id, batch_index)`, then by
/// `partition_index`.
///
/// # Examples
///
/// ```
/// use aspen_redelivery::MessageId;
///
/// let single = MessageId::new(7, 3);
/// let batched = MessageId::batched(7, 4, 0, 10);
/// assert!(single < batched);
/// assert_eq!(batched.entry().entry_id, 4);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessageId {
    /// Partition index, or [`NON_PARTITIONED`].
    pub partition_index: i32,
    /// Ledger holding the entry.
    pub ledger_id: u64,
    /// Entry within the ledger.
    pub entry_id: u64,
    /// Index inside a batched entry, or [`NOT_BATCHED`].
    pub batch_index: i32,
    /// Number of logical messages in the owning entry (0 when not batched).
    #[serde(default)]
    pub batch_size: u32,
}

impl MessageId {
    /// Identity of a non-batched message on a non-partitioned topic.
    pub const fn new(ledger_id: u64, entry_id: u64) -> Self {
        Self {
            partition_index: NON_PARTITIONED,
            ledger_id,
            entry_id,
            batch_index: NOT_BATCHED,
            batch_size: 0,
        }
    }

    /// Identity of one message inside a batched entry.
    pub const fn batched(ledger_id: u64, entry_id: u64, batch_index: i32, batch_size: u32) -> Self {
        Self {
            partition_index: NON_PARTITIONED,
            ledger_id,
            entry_id,
            batch_index,
            batch_size,
        }
    }

    /// Returns the same identity tagged with a partition index.
    pub const fn with_partition(mut self, partition_index: i32) -> Self {
        self.partition_index = partition_index;
        self
    }

    /// Whether this message is part of a batched entry.
    #[inline]
    pub const fn is_batched(&self) -> bool {
        self.batch_index >= 0 && self.batch_size > 0
    }

    /// Whether this message came from a partition of a partitioned topic.
    #[inline]
    pub const fn is_partitioned(&self) -> bool {
        self.partition_index >= 0
    }

    /// The wire entry carrying this message.
    #[inline]
    pub const fn entry(&self) -> EntryId {
        EntryId {
            partition_index: self.partition_index,
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
        }
    }

    /// Sub-index of this message inside its entry (0 for non-batched messages).
    #[inline]
    pub const fn sub_index(&self) -> u32 {
        if self.is_batched() { self.batch_index as u32 } else { 0 }
    }

    /// Number of sub-messages in the owning entry (1 for non-batched messages).
    #[inline]
    pub const fn entry_size(&self) -> u32 {
        if self.is_batched() { self.batch_size } else { 1 }
    }

    fn identity(&self) -> (u64, u64, i32, i32) {
        (self.ledger_id, self.entry_id, self.batch_index, self.partition_index)
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for MessageId {}

impl Hash for MessageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.ledger_id, self.entry_id, self.partition_index)?;
        if self.batch_index >= 0 {
            write!(f, ":{}", self.batch_index)?;
        }
        Ok(())
    }
}

/// Identity of one wire-level entry, which may hold many logical messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId {
    /// Partition index, or [`NON_PARTITIONED`].
    pub partition_index: i32,
    /// Ledger holding the entry.
    pub ledger_id: u64,
    /// Entry within the ledger.
    pub entry_id: u64,
}

impl EntryId {
    /// Whether this entry sorts at or before `other` within the same partition.
    #[inline]
    pub fn is_at_or_before(&self, other: &EntryId) -> bool {
        self.partition_index == other.partition_index && (self.ledger_id, self.entry_id) <= (other.ledger_id, other.entry_id)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.ledger_id, self.entry_id, self.partition_index)
    }
}

impl From<MessageId> for EntryId {
    fn from(id: MessageId) -> Self {
        id.entry()
    }
}
