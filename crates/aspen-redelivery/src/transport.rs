//! Broker-facing transport seam.
//!
//! The redelivery core never touches the network. It hands redelivery
//! requests and entry acknowledgments to a [`RedeliveryTransport`], which owns
//! connection state and any wire-level retry.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message_id::EntryId;
use crate::message_id::MessageId;

/// Identifier the broker assigned to a consumer.
pub type ConsumerId = u64;

/// How an entry acknowledgment should be applied by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    /// Delete exactly this entry.
    Individual,
    /// Advance the cursor through this entry.
    Cumulative,
}

/// Calls the redelivery core makes towards the broker.
///
/// Both calls are fire-and-forget from the core's point of view: an `Err`
/// means the request did not leave the client and will be retried on the
/// next sweep tick.
#[async_trait]
pub trait RedeliveryTransport: Send + Sync {
    /// Ask the broker to resend the given messages to this consumer's subscription.
    async fn send_redeliver_request(&self, consumer_id: ConsumerId, ids: &[MessageId]) -> Result<(), TransportError>;

    /// Tell the broker a fully acknowledged entry can be deleted.
    async fn send_ack_or_delete(&self, consumer_id: ConsumerId, entry: EntryId, kind: AckKind) -> Result<(), TransportError>;
}
