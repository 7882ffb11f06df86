//! Client-side redelivery scheduling for pub/sub consumers.
//!
//! Decides when a message handed to the application must be sent again:
//!
//! - `NegativeAckTracker` - explicit negative acks, redelivered after a delay
//! - `UnackedMessageTracker` - messages never acknowledged within the ack timeout
//! - `BatchAckTable` - per-entry bitsets so a batch is acked once all sub-messages are
//! - `ConsumerRedeliveryCoordinator` - the per-consumer façade tying them together
//! - `PartitionRouter` - one coordinator per partition behind a single timer
//!
//! The core never performs I/O itself. Redelivery requests and entry acks go
//! through a [`RedeliveryTransport`] supplied by the caller, and redelivered
//! messages re-enter through the normal delivery path.
//!
//! ## Example
//!
//! ```ignore
//! use aspen_redelivery::{ConsumerRedeliveryCoordinator, MessageId, RedeliveryConfig};
//!
//! let config = RedeliveryConfig::default().with_negative_ack_delay(Duration::from_millis(100));
//! let coordinator = Arc::new(ConsumerRedeliveryCoordinator::new(1, config, transport)?);
//! coordinator.start();
//!
//! let id = MessageId::new(3, 17);
//! coordinator.on_message_delivered(id);
//! coordinator.negative_acknowledge(id);
//! // ~100ms later the transport receives a redelivery request for `id`.
//! ```

mod batch;
mod config;
pub mod constants;
mod coordinator;
mod error;
mod message_id;
mod negative_ack;
pub mod pure;
mod router;
mod sweeper;
mod transport;
mod unacked;

pub use batch::AckDecision;
pub use batch::BatchAckState;
pub use batch::BatchAckTable;
pub use config::BackoffConfig;
pub use config::RedeliveryConfig;
pub use config::SubscriptionType;
pub use coordinator::ConsumerRedeliveryCoordinator;
pub use coordinator::CoordinatorStats;
pub use error::RedeliveryError;
pub use error::Result;
pub use error::TransportError;
pub use message_id::EntryId;
pub use message_id::MessageId;
pub use message_id::NON_PARTITIONED;
pub use message_id::NOT_BATCHED;
pub use negative_ack::NegativeAckTracker;
pub use router::PartitionRouter;
pub use sweeper::RedeliveryClock;
pub use sweeper::SweepHandle;
pub use sweeper::SweepReport;
pub use sweeper::SweepTarget;
pub use sweeper::spawn_sweeper;
pub use transport::AckKind;
pub use transport::ConsumerId;
pub use transport::RedeliveryTransport;
pub use unacked::DeliveryRecord;
pub use unacked::UnackedMessageTracker;
