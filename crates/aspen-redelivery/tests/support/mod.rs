//! In-memory broker for redelivery integration tests.
//!
//! Publishes messages into a channel the test consumer reads from, answers
//! redelivery requests by re-dispatching the named messages with a bumped
//! redelivery count, and applies entry acks by deleting entries.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use aspen_redelivery::AckKind;
use aspen_redelivery::ConsumerId;
use aspen_redelivery::ConsumerRedeliveryCoordinator;
use aspen_redelivery::EntryId;
use aspen_redelivery::MessageId;
use aspen_redelivery::PartitionRouter;
use aspen_redelivery::RedeliveryConfig;
use aspen_redelivery::RedeliveryTransport;
use aspen_redelivery::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ledger every test message is written to.
pub const LEDGER_ID: u64 = 7;

/// One message as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub payload: String,
    pub redelivery_count: u32,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_entry: BTreeMap<i32, u64>,
    payloads: HashMap<MessageId, String>,
    redelivery_counts: HashMap<MessageId, u32>,
    deleted: HashSet<EntryId>,
    redelivery_requests: Vec<(ConsumerId, MessageId)>,
}

/// Broker double shared by the producer side and the consumer's transport.
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    dispatch: mpsc::UnboundedSender<Delivery>,
    is_disconnected: AtomicBool,
}

impl InMemoryBroker {
    /// Create a broker and the receiving end of its dispatch channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (dispatch, receiver) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            dispatch,
            is_disconnected: AtomicBool::new(false),
        });
        (broker, receiver)
    }

    /// Publish a single message on `partition_index` and dispatch it.
    pub fn publish(&self, partition_index: i32, payload: &str) -> MessageId {
        let mut state = self.state.lock();
        let entry_id = Self::allocate_entry(&mut state, partition_index);
        let id = MessageId::new(LEDGER_ID, entry_id).with_partition(partition_index);
        state.payloads.insert(id, payload.to_string());
        drop(state);

        self.dispatch(id, payload.to_string(), 0);
        id
    }

    /// Publish `payloads` as one batch entry on `partition_index` and dispatch every sub-message.
    pub fn publish_batch(&self, partition_index: i32, payloads: &[String]) -> Vec<MessageId> {
        let batch_size = payloads.len() as u32;
        let mut state = self.state.lock();
        let entry_id = Self::allocate_entry(&mut state, partition_index);
        let ids: Vec<MessageId> = (0..payloads.len())
            .map(|index| MessageId::batched(LEDGER_ID, entry_id, index as i32, batch_size).with_partition(partition_index))
            .collect();
        for (id, payload) in ids.iter().zip(payloads) {
            state.payloads.insert(*id, payload.clone());
        }
        drop(state);

        for (id, payload) in ids.iter().zip(payloads) {
            self.dispatch(*id, payload.clone(), 0);
        }
        ids
    }

    /// Make every transport call fail until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.is_disconnected.store(true, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.is_disconnected.store(false, Ordering::SeqCst);
    }

    /// Every redelivery request the broker accepted, in arrival order.
    pub fn redelivery_requests(&self) -> Vec<(ConsumerId, MessageId)> {
        self.state.lock().redelivery_requests.clone()
    }

    /// Whether the broker has deleted the entry holding `id`.
    pub fn is_deleted(&self, id: &MessageId) -> bool {
        self.state.lock().deleted.contains(&id.entry())
    }

    fn allocate_entry(state: &mut BrokerState, partition_index: i32) -> u64 {
        let next = state.next_entry.entry(partition_index).or_insert(0);
        let entry_id = *next;
        *next += 1;
        entry_id
    }

    fn dispatch(&self, id: MessageId, payload: String, redelivery_count: u32) {
        let _ = self.dispatch.send(Delivery {
            id,
            payload,
            redelivery_count,
        });
    }
}

#[async_trait]
impl RedeliveryTransport for InMemoryBroker {
    async fn send_redeliver_request(&self, consumer_id: ConsumerId, ids: &[MessageId]) -> Result<(), TransportError> {
        if self.is_disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected { consumer_id });
        }

        let mut redeliveries = Vec::with_capacity(ids.len());
        {
            let mut state = self.state.lock();
            for id in ids {
                state.redelivery_requests.push((consumer_id, *id));
                if state.deleted.contains(&id.entry()) {
                    continue;
                }
                let Some(payload) = state.payloads.get(id).cloned() else {
                    continue;
                };
                let count = state.redelivery_counts.entry(*id).or_insert(0);
                *count += 1;
                redeliveries.push((*id, payload, *count));
            }
        }

        for (id, payload, count) in redeliveries {
            self.dispatch(id, payload, count);
        }
        Ok(())
    }

    async fn send_ack_or_delete(&self, consumer_id: ConsumerId, entry: EntryId, kind: AckKind) -> Result<(), TransportError> {
        if self.is_disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected { consumer_id });
        }

        let mut state = self.state.lock();
        match kind {
            AckKind::Individual => {
                state.deleted.insert(entry);
            }
            AckKind::Cumulative => {
                let covered: Vec<EntryId> = state
                    .payloads
                    .keys()
                    .map(MessageId::entry)
                    .filter(|other| other.is_at_or_before(&entry))
                    .collect();
                state.deleted.extend(covered);
            }
        }
        Ok(())
    }
}

/// Either a single-partition coordinator or a partition router.
#[derive(Debug, Clone)]
pub enum Redelivery {
    Single(Arc<ConsumerRedeliveryCoordinator>),
    Partitioned(Arc<PartitionRouter>),
}

/// Consumer side of a test: receives from the broker and drives the redelivery core.
pub struct TestConsumer {
    pub broker: Arc<InMemoryBroker>,
    pub redelivery: Redelivery,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl TestConsumer {
    /// Single-partition consumer with its own sweep timer.
    pub fn single(config: RedeliveryConfig) -> Self {
        let (broker, receiver) = InMemoryBroker::new();
        let coordinator = Arc::new(ConsumerRedeliveryCoordinator::new(1, config, broker.clone()).unwrap());
        coordinator.start();
        Self {
            broker,
            redelivery: Redelivery::Single(coordinator),
            receiver,
        }
    }

    /// Partitioned consumer driven by one shared sweep timer.
    pub fn partitioned(partitions: u32, config: RedeliveryConfig) -> Self {
        let (broker, receiver) = InMemoryBroker::new();
        let router = Arc::new(PartitionRouter::new(1, partitions, config, broker.clone()).unwrap());
        router.start();
        Self {
            broker,
            redelivery: Redelivery::Partitioned(router),
            receiver,
        }
    }

    /// Wait up to `wait` for the next message and register it with the redelivery core.
    pub async fn receive(&mut self, wait: Duration) -> Option<Delivery> {
        let delivery = tokio::time::timeout(wait, self.receiver.recv()).await.ok()??;
        match &self.redelivery {
            Redelivery::Single(c) => c.on_message_redelivered(delivery.id, delivery.redelivery_count),
            Redelivery::Partitioned(r) => r.on_message_redelivered(delivery.id, delivery.redelivery_count),
        }
        Some(delivery)
    }

    pub async fn acknowledge(&self, id: MessageId) {
        match &self.redelivery {
            Redelivery::Single(c) => c.acknowledge(id).await,
            Redelivery::Partitioned(r) => r.acknowledge(id).await,
        }
    }

    pub async fn acknowledge_cumulative(&self, id: MessageId) {
        match &self.redelivery {
            Redelivery::Single(c) => c.acknowledge_cumulative(id).await,
            Redelivery::Partitioned(r) => r.acknowledge_cumulative(id).await,
        }
    }

    pub fn negative_acknowledge(&self, id: MessageId) {
        match &self.redelivery {
            Redelivery::Single(c) => c.negative_acknowledge(id),
            Redelivery::Partitioned(r) => r.negative_acknowledge(id),
        }
    }

    pub fn close(&self) {
        match &self.redelivery {
            Redelivery::Single(c) => c.close(),
            Redelivery::Partitioned(r) => r.close(),
        }
    }
}
