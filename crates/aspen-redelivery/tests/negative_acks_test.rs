//! End-to-end negative acknowledgment tests against an in-memory broker.
//!
//! A consumer receives interleaved `positive-*` and `negative-*` messages,
//! acks the first set and nacks the second, and must see exactly the
//! negatives come back once each. The scenario runs across every combination
//! of batching, partitioning, subscription type, nack delay and ack timeout.
//!
//! All tests run on a paused tokio clock, so delays are exact and the suite
//! finishes instantly.

mod support;

use std::collections::HashSet;
use std::time::Duration;

use aspen_redelivery::MessageId;
use aspen_redelivery::NON_PARTITIONED;
use aspen_redelivery::RedeliveryConfig;
use aspen_redelivery::SubscriptionType;
use support::TestConsumer;
use tokio::time::Instant;

const MESSAGE_PAIRS: usize = 10;
const BATCH_SIZE: usize = 4;
const PARTITIONS: u32 = 3;
const RECEIVE_WAIT: Duration = Duration::from_secs(5);
const QUIET_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Scenario {
    is_batched: bool,
    is_partitioned: bool,
    subscription_type: SubscriptionType,
    negative_ack_delay_ms: u64,
    ack_timeout_ms: u64,
}

impl Scenario {
    fn all() -> Vec<Scenario> {
        let mut scenarios = Vec::new();
        for is_batched in [false, true] {
            for is_partitioned in [false, true] {
                for subscription_type in [SubscriptionType::Shared, SubscriptionType::Failover] {
                    for negative_ack_delay_ms in [100, 0] {
                        for ack_timeout_ms in [0, 1_000] {
                            scenarios.push(Scenario {
                                is_batched,
                                is_partitioned,
                                subscription_type,
                                negative_ack_delay_ms,
                                ack_timeout_ms,
                            });
                        }
                    }
                }
            }
        }
        scenarios
    }

    fn config(&self) -> RedeliveryConfig {
        RedeliveryConfig::default()
            .with_subscription_type(self.subscription_type)
            .with_negative_ack_delay(Duration::from_millis(self.negative_ack_delay_ms))
            .with_ack_timeout(Duration::from_millis(self.ack_timeout_ms))
    }

    fn consumer(&self) -> TestConsumer {
        if self.is_partitioned {
            TestConsumer::partitioned(PARTITIONS, self.config())
        } else {
            TestConsumer::single(self.config())
        }
    }

    fn partition_for(&self, entry_number: usize) -> i32 {
        if self.is_partitioned {
            (entry_number % PARTITIONS as usize) as i32
        } else {
            NON_PARTITIONED
        }
    }

    /// Publish `positive-i` and `negative-i` interleaved so batches mix both.
    fn publish(&self, consumer: &TestConsumer) {
        let payloads: Vec<String> =
            (0..MESSAGE_PAIRS).flat_map(|i| [format!("positive-{i}"), format!("negative-{i}")]).collect();

        if self.is_batched {
            for (entry_number, chunk) in payloads.chunks(BATCH_SIZE).enumerate() {
                consumer.broker.publish_batch(self.partition_for(entry_number), chunk);
            }
        } else {
            for (entry_number, payload) in payloads.iter().enumerate() {
                consumer.broker.publish(self.partition_for(entry_number), payload);
            }
        }
    }
}

async fn run_scenario(scenario: Scenario) {
    let mut consumer = scenario.consumer();
    scenario.publish(&consumer);

    let mut negatives = HashSet::new();
    for _ in 0..MESSAGE_PAIRS * 2 {
        let delivery = consumer.receive(RECEIVE_WAIT).await.unwrap_or_else(|| panic!("{scenario:?}: missing delivery"));
        assert_eq!(delivery.redelivery_count, 0, "{scenario:?}");
        if delivery.payload.starts_with("positive-") {
            consumer.acknowledge(delivery.id).await;
        } else {
            negatives.insert(delivery.payload.clone());
            consumer.negative_acknowledge(delivery.id);
        }
    }
    assert_eq!(negatives.len(), MESSAGE_PAIRS, "{scenario:?}");
    let nacked_at = Instant::now();

    let delay = Duration::from_millis(scenario.negative_ack_delay_ms);
    let slack = consumer_sweep_tick(&scenario);
    let mut redelivered = HashSet::new();
    for _ in 0..MESSAGE_PAIRS {
        let delivery = consumer
            .receive(RECEIVE_WAIT)
            .await
            .unwrap_or_else(|| panic!("{scenario:?}: missing redelivery"));
        let elapsed = nacked_at.elapsed();
        assert!(elapsed >= delay, "{scenario:?}: redelivered after {elapsed:?}");
        assert!(elapsed <= delay + slack, "{scenario:?}: redelivered after {elapsed:?}");
        assert_eq!(delivery.redelivery_count, 1, "{scenario:?}");
        assert!(redelivered.insert(delivery.payload.clone()), "{scenario:?}: {} twice", delivery.payload);
        consumer.acknowledge(delivery.id).await;
    }
    assert_eq!(redelivered, negatives, "{scenario:?}");

    assert!(consumer.receive(QUIET_WAIT).await.is_none(), "{scenario:?}: unexpected extra delivery");
    consumer.close();
}

fn consumer_sweep_tick(scenario: &Scenario) -> Duration {
    scenario.config().sweep_tick()
}

#[tokio::test(start_paused = true)]
async fn test_negative_acks_redelivered_exactly_once() {
    support::init_tracing();
    for scenario in Scenario::all() {
        run_scenario(scenario).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_acked_batches_are_deleted_on_broker() {
    let scenario = Scenario {
        is_batched: true,
        is_partitioned: false,
        subscription_type: SubscriptionType::Shared,
        negative_ack_delay_ms: 100,
        ack_timeout_ms: 0,
    };
    let mut consumer = scenario.consumer();
    scenario.publish(&consumer);

    let mut received: Vec<(MessageId, String)> = Vec::new();
    for _ in 0..MESSAGE_PAIRS * 2 {
        let delivery = consumer.receive(RECEIVE_WAIT).await.unwrap();
        received.push((delivery.id, delivery.payload));
    }

    // Ack positives only: no mixed entry is complete yet.
    for (id, payload) in &received {
        if payload.starts_with("positive-") {
            consumer.acknowledge(*id).await;
        } else {
            consumer.negative_acknowledge(*id);
        }
    }
    assert!(received.iter().all(|(id, _)| !consumer.broker.is_deleted(id)));

    // Ack the redelivered negatives: every entry completes and is deleted.
    for _ in 0..MESSAGE_PAIRS {
        let delivery = consumer.receive(RECEIVE_WAIT).await.unwrap();
        consumer.acknowledge(delivery.id).await;
    }
    assert!(received.iter().all(|(id, _)| consumer.broker.is_deleted(id)));
}

#[tokio::test(start_paused = true)]
async fn test_redeliveries_stay_on_their_partition() {
    let scenario = Scenario {
        is_batched: false,
        is_partitioned: true,
        subscription_type: SubscriptionType::Failover,
        negative_ack_delay_ms: 100,
        ack_timeout_ms: 0,
    };
    let mut consumer = scenario.consumer();
    scenario.publish(&consumer);

    for _ in 0..MESSAGE_PAIRS * 2 {
        let delivery = consumer.receive(RECEIVE_WAIT).await.unwrap();
        consumer.negative_acknowledge(delivery.id);
    }
    for _ in 0..MESSAGE_PAIRS * 2 {
        let delivery = consumer.receive(RECEIVE_WAIT).await.unwrap();
        consumer.acknowledge(delivery.id).await;
    }

    let requests = consumer.broker.redelivery_requests();
    assert_eq!(requests.len(), MESSAGE_PAIRS * 2);
    for (consumer_id, id) in requests {
        assert_eq!(id.partition_index, (consumer_id - 1) as i32);
    }
}
