/// producer integration tests
/// InMemoryBroker を使って接続から送信ループ、シャットダウンまでを検証する。
use std::sync::Arc;
use std::time::Duration;

use pubsub_messaging::testing::{InMemoryBroker, InMemoryProducer};
use pubsub_messaging::{MessagingConfig, SampleMessage};
use pubsub_producer::infrastructure::config::ProducerSettings;
use pubsub_producer::runner::ProducerRunner;
use pubsub_retry::RetrySettings;
use pubsub_server_common::{ShutdownCoordinator, ShutdownReason};
use pubsub_telemetry::Metrics;

const PARTITIONS: i32 = 3;

fn kafka_config() -> MessagingConfig {
    MessagingConfig {
        retry: RetrySettings {
            initial_retry_time_ms: 10,
            retries: 2,
            max_retry_time_ms: 100,
            multiplier: 2.0,
        },
        ..MessagingConfig::default()
    }
}

fn settings(count: Option<u64>) -> ProducerSettings {
    ProducerSettings {
        topic: "test-topic".to_string(),
        message_count: count,
        interval_ms: 100,
    }
}

struct Harness {
    broker: InMemoryBroker,
    producer: Arc<InMemoryProducer>,
    coordinator: Arc<ShutdownCoordinator>,
    metrics: Arc<Metrics>,
}

impl Harness {
    fn new() -> Self {
        let broker = InMemoryBroker::new(PARTITIONS);
        let producer = Arc::new(broker.producer("my-producer"));
        Self {
            broker,
            producer,
            coordinator: Arc::new(ShutdownCoordinator::new()),
            metrics: Arc::new(Metrics::new("pubsub-producer").unwrap()),
        }
    }

    fn runner(&self) -> ProducerRunner {
        ProducerRunner::new(
            self.producer.clone(),
            self.coordinator.clone(),
            self.metrics.clone(),
        )
    }

    /// 全パーティションに保存された ID を昇順で返す。
    fn sent_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = (0..PARTITIONS)
            .flat_map(|p| self.broker.records("test-topic", p))
            .map(|m| SampleMessage::from_bytes(&m.payload).unwrap().id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[tokio::test(start_paused = true)]
async fn test_sends_exactly_count_contiguous_ids() {
    let h = Harness::new();
    let outcome = h.runner().run(&kafka_config(), &settings(Some(100))).await;

    assert_eq!(h.sent_ids(), (0..100).collect::<Vec<u64>>());
    assert_eq!(outcome.reason, ShutdownReason::Completed);
    assert_eq!(outcome.exit_status(), 0);
    assert_eq!(h.producer.disconnect_calls(), 1);
    let produced = h
        .metrics
        .kafka_messages_produced_total
        .with_label_values(&["test-topic"])
        .get();
    assert_eq!(produced, 100);
}

#[tokio::test(start_paused = true)]
async fn test_same_key_lands_on_same_partition() {
    let h = Harness::new();
    h.runner().run(&kafka_config(), &settings(Some(10))).await;

    for partition in 0..PARTITIONS {
        for record in h.broker.records("test-topic", partition) {
            let id = SampleMessage::from_bytes(&record.payload).unwrap().id;
            assert_eq!(record.key_str(), Some(format!("key-{id}")));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_send_failure_does_not_stop_loop() {
    let h = Harness::new();
    h.broker.fail_next_publishes(2);
    let outcome = h.runner().run(&kafka_config(), &settings(Some(5))).await;

    assert_eq!(h.sent_ids(), vec![0, 1, 2, 3, 4]);
    assert_eq!(outcome.exit_status(), 0);
    let failures = h
        .metrics
        .kafka_produce_failures_total
        .with_label_values(&["test-topic"])
        .get();
    assert_eq!(failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_exits_one() {
    let h = Harness::new();
    h.broker.set_reachable(false);
    let outcome = h.runner().run(&kafka_config(), &settings(Some(5))).await;

    assert!(matches!(outcome.reason, ShutdownReason::ConnectFailed(_)));
    assert_eq!(outcome.exit_status(), 1);
    // 初回 + リトライ 2 回
    assert_eq!(h.producer.connect_attempts(), 3);
    assert!(h.sent_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_signal_stops_unbounded_loop() {
    let h = Harness::new();
    let coordinator = h.coordinator.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(550)).await;
        coordinator.trigger(ShutdownReason::Signal("SIGINT".to_string()));
        coordinator.trigger(ShutdownReason::Signal("SIGINT".to_string()));
    });

    let outcome = h.runner().run(&kafka_config(), &settings(None)).await;

    assert_eq!(h.sent_ids(), vec![0, 1, 2, 3, 4]);
    assert_eq!(outcome.reason, ShutdownReason::Signal("SIGINT".to_string()));
    assert_eq!(outcome.exit_status(), 0);
    assert_eq!(h.producer.disconnect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_failure_exits_one() {
    let h = Harness::new();
    h.producer.set_fail_disconnect(true);
    let outcome = h.runner().run(&kafka_config(), &settings(Some(2))).await;

    assert_eq!(h.sent_ids(), vec![0, 1]);
    assert!(!outcome.disconnect_ok);
    assert_eq!(outcome.exit_status(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_count_sends_nothing() {
    let h = Harness::new();
    let outcome = h.runner().run(&kafka_config(), &settings(Some(0))).await;
    assert!(h.sent_ids().is_empty());
    assert_eq!(outcome.reason, ShutdownReason::Completed);
}
