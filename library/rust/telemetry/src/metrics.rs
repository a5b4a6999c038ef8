use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::TelemetryError;

/// Metrics は Kafka プロデューサー・コンシューマーの Prometheus カウンタをまとめる。
/// レジストリはインスタンスごとに独立しており、テストで複数生成しても衝突しない。
pub struct Metrics {
    pub kafka_messages_produced_total: IntCounterVec,
    pub kafka_produce_failures_total: IntCounterVec,
    pub kafka_messages_consumed_total: IntCounterVec,
    pub kafka_messages_malformed_total: IntCounterVec,
    pub kafka_offset_commits_total: IntCounterVec,
    pub kafka_rebalances_total: IntCounterVec,
    registry: Registry,
}

fn counter(
    registry: &Registry,
    service_name: &str,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, TelemetryError> {
    let counter = IntCounterVec::new(
        Opts::new(name, help).const_label("service", service_name),
        labels,
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// new は Prometheus メトリクスを初期化して返す。
    /// service_name はメトリクスの service ラベルに使用される。
    pub fn new(service_name: &str) -> Result<Self, TelemetryError> {
        let registry = Registry::new();
        Ok(Self {
            kafka_messages_produced_total: counter(
                &registry,
                service_name,
                "kafka_messages_produced_total",
                "Total number of Kafka messages produced",
                &["topic"],
            )?,
            kafka_produce_failures_total: counter(
                &registry,
                service_name,
                "kafka_produce_failures_total",
                "Total number of failed Kafka produce attempts",
                &["topic"],
            )?,
            kafka_messages_consumed_total: counter(
                &registry,
                service_name,
                "kafka_messages_consumed_total",
                "Total number of Kafka messages consumed",
                &["topic", "consumer_group"],
            )?,
            kafka_messages_malformed_total: counter(
                &registry,
                service_name,
                "kafka_messages_malformed_total",
                "Total number of Kafka messages that could not be decoded",
                &["topic"],
            )?,
            kafka_offset_commits_total: counter(
                &registry,
                service_name,
                "kafka_offset_commits_total",
                "Total number of offset commits",
                &["topic", "partition"],
            )?,
            kafka_rebalances_total: counter(
                &registry,
                service_name,
                "kafka_rebalances_total",
                "Total number of consumer group rebalances",
                &["consumer_group"],
            )?,
            registry,
        })
    }

    /// record_kafka_message_produced は Kafka メッセージ送信カウンタをインクリメントする。
    pub fn record_kafka_message_produced(&self, topic: &str) {
        self.kafka_messages_produced_total
            .with_label_values(&[topic])
            .inc();
    }

    pub fn record_kafka_produce_failure(&self, topic: &str) {
        self.kafka_produce_failures_total
            .with_label_values(&[topic])
            .inc();
    }

    /// record_kafka_message_consumed は Kafka メッセージ受信カウンタをインクリメントする。
    pub fn record_kafka_message_consumed(&self, topic: &str, consumer_group: &str) {
        self.kafka_messages_consumed_total
            .with_label_values(&[topic, consumer_group])
            .inc();
    }

    pub fn record_kafka_message_malformed(&self, topic: &str) {
        self.kafka_messages_malformed_total
            .with_label_values(&[topic])
            .inc();
    }

    pub fn record_kafka_offset_commit(&self, topic: &str, partition: i32) {
        self.kafka_offset_commits_total
            .with_label_values(&[topic, &partition.to_string()])
            .inc();
    }

    pub fn record_kafka_rebalance(&self, consumer_group: &str) {
        self.kafka_rebalances_total
            .with_label_values(&[consumer_group])
            .inc();
    }

    /// gather_metrics は Prometheus テキストフォーマットでメトリクスを返す。
    /// エンコードに失敗した場合は空文字列を返す。
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "メトリクスのエンコードに失敗しました");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
