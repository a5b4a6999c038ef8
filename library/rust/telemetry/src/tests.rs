#[cfg(test)]
mod tests {
    use crate::logger::LogConfig;
    use crate::metrics::Metrics;

    #[test]
    fn test_log_config_defaults() {
        let cfg: LogConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg, LogConfig::default());
        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.format, "json");
    }

    #[test]
    fn test_log_config_from_yaml() {
        let cfg: LogConfig = serde_yaml::from_str("level: debug\nformat: text\n").unwrap();
        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.format, "text");
    }

    #[test]
    fn test_metrics_registries_are_independent() {
        // 同名メトリクスを持つインスタンスを複数生成できる
        let first = Metrics::new("pubsub-producer").unwrap();
        let second = Metrics::new("pubsub-producer").unwrap();
        first.record_kafka_message_produced("test-topic");
        let value = second
            .kafka_messages_produced_total
            .with_label_values(&["test-topic"])
            .get();
        assert_eq!(value, 0);
    }

    #[test]
    fn test_produced_counter_increments() {
        let metrics = Metrics::new("pubsub-producer").unwrap();
        metrics.record_kafka_message_produced("test-topic");
        metrics.record_kafka_message_produced("test-topic");
        metrics.record_kafka_produce_failure("test-topic");

        let value = metrics
            .kafka_messages_produced_total
            .with_label_values(&["test-topic"])
            .get();
        assert_eq!(value, 2);
        let failures = metrics
            .kafka_produce_failures_total
            .with_label_values(&["test-topic"])
            .get();
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_consumer_counters_in_text_output() {
        let metrics = Metrics::new("pubsub-consumer").unwrap();
        metrics.record_kafka_message_consumed("test-topic", "test-group");
        metrics.record_kafka_message_malformed("test-topic");
        metrics.record_kafka_offset_commit("test-topic", 2);
        metrics.record_kafka_rebalance("test-group");

        let text = metrics.gather_metrics();
        assert!(text.contains("kafka_messages_consumed_total"));
        assert!(text.contains("consumer_group=\"test-group\""));
        assert!(text.contains("kafka_messages_malformed_total"));
        assert!(text.contains("partition=\"2\""));
        assert!(text.contains("kafka_rebalances_total"));
        assert!(text.contains("service=\"pubsub-consumer\""));
    }
}
