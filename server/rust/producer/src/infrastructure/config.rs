use pubsub_messaging::MessagingConfig;
use pubsub_telemetry::LogConfig;
use serde::Deserialize;

/// Config はアプリケーション全体の設定。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub kafka: MessagingConfig,
    #[serde(default)]
    pub producer: ProducerSettings,
}

impl Config {
    /// 環境変数による上書きを適用する（KAFKA_BROKERS）。
    pub fn apply_env_overrides(&mut self) {
        if let Ok(brokers) = std::env::var("KAFKA_BROKERS") {
            self.kafka.override_brokers(&brokers);
        }
    }
}

/// AppConfig はアプリケーション設定。
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_name() -> String {
    "pubsub-producer".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            environment: default_environment(),
        }
    }
}

/// ProducerSettings は送信ループの設定。
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerSettings {
    #[serde(default = "default_topic")]
    pub topic: String,
    /// 送信するメッセージ数。null の場合は停止されるまで送り続ける
    #[serde(default = "default_message_count")]
    pub message_count: Option<u64>,
    /// 送信間隔（ミリ秒）
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_topic() -> String {
    "test-topic".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_message_count() -> Option<u64> {
    Some(100)
}

fn default_interval_ms() -> u64 {
    1000
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            message_count: default_message_count(),
            interval_ms: default_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
app:
  name: "pubsub-producer"
  version: "0.1.0"
log:
  level: "debug"
  format: "text"
kafka:
  brokers:
    - "kafka-0:9092"
    - "kafka-1:9092"
  client_id: "my-producer"
producer:
  topic: "orders"
  message_count: 10
  interval_ms: 250
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.app.name, "pubsub-producer");
        assert_eq!(config.log.format, "text");
        assert_eq!(config.kafka.brokers.len(), 2);
        assert_eq!(config.kafka.client_id.as_deref(), Some("my-producer"));
        assert_eq!(config.producer.topic, "orders");
        assert_eq!(config.producer.message_count, Some(10));
        assert_eq!(config.producer.interval_ms, 250);
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_yaml::from_str("app: {}\n").unwrap();
        assert_eq!(config.app.environment, "dev");
        assert_eq!(config.kafka.brokers, vec!["localhost:19092".to_string()]);
        assert_eq!(config.kafka.retry.retries, 8);
        assert_eq!(config.producer.topic, "test-topic");
        assert_eq!(config.producer.message_count, Some(100));
        assert_eq!(config.producer.interval_ms, 1000);
    }

    #[test]
    fn test_unbounded_message_count() {
        let config: Config = serde_yaml::from_str("producer:\n  message_count: null\n").unwrap();
        assert_eq!(config.producer.message_count, None);
    }
}
