use pubsub_messaging::{ConsumerConfig, MessagingConfig};
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
    pub consumer: ConsumerConfig,
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
    "pubsub-consumer".to_string()
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
