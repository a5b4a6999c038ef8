//! KafkaEventProducer: rdkafka を使用した EventProducer 実装。
//! feature = "kafka" で有効化される。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};

use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::event::EventEnvelope;
use crate::producer::EventProducer;

/// KafkaEventProducer は rdkafka の FutureProducer を使った実装。
pub struct KafkaEventProducer {
    producer: FutureProducer,
    timeout: Duration,
    closed: AtomicBool,
}

impl KafkaEventProducer {
    /// MessagingConfig から KafkaEventProducer を生成する。
    pub fn new(config: &MessagingConfig, client_id: &str) -> Result<Self, MessagingError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers_string())
            .set("client.id", client_id)
            .set("security.protocol", &config.security_protocol)
            .set("message.timeout.ms", "30000")
            .set(
                "retry.backoff.ms",
                config.retry.initial_retry_time_ms.to_string(),
            )
            .set("retries", config.retry.retries.to_string())
            .create()
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;
        Ok(Self {
            producer,
            timeout: Duration::from_millis(config.timeout_ms),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EventProducer for KafkaEventProducer {
    async fn connect(&self) -> Result<(), MessagingError> {
        // メタデータ取得でブローカーへの到達性を確認する
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|m| m.brokers().len())
        })
        .await
        .map_err(|e| MessagingError::ConnectionError(e.to_string()))?
        .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;

        tracing::debug!(brokers = metadata, "プロデューサーがブローカーに接続しました");
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, envelope: EventEnvelope) -> Result<(), MessagingError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &envelope.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let mut record = FutureRecord::<str, [u8]>::to(&envelope.topic)
            .payload(envelope.payload.as_slice())
            .headers(headers);
        if let Some(key) = envelope.key.as_deref() {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(err, _)| MessagingError::PublishError(err.to_string()))?;

        tracing::trace!(topic = %envelope.topic, partition, offset, "メッセージを送信しました");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))
    }
}
