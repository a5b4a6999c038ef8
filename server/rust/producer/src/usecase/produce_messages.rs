use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pubsub_messaging::{EventProducer, MessagingError, SampleMessage};
use pubsub_telemetry::Metrics;

/// ProduceMessagesUseCase は連番付きのサンプルメッセージを 1 件ずつ送信する。
/// 連番は送信に成功したときだけ進むため、送信済み ID は 0 から欠番なく並ぶ。
pub struct ProduceMessagesUseCase {
    producer: Arc<dyn EventProducer>,
    metrics: Arc<Metrics>,
    topic: String,
    count: Option<u64>,
    next_id: AtomicU64,
}

impl ProduceMessagesUseCase {
    pub fn new(
        producer: Arc<dyn EventProducer>,
        metrics: Arc<Metrics>,
        topic: impl Into<String>,
        count: Option<u64>,
    ) -> Self {
        Self {
            producer,
            metrics,
            topic: topic.into(),
            count,
            next_id: AtomicU64::new(0),
        }
    }

    /// 送信に成功したメッセージ数（= 次に送る ID）。
    pub fn sent(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// 予定数を送り終えたか。count が None の場合は常に false。
    pub fn is_complete(&self) -> bool {
        self.count.is_some_and(|count| self.sent() >= count)
    }

    /// 次のメッセージを送信する。失敗した場合、同じ ID は次回に再送される。
    pub async fn execute(&self) -> Result<SampleMessage, MessagingError> {
        let message = SampleMessage::new(self.sent());
        let envelope = message.to_envelope(self.topic.as_str())?;
        let line = sent_line(message.id, &envelope.payload);

        if let Err(e) = self.producer.publish(envelope).await {
            self.metrics.record_kafka_produce_failure(&self.topic);
            return Err(e);
        }

        self.next_id.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_kafka_message_produced(&self.topic);
        tracing::info!(
            topic = %self.topic,
            id = message.id,
            key = %message.key(),
            "{line}"
        );
        Ok(message)
    }
}

/// 送信ログの本文。値はシリアライズ済みの JSON をそのまま出す。
fn sent_line(id: u64, payload: &[u8]) -> String {
    format!("Message sent: {id} - {}", String::from_utf8_lossy(payload))
}
