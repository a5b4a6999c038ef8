use async_trait::async_trait;
use pubsub_messaging::{ConsumedMessage, SampleMessage};

/// MessageHandler はデコード済みメッセージを処理するアプリケーションロジック。
/// Err を返すとそのメッセージは確定されず、再配信される。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &SampleMessage, raw: &ConsumedMessage) -> anyhow::Result<()>;
}

/// LoggingMessageHandler は受信したメッセージをログに出すだけのハンドラ。
pub struct LoggingMessageHandler;

#[async_trait]
impl MessageHandler for LoggingMessageHandler {
    async fn handle(&self, message: &SampleMessage, raw: &ConsumedMessage) -> anyhow::Result<()> {
        tracing::info!(
            topic = %raw.topic,
            partition = raw.partition,
            offset = raw.offset,
            key = raw.key_str().as_deref().unwrap_or("-"),
            id = message.id,
            timestamp = %message.timestamp,
            "P{} → Msg#{}",
            raw.partition,
            message.id
        );
        Ok(())
    }
}
