use async_trait::async_trait;

use crate::error::MessagingError;
use crate::event::EventEnvelope;

/// EventProducer はメッセージ発行用のブローカークライアントのインターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// ブローカーとのセッションを確立する。
    async fn connect(&self) -> Result<(), MessagingError>;

    /// 単一のイベントを発行する。
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), MessagingError>;

    /// 送信待ちをフラッシュしてセッションを切断する。切断済みの場合も成功を返す。
    async fn disconnect(&self) -> Result<(), MessagingError>;
}
