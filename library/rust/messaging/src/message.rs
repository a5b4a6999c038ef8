use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MessagingError;
use crate::event::EventEnvelope;

/// SampleMessage はプロデューサーが送信し、コンシューマーが受信するメッセージ本体。
/// JSON では `{id, timestamp, data, randomValue}` として表現される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleMessage {
    /// プロデューサー実行ごとに 0 から単調増加する ID
    pub id: u64,
    /// 送信時刻（ISO-8601、ミリ秒精度の UTC）
    pub timestamp: String,
    /// 任意の文字列データ
    pub data: String,
    /// 説明用の乱数フィールド
    #[serde(default)]
    pub random_value: f64,
}

impl SampleMessage {
    /// 送信直前に呼び出し、現在時刻と乱数を埋めたメッセージを生成する。
    pub fn new(id: u64) -> Self {
        Self {
            id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data: format!("Message number {id}"),
            random_value: rand::random::<f64>() * 100.0,
        }
    }

    /// パーティションルーティングに使うキー（"key-<id>"）を返す。
    pub fn key(&self) -> String {
        message_key(self.id)
    }

    /// JSON バイト列にシリアライズする。
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::SerializationError(e.to_string()))
    }

    /// JSON バイト列からデシリアライズする。
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(bytes).map_err(|e| MessagingError::DeserializationError(e.to_string()))
    }

    /// 指定トピック向けの EventEnvelope に変換する。
    pub fn to_envelope(&self, topic: impl Into<String>) -> Result<EventEnvelope, MessagingError> {
        Ok(EventEnvelope {
            topic: topic.into(),
            key: Some(self.key()),
            payload: self.to_bytes()?,
            headers: Vec::new(),
        }
        .with_header("content-type", "application/json"))
    }
}

/// ID からメッセージキーを導出する。
pub fn message_key(id: u64) -> String {
    format!("key-{id}")
}
