use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::batch::{AssignmentGeneration, Batch, CommitPolicy, OffsetCommit};
use crate::error::MessagingError;
use crate::message::SampleMessage;

/// ConsumerConfig はコンシューマーグループの設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// コンシューマーグループ ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// サブスクライブするトピック
    #[serde(default = "default_topic")]
    pub topic: String,
    /// 新規グループの場合に最古のオフセットから読むか
    #[serde(default = "default_from_beginning")]
    pub from_beginning: bool,
    /// セッションタイムアウト（ミリ秒）
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// ハートビート間隔（ミリ秒）
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// 同時に処理するパーティション数
    #[serde(default = "default_partitions_consumed_concurrently")]
    pub partitions_consumed_concurrently: usize,
    /// 条件付きコミットの時間条件（ミリ秒）。null で無効
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: Option<u64>,
    /// 条件付きコミットの件数条件。null で無効
    #[serde(default)]
    pub auto_commit_threshold: Option<u64>,
    /// 1 バッチあたりの最大メッセージ数
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// フェッチの最大待機時間（ミリ秒）
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// 同一オフセットのハンドラ失敗を再配信する上限回数
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_group_id() -> String {
    "test-group".to_string()
}

fn default_topic() -> String {
    "test-topic".to_string()
}

fn default_from_beginning() -> bool {
    true
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_partitions_consumed_concurrently() -> usize {
    3
}

#[allow(clippy::unnecessary_wraps)]
fn default_auto_commit_interval_ms() -> Option<u64> {
    Some(5000)
}

fn default_max_batch_size() -> usize {
    500
}

fn default_max_wait_ms() -> u64 {
    5000
}

fn default_max_redeliveries() -> u32 {
    3
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            topic: default_topic(),
            from_beginning: default_from_beginning(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            partitions_consumed_concurrently: default_partitions_consumed_concurrently(),
            auto_commit_interval_ms: default_auto_commit_interval_ms(),
            auto_commit_threshold: None,
            max_batch_size: default_max_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

impl ConsumerConfig {
    /// 条件付きコミットのポリシーを返す。
    pub fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            interval: self.auto_commit_interval_ms.map(Duration::from_millis),
            threshold: self.auto_commit_threshold,
        }
    }

    /// 同時処理数（最低 1）。
    pub fn concurrency(&self) -> usize {
        self.partitions_consumed_concurrently.max(1)
    }

    /// auto.offset.reset に渡す値。
    pub fn offset_reset(&self) -> &'static str {
        if self.from_beginning {
            "earliest"
        } else {
            "latest"
        }
    }
}

/// ConsumedMessage はブローカーから受信したメッセージを表す。
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    /// トピック名
    pub topic: String,
    /// パーティション番号
    pub partition: i32,
    /// オフセット
    pub offset: i64,
    /// メッセージキー
    pub key: Option<Vec<u8>>,
    /// メッセージペイロード
    pub payload: Vec<u8>,
    /// ブローカーが付与したタイムスタンプ（ミリ秒）
    pub timestamp_ms: Option<i64>,
}

impl ConsumedMessage {
    /// ペイロードを SampleMessage として解釈する。
    pub fn decode(&self) -> Result<SampleMessage, MessagingError> {
        SampleMessage::from_bytes(&self.payload)
    }

    /// キーを UTF-8 文字列として返す（不正なバイト列は置換する）。
    pub fn key_str(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

/// EventConsumer はコンシューマーグループに参加するブローカークライアントのインターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// ブローカーとのセッションを確立する。
    async fn connect(&self) -> Result<(), MessagingError>;

    /// トピックを購読する。from_beginning は新規グループの開始位置を決める。
    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), MessagingError>;

    /// 次のバッチ群を取得する。各バッチは 1 パーティション分で、パーティションの重複はない。
    async fn fetch(&self) -> Result<Vec<Batch>, MessagingError>;

    /// パーティションの読み出し位置を変更する（再配信用）。
    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<(), MessagingError>;

    /// 確定済みオフセットをコミットする。
    async fn commit(&self, offsets: &[OffsetCommit]) -> Result<(), MessagingError>;

    /// セッション維持のためのハートビートを送る。
    async fn heartbeat(&self) -> Result<(), MessagingError>;

    /// セッションを切断する。切断済みの場合も成功を返す。
    async fn disconnect(&self) -> Result<(), MessagingError>;

    /// グループイベントの受信側を返す。
    fn events(&self) -> broadcast::Receiver<crate::group::GroupEvent>;

    /// 割り当て世代のハンドルを返す。
    fn assignment_generation(&self) -> AssignmentGeneration;
}
