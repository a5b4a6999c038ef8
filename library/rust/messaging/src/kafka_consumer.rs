//! KafkaEventConsumer: rdkafka を使用した EventConsumer 実装。
//! feature = "kafka" で有効化される。
//!
//! リバランスは ConsumerContext のコールバックで検知し、割り当て世代を進めたうえで
//! GroupEvent としてブロードキャストする。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, RebalanceProtocol,
    StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::broadcast;

use crate::batch::{AssignmentGeneration, Batch, OffsetCommit};
use crate::config::MessagingConfig;
use crate::consumer::{ConsumedMessage, ConsumerConfig, EventConsumer};
use crate::error::MessagingError;
use crate::group::{GroupEvent, GroupMembership};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// 最初のメッセージ受信後、同じフェッチに追加のメッセージを集める待機時間
const FETCH_LINGER: Duration = Duration::from_millis(50);

/// GroupContext はリバランスとクライアントエラーを GroupEvent に変換する。
pub struct GroupContext {
    group_id: String,
    events: broadcast::Sender<GroupEvent>,
    generation: AssignmentGeneration,
    rebalance_started: Mutex<Option<Instant>>,
}

impl GroupContext {
    fn emit(&self, event: GroupEvent) {
        // 受信側がいない場合は捨てる
        let _ = self.events.send(event);
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::Fatal) => {
                tracing::error!(error = %error, reason, "回復不能なクライアントエラー");
                self.emit(GroupEvent::Crash {
                    error: format!("{error}: {reason}"),
                });
            }
            Some(RDKafkaErrorCode::AllBrokersDown) => {
                tracing::warn!(error = %error, reason, "すべてのブローカーとの接続が切れました");
                self.emit(GroupEvent::Disconnect);
            }
            _ => tracing::warn!(error = %error, reason, "Kafka クライアントエラー"),
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let generation = self.generation.bump();
        *self
            .rebalance_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let kind = match rebalance {
            Rebalance::Assign(_) => "assign",
            Rebalance::Revoke(_) => "revoke",
            Rebalance::Error(_) => "error",
        };
        tracing::debug!(generation, kind, "リバランスを開始します");
        self.emit(GroupEvent::Rebalancing {
            group_id: self.group_id.clone(),
            member_id: None,
        });
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let mut partitions: Vec<i32> =
                    tpl.elements().iter().map(|e| e.partition()).collect();
                partitions.sort_unstable();
                let duration_ms = self
                    .rebalance_started
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .map_or(0, |started| {
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
                    });
                let group_protocol = match base_consumer.rebalance_protocol() {
                    RebalanceProtocol::Cooperative => "cooperative",
                    RebalanceProtocol::Eager => "eager",
                    RebalanceProtocol::None => "none",
                };
                self.emit(GroupEvent::GroupJoin {
                    membership: GroupMembership {
                        group_id: self.group_id.clone(),
                        member_id: None,
                        leader_id: None,
                        is_leader: false,
                        group_protocol: group_protocol.to_string(),
                    },
                    partitions,
                    duration_ms,
                });
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                tracing::warn!(error = %e, "リバランスでエラーが発生しました");
            }
        }
    }
}

/// KafkaEventConsumer は rdkafka の StreamConsumer を使った実装。
pub struct KafkaEventConsumer {
    consumer: Arc<StreamConsumer<GroupContext>>,
    events: broadcast::Sender<GroupEvent>,
    generation: AssignmentGeneration,
    from_beginning: bool,
    max_batch_size: usize,
    max_wait: Duration,
    timeout: Duration,
    closed: AtomicBool,
}

impl KafkaEventConsumer {
    /// 接続設定とグループ設定から KafkaEventConsumer を生成する。
    pub fn new(
        messaging: &MessagingConfig,
        config: &ConsumerConfig,
        client_id: &str,
    ) -> Result<Self, MessagingError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let generation = AssignmentGeneration::new();
        let context = GroupContext {
            group_id: config.group_id.clone(),
            events: events.clone(),
            generation: generation.clone(),
            rebalance_started: Mutex::new(None),
        };

        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", messaging.brokers_string())
            .set("client.id", client_id)
            .set("group.id", &config.group_id)
            .set("security.protocol", &messaging.security_protocol)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", config.offset_reset())
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
            .set("fetch.wait.max.ms", config.max_wait_ms.to_string())
            .set(
                "reconnect.backoff.ms",
                messaging.retry.initial_retry_time_ms.to_string(),
            )
            .set(
                "reconnect.backoff.max.ms",
                messaging.retry.max_retry_time_ms.to_string(),
            )
            .create_with_context(context)
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            events,
            generation,
            from_beginning: config.from_beginning,
            max_batch_size: config.max_batch_size.max(1),
            max_wait: Duration::from_millis(config.max_wait_ms),
            timeout: Duration::from_millis(messaging.timeout_ms),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MessagingError::ConnectionError(
                "consumer is disconnected".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// 受信したメッセージのうちパーティションごとの最小オフセットへ読み取り位置を戻す。
    fn rewind(&self, messages: &[ConsumedMessage]) {
        let mut earliest: BTreeMap<(&str, i32), i64> = BTreeMap::new();
        for message in messages {
            earliest
                .entry((message.topic.as_str(), message.partition))
                .and_modify(|offset| *offset = (*offset).min(message.offset))
                .or_insert(message.offset);
        }
        for ((topic, partition), offset) in earliest {
            match self
                .consumer
                .seek(topic, partition, Offset::Offset(offset), self.timeout)
            {
                Ok(()) => tracing::debug!(topic, partition, offset, "読み取り位置を巻き戻しました"),
                // 割り当てを失ったパーティションは新しい持ち主がコミット済み位置から読む
                Err(e) => tracing::debug!(topic, partition, error = %e, "巻き戻しをスキップしました"),
            }
        }
    }

    async fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || consumer.fetch_watermarks(&topic, partition, timeout))
            .await
            .ok()?
            .ok()
            .map(|(_, high)| high)
    }
}

fn to_consumed(message: &BorrowedMessage<'_>) -> ConsumedMessage {
    ConsumedMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().unwrap_or_default().to_vec(),
        timestamp_ms: message.timestamp().to_millis(),
    }
}

fn consume_error(error: &KafkaError) -> MessagingError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::Fatal) => MessagingError::FatalClientError(error.to_string()),
        _ => MessagingError::ConsumeError(error.to_string()),
    }
}

#[async_trait]
impl EventConsumer for KafkaEventConsumer {
    async fn connect(&self) -> Result<(), MessagingError> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;
        self.closed.store(false, Ordering::SeqCst);
        let _ = self.events.send(GroupEvent::Connect);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), MessagingError> {
        self.ensure_open()?;
        if from_beginning != self.from_beginning {
            tracing::warn!(
                topic,
                from_beginning,
                "開始位置はクライアント生成時の auto.offset.reset に従います"
            );
        }
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))
    }

    async fn fetch(&self) -> Result<Vec<Batch>, MessagingError> {
        self.ensure_open()?;

        // リバランスのコールバックは recv() の中で実行されるため、世代は受信後に読む
        let first = match tokio::time::timeout(self.max_wait, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(Err(e)) => return Err(consume_error(&e)),
            Ok(Ok(message)) => to_consumed(&message),
        };
        let generation = self.generation.current();
        let mut messages = vec![first];
        while messages.len() < self.max_batch_size {
            match tokio::time::timeout(FETCH_LINGER, self.consumer.recv()).await {
                Ok(Ok(message)) => messages.push(to_consumed(&message)),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "フェッチ中に受信エラーが発生しました");
                    break;
                }
                Err(_) => break,
            }
        }
        if self.generation.current() != generation {
            // 集めている間にリバランスが起きた。巻き戻して次のフェッチで受け直す
            self.rewind(&messages);
            return Ok(Vec::new());
        }

        let mut by_partition: BTreeMap<(String, i32), Vec<ConsumedMessage>> = BTreeMap::new();
        for message in messages {
            by_partition
                .entry((message.topic.clone(), message.partition))
                .or_default()
                .push(message);
        }

        let mut batches = Vec::with_capacity(by_partition.len());
        for ((topic, partition), messages) in by_partition {
            let next = messages.last().map_or(0, |m| m.offset + 1);
            let high_watermark = self
                .high_watermark(&topic, partition)
                .await
                .unwrap_or(next);
            batches.push(Batch {
                topic,
                partition,
                high_watermark,
                generation,
                messages,
            });
        }
        Ok(batches)
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.consumer
            .seek(topic, partition, Offset::Offset(offset), self.timeout)
            .map_err(|e| MessagingError::ConsumeError(e.to_string()))
    }

    async fn commit(&self, offsets: &[OffsetCommit]) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let mut tpl = TopicPartitionList::new();
        for offset in offsets {
            tpl.add_partition_offset(
                &offset.topic,
                offset.partition,
                Offset::Offset(offset.next_offset()),
            )
            .map_err(|e| MessagingError::CommitError(e.to_string()))?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| MessagingError::CommitError(e.to_string()))
    }

    async fn heartbeat(&self) -> Result<(), MessagingError> {
        // librdkafka はバックグラウンドスレッドでハートビートを送る
        self.ensure_open()
            .map_err(|e| MessagingError::HeartbeatError(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.consumer.unsubscribe();
        let _ = self.events.send(GroupEvent::Disconnect);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    fn assignment_generation(&self) -> AssignmentGeneration {
        self.generation.clone()
    }
}
