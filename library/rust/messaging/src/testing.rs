//! InMemoryBroker: テスト用のインメモリブローカー。
//! feature = "testing" で有効化される。
//!
//! パーティション付きトピック、コンシューマーグループ（ラウンドロビン割り当て・世代管理）、
//! オフセットコミットを最小限に再現し、障害注入用の操作を提供する。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::batch::{AssignmentGeneration, Batch, OffsetCommit};
use crate::consumer::{ConsumedMessage, EventConsumer};
use crate::error::MessagingError;
use crate::event::EventEnvelope;
use crate::group::{GroupEvent, GroupMembership};
use crate::producer::EventProducer;

const GROUP_PROTOCOL: &str = "RoundRobinAssigner";
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    timestamp_ms: i64,
}

struct MemberState {
    events: broadcast::Sender<GroupEvent>,
    topic: String,
    from_beginning: bool,
    assignment: Vec<i32>,
    positions: HashMap<i32, i64>,
}

struct GroupState {
    generation: AssignmentGeneration,
    members: BTreeMap<String, MemberState>,
    committed: HashMap<(String, i32), i64>,
    commit_history: Vec<OffsetCommit>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            generation: AssignmentGeneration::new(),
            members: BTreeMap::new(),
            committed: HashMap::new(),
            commit_history: Vec::new(),
        }
    }
}

struct BrokerState {
    reachable: bool,
    default_partitions: i32,
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupState>,
    pending_publish_failures: u32,
    round_robin: u32,
}

impl BrokerState {
    fn topic_mut(&mut self, topic: &str) -> &mut Vec<Vec<StoredRecord>> {
        let partitions = self.default_partitions.max(1);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); usize::try_from(partitions).unwrap_or(1)])
    }

    fn partition_count(&mut self, topic: &str) -> i32 {
        i32::try_from(self.topic_mut(topic).len()).unwrap_or(i32::MAX)
    }

    fn log_end(&mut self, topic: &str, partition: i32) -> i64 {
        self.topic_mut(topic)
            .get(partition_index(partition))
            .map_or(0, |log| i64::try_from(log.len()).unwrap_or(i64::MAX))
    }

    fn group_mut(&mut self, group_id: &str) -> &mut GroupState {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(GroupState::new)
    }

    /// グループのリバランスを実行する。世代を進め、全メンバーに割り当てを配り直す。
    fn rebalance(&mut self, group_id: &str) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        group.generation.bump();

        let member_ids: Vec<String> = group.members.keys().cloned().collect();
        let topics: Vec<(String, bool)> = group
            .members
            .values()
            .map(|m| (m.topic.clone(), m.from_beginning))
            .collect();
        for member_id in &member_ids {
            if let Some(member) = group.members.get(member_id) {
                let _ = member.events.send(GroupEvent::Rebalancing {
                    group_id: group_id.to_string(),
                    member_id: Some(member_id.clone()),
                });
            }
        }
        if member_ids.is_empty() {
            return;
        }

        // メンバーごとの新しい割り当てと開始位置を計算する
        let mut plans: Vec<(Vec<i32>, HashMap<i32, i64>)> = Vec::with_capacity(member_ids.len());
        for (index, (topic, from_beginning)) in topics.iter().enumerate() {
            let partitions = self.partition_count(topic);
            let assignment: Vec<i32> = (0..partitions)
                .filter(|p| partition_index(*p) % member_ids.len() == index)
                .collect();
            let mut positions = HashMap::new();
            for &partition in &assignment {
                let committed = self
                    .groups
                    .get(group_id)
                    .and_then(|g| g.committed.get(&(topic.clone(), partition)).copied());
                let start = match committed {
                    Some(offset) => offset,
                    None if *from_beginning => 0,
                    None => self.log_end(topic, partition),
                };
                positions.insert(partition, start);
            }
            plans.push((assignment, positions));
        }

        let leader_id = member_ids.first().cloned();
        let group = self.group_mut(group_id);
        for (member_id, (assignment, positions)) in member_ids.iter().zip(plans) {
            if let Some(member) = group.members.get_mut(member_id) {
                member.assignment.clone_from(&assignment);
                member.positions = positions;
                let _ = member.events.send(GroupEvent::GroupJoin {
                    membership: GroupMembership {
                        group_id: group_id.to_string(),
                        member_id: Some(member_id.clone()),
                        leader_id: leader_id.clone(),
                        is_leader: leader_id.as_deref() == Some(member_id.as_str()),
                        group_protocol: GROUP_PROTOCOL.to_string(),
                    },
                    partitions: assignment,
                    duration_ms: 0,
                });
            }
        }
    }
}

fn partition_index(partition: i32) -> usize {
    usize::try_from(partition).unwrap_or(usize::MAX)
}

/// FNV-1a によるキーのハッシュ。同じキーは常に同じパーティションへ送られる。
fn partition_for_key(key: &[u8], partitions: i32) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let partitions = u32::try_from(partitions.max(1)).unwrap_or(1);
    i32::try_from(hash % partitions).unwrap_or(0)
}

/// InMemoryBroker はプロセス内で完結するブローカー。クローンは同じ状態を共有する。
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// 自動作成されるトピックのパーティション数を指定して生成する。
    pub fn new(default_partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                default_partitions,
                topics: HashMap::new(),
                groups: HashMap::new(),
                pending_publish_failures: 0,
                round_robin: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// パーティション数を指定してトピックを作成する。既存の場合は何もしない。
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.lock();
        state.topics.entry(topic.to_string()).or_insert_with(|| {
            vec![Vec::new(); usize::try_from(partitions.max(1)).unwrap_or(1)]
        });
    }

    /// ブローカーへの到達可否を切り替える。
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    fn is_reachable(&self) -> bool {
        self.lock().reachable
    }

    /// 次の n 回の publish を失敗させる。
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().pending_publish_failures = n;
    }

    /// キーのハッシュでパーティションを決めて追記する。キーが無い場合はラウンドロビン。
    pub fn append(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> (i32, i64) {
        let mut state = self.lock();
        let partitions = state.partition_count(topic);
        let partition = match key {
            Some(k) => partition_for_key(k, partitions),
            None => {
                state.round_robin = state.round_robin.wrapping_add(1);
                i32::try_from(state.round_robin % u32::try_from(partitions).unwrap_or(1))
                    .unwrap_or(0)
            }
        };
        drop(state);
        let offset = self.append_to(topic, partition, key, payload);
        (partition, offset)
    }

    /// パーティションを指定して追記し、付与したオフセットを返す。
    pub fn append_to(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> i64 {
        let mut state = self.lock();
        let log = state.topic_mut(topic);
        let index = partition_index(partition).min(log.len().saturating_sub(1));
        let records = &mut log[index];
        records.push(StoredRecord {
            key: key.map(<[u8]>::to_vec),
            payload: payload.to_vec(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
        i64::try_from(records.len()).unwrap_or(i64::MAX) - 1
    }

    /// パーティションに保存されたメッセージをオフセット順に返す。
    pub fn records(&self, topic: &str, partition: i32) -> Vec<ConsumedMessage> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .and_then(|log| log.get(partition_index(partition)))
            .map(|records| {
                records
                    .iter()
                    .enumerate()
                    .map(|(offset, r)| to_consumed(topic, partition, offset, r))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// グループがコミットした次の読み出し位置を返す。
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.lock();
        state
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }

    /// グループのコミット履歴を古い順に返す。
    pub fn commit_history(&self, group_id: &str) -> Vec<OffsetCommit> {
        let state = self.lock();
        state
            .groups
            .get(group_id)
            .map(|g| g.commit_history.clone())
            .unwrap_or_default()
    }

    /// グループの強制リバランスを起こす。
    pub fn rebalance(&self, group_id: &str) {
        self.lock().rebalance(group_id);
    }

    /// グループの現在の世代。
    pub fn generation(&self, group_id: &str) -> u64 {
        self.lock().group_mut(group_id).generation.current()
    }

    pub fn member_count(&self, group_id: &str) -> usize {
        self.lock()
            .groups
            .get(group_id)
            .map_or(0, |g| g.members.len())
    }

    /// プロデューサークライアントを生成する。
    pub fn producer(&self, client_id: &str) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
            client_id: client_id.to_string(),
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            fail_disconnect: AtomicBool::new(false),
        }
    }

    /// グループに参加するコンシューマークライアントを生成する。
    pub fn consumer(&self, group_id: &str, client_id: &str) -> InMemoryConsumer {
        let generation = self.lock().group_mut(group_id).generation.clone();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        InMemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            member_id: format!("{client_id}-{}", uuid::Uuid::new_v4()),
            events,
            generation,
            connected: AtomicBool::new(false),
            max_batch_size: 500,
            poll_interval: Duration::from_millis(10),
            heartbeats: AtomicU64::new(0),
            disconnect_calls: AtomicU32::new(0),
            fail_disconnect: AtomicBool::new(false),
        }
    }
}

fn to_consumed(topic: &str, partition: i32, offset: usize, record: &StoredRecord) -> ConsumedMessage {
    ConsumedMessage {
        topic: topic.to_string(),
        partition,
        offset: i64::try_from(offset).unwrap_or(i64::MAX),
        key: record.key.clone(),
        payload: record.payload.clone(),
        timestamp_ms: Some(record.timestamp_ms),
    }
}

/// InMemoryProducer は InMemoryBroker に発行する EventProducer 実装。
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    client_id: String,
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    disconnect_calls: AtomicU32,
    fail_disconnect: AtomicBool,
}

impl InMemoryProducer {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// disconnect を失敗させる。
    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventProducer for InMemoryProducer {
    async fn connect(&self) -> Result<(), MessagingError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.broker.is_reachable() {
            return Err(MessagingError::ConnectionError(
                "broker unreachable".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, envelope: EventEnvelope) -> Result<(), MessagingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MessagingError::PublishError(
                "producer is not connected".to_string(),
            ));
        }
        {
            let mut state = self.broker.lock();
            if state.pending_publish_failures > 0 {
                state.pending_publish_failures -= 1;
                return Err(MessagingError::PublishError(
                    "injected publish failure".to_string(),
                ));
            }
        }
        self.broker.append(
            &envelope.topic,
            envelope.key.as_deref().map(str::as_bytes),
            &envelope.payload,
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(MessagingError::ConnectionError(
                "injected disconnect failure".to_string(),
            ));
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// InMemoryConsumer は InMemoryBroker のグループに参加する EventConsumer 実装。
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group_id: String,
    member_id: String,
    events: broadcast::Sender<GroupEvent>,
    generation: AssignmentGeneration,
    connected: AtomicBool,
    max_batch_size: usize,
    poll_interval: Duration,
    heartbeats: AtomicU64,
    disconnect_calls: AtomicU32,
    fail_disconnect: AtomicBool,
}

impl InMemoryConsumer {
    /// 1 バッチあたりの最大メッセージ数を設定する。
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// 現在の割り当てを返す。
    pub fn assignment(&self) -> Vec<i32> {
        let state = self.broker.lock();
        state
            .groups
            .get(&self.group_id)
            .and_then(|g| g.members.get(&self.member_id))
            .map(|m| m.assignment.clone())
            .unwrap_or_default()
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// disconnect を失敗させる。
    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// 回復不能なクライアントエラーを発生させる。
    pub fn inject_crash(&self, error: &str) {
        let _ = self.events.send(GroupEvent::Crash {
            error: error.to_string(),
        });
    }

    fn ensure_connected(&self) -> Result<(), MessagingError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MessagingError::ConnectionError(
                "consumer is not connected".to_string(),
            ))
        }
    }
}

#[async_trait]
impl EventConsumer for InMemoryConsumer {
    async fn connect(&self) -> Result<(), MessagingError> {
        if !self.broker.is_reachable() {
            return Err(MessagingError::ConnectionError(
                "broker unreachable".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(GroupEvent::Connect);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let mut state = self.broker.lock();
        state.topic_mut(topic);
        state.group_mut(&self.group_id).members.insert(
            self.member_id.clone(),
            MemberState {
                events: self.events.clone(),
                topic: topic.to_string(),
                from_beginning,
                assignment: Vec::new(),
                positions: HashMap::new(),
            },
        );
        state.rebalance(&self.group_id);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Batch>, MessagingError> {
        self.ensure_connected()?;
        let batches = {
            let mut state = self.broker.lock();
            let generation = self.generation.current();
            let Some(member) = state
                .groups
                .get(&self.group_id)
                .and_then(|g| g.members.get(&self.member_id))
            else {
                return Ok(Vec::new());
            };
            let topic = member.topic.clone();
            let assignment = member.assignment.clone();
            let positions = member.positions.clone();

            let mut batches = Vec::new();
            let mut advanced = Vec::new();
            let log = state.topic_mut(&topic).clone();
            for partition in assignment {
                let Some(records) = log.get(partition_index(partition)) else {
                    continue;
                };
                let start = positions.get(&partition).copied().unwrap_or(0);
                let start_index = usize::try_from(start.max(0)).unwrap_or(usize::MAX);
                let messages: Vec<ConsumedMessage> = records
                    .iter()
                    .enumerate()
                    .skip(start_index)
                    .take(self.max_batch_size)
                    .map(|(offset, r)| to_consumed(&topic, partition, offset, r))
                    .collect();
                if let Some(last) = messages.last() {
                    advanced.push((partition, last.offset + 1));
                    batches.push(Batch {
                        topic: topic.clone(),
                        partition,
                        high_watermark: i64::try_from(records.len()).unwrap_or(i64::MAX),
                        generation,
                        messages,
                    });
                }
            }
            if let Some(member) = state
                .groups
                .get_mut(&self.group_id)
                .and_then(|g| g.members.get_mut(&self.member_id))
            {
                for (partition, next) in advanced {
                    member.positions.insert(partition, next);
                }
            }
            batches
        };
        if batches.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(batches)
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let mut state = self.broker.lock();
        let member = state
            .groups
            .get_mut(&self.group_id)
            .and_then(|g| g.members.get_mut(&self.member_id))
            .filter(|m| m.topic == topic && m.assignment.contains(&partition))
            .ok_or_else(|| {
                MessagingError::ConsumeError(format!(
                    "partition {topic}[{partition}] is not assigned"
                ))
            })?;
        member.positions.insert(partition, offset);
        Ok(())
    }

    async fn commit(&self, offsets: &[OffsetCommit]) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let mut state = self.broker.lock();
        let group = state.group_mut(&self.group_id);
        let member = group.members.get(&self.member_id).ok_or_else(|| {
            MessagingError::CommitError("member is not part of the group".to_string())
        })?;
        if let Some(foreign) = offsets
            .iter()
            .find(|o| o.topic != member.topic || !member.assignment.contains(&o.partition))
        {
            return Err(MessagingError::CommitError(format!(
                "partition {}[{}] is not assigned to {}",
                foreign.topic, foreign.partition, self.member_id
            )));
        }
        for offset in offsets {
            group
                .committed
                .insert((offset.topic.clone(), offset.partition), offset.next_offset());
            group.commit_history.push(offset.clone());
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), MessagingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MessagingError::HeartbeatError(
                "consumer is not connected".to_string(),
            ));
        }
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(MessagingError::ConnectionError(
                "injected disconnect failure".to_string(),
            ));
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut state = self.broker.lock();
            let removed = state
                .groups
                .get_mut(&self.group_id)
                .and_then(|g| g.members.remove(&self.member_id))
                .is_some();
            if removed {
                state.rebalance(&self.group_id);
            }
            drop(state);
            let _ = self.events.send(GroupEvent::Disconnect);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    fn assignment_generation(&self) -> AssignmentGeneration {
        self.generation.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SampleMessage;

    #[test]
    fn test_partition_for_key_is_deterministic() {
        let p1 = partition_for_key(b"key-1", 3);
        let p2 = partition_for_key(b"key-1", 3);
        assert_eq!(p1, p2);
        assert!((0..3).contains(&p1));
        assert_eq!(partition_for_key(b"anything", 1), 0);
    }

    #[tokio::test]
    async fn test_producer_requires_connect() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer("my-producer");
        let envelope = SampleMessage::new(0).to_envelope("test-topic").unwrap();
        assert!(producer.publish(envelope.clone()).await.is_err());

        producer.connect().await.unwrap();
        producer.publish(envelope).await.unwrap();
        assert_eq!(broker.records("test-topic", 0).len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connect() {
        let broker = InMemoryBroker::new(1);
        broker.set_reachable(false);
        let producer = broker.producer("my-producer");
        let err = producer.connect().await.unwrap_err();
        assert!(matches!(err, MessagingError::ConnectionError(_)));
        assert_eq!(producer.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer("my-producer");
        producer.connect().await.unwrap();
        broker.fail_next_publishes(1);

        let envelope = SampleMessage::new(0).to_envelope("test-topic").unwrap();
        assert!(producer.publish(envelope.clone()).await.is_err());
        assert!(producer.publish(envelope).await.is_ok());
        assert_eq!(broker.records("test-topic", 0).len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_assigns_partitions_round_robin() {
        let broker = InMemoryBroker::new(3);
        let first = broker.consumer("test-group", "consumer-1");
        let second = broker.consumer("test-group", "consumer-2");
        first.connect().await.unwrap();
        second.connect().await.unwrap();
        first.subscribe("test-topic", true).await.unwrap();
        assert_eq!(first.assignment(), vec![0, 1, 2]);

        second.subscribe("test-topic", true).await.unwrap();
        let mut all: Vec<i32> = first.assignment();
        all.extend(second.assignment());
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2]);
        assert_eq!(broker.member_count("test-group"), 2);
        assert_eq!(broker.generation("test-group"), 2);
    }

    #[tokio::test]
    async fn test_group_events_on_subscribe() {
        let broker = InMemoryBroker::new(1);
        let consumer = broker.consumer("test-group", "consumer-1");
        let mut events = consumer.events();
        consumer.connect().await.unwrap();
        consumer.subscribe("test-topic", true).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), GroupEvent::Connect);
        assert!(matches!(events.recv().await.unwrap(), GroupEvent::Rebalancing { .. }));
        match events.recv().await.unwrap() {
            GroupEvent::GroupJoin {
                membership,
                partitions,
                ..
            } => {
                assert!(membership.is_leader);
                assert_eq!(membership.member_id.as_deref(), Some(consumer.member_id()));
                assert_eq!(membership.group_protocol, "RoundRobinAssigner");
                assert_eq!(partitions, vec![0]);
            }
            other => panic!("GroupJoin が期待される: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_from_beginning_then_resume_from_commit() {
        let broker = InMemoryBroker::new(1);
        for i in 0..3 {
            broker.append_to("test-topic", 0, None, format!("m{i}").as_bytes());
        }
        let consumer = broker.consumer("test-group", "consumer-1");
        consumer.connect().await.unwrap();
        consumer.subscribe("test-topic", true).await.unwrap();

        let batches = consumer.fetch().await.unwrap();
        assert_eq!(batches.len(), 1);
        let offsets: Vec<i64> = batches[0].messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(batches[0].high_watermark, 3);

        consumer
            .commit(&[OffsetCommit {
                topic: "test-topic".to_string(),
                partition: 0,
                resolved_offset: 1,
            }])
            .await
            .unwrap();
        assert_eq!(broker.committed_offset("test-group", "test-topic", 0), Some(2));

        // リバランス後はコミット済み位置から再配信される
        broker.rebalance("test-group");
        let batches = consumer.fetch().await.unwrap();
        let offsets: Vec<i64> = batches[0].messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![2]);
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let broker = InMemoryBroker::new(1);
        broker.append_to("test-topic", 0, None, b"old");
        let consumer = broker.consumer("fresh-group", "consumer-1");
        consumer.connect().await.unwrap();
        consumer.subscribe("test-topic", false).await.unwrap();
        assert!(consumer.fetch().await.unwrap().is_empty());

        broker.append_to("test-topic", 0, None, b"new");
        let batches = consumer.fetch().await.unwrap();
        assert_eq!(batches[0].messages[0].payload, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_seek_rewinds_position() {
        let broker = InMemoryBroker::new(1);
        for i in 0..3 {
            broker.append_to("test-topic", 0, None, format!("m{i}").as_bytes());
        }
        let consumer = broker.consumer("test-group", "consumer-1").with_max_batch_size(2);
        consumer.connect().await.unwrap();
        consumer.subscribe("test-topic", true).await.unwrap();

        let first = consumer.fetch().await.unwrap();
        assert_eq!(first[0].last_offset(), Some(1));
        consumer.seek("test-topic", 0, 1).await.unwrap();
        let again = consumer.fetch().await.unwrap();
        assert_eq!(again[0].first_offset(), Some(1));
        assert!(consumer.seek("test-topic", 5, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_rejects_unassigned_partition() {
        let broker = InMemoryBroker::new(2);
        let first = broker.consumer("test-group", "a");
        let second = broker.consumer("test-group", "b");
        for c in [&first, &second] {
            c.connect().await.unwrap();
            c.subscribe("test-topic", true).await.unwrap();
        }
        let foreign = second.assignment()[0];
        let result = first
            .commit(&[OffsetCommit {
                topic: "test-topic".to_string(),
                partition: foreign,
                resolved_offset: 0,
            }])
            .await;
        assert!(matches!(result, Err(MessagingError::CommitError(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_leaves_group() {
        let broker = InMemoryBroker::new(1);
        let consumer = broker.consumer("test-group", "consumer-1");
        consumer.connect().await.unwrap();
        consumer.subscribe("test-topic", true).await.unwrap();

        consumer.disconnect().await.unwrap();
        consumer.disconnect().await.unwrap();
        assert_eq!(consumer.disconnect_calls(), 2);
        assert_eq!(broker.member_count("test-group"), 0);
        assert!(consumer.fetch().await.is_err());
    }
}
