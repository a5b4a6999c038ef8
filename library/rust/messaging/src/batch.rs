//! バッチ単位のオフセット制御。
//!
//! - [`Batch`]: 1 トピックパーティション分のフェッチ結果
//! - [`BatchCursor`]: バッチ内で処理済みオフセットを単調に進める
//! - [`BatchScope`]: isRunning / isStale の協調的キャンセル
//! - [`CommitTracker`]: 時間・件数に応じた条件付きコミット

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::consumer::ConsumedMessage;
use crate::error::MessagingError;

/// Batch は 1 つのトピックパーティションに対するフェッチ結果。
#[derive(Debug, Clone)]
pub struct Batch {
    pub topic: String,
    pub partition: i32,
    /// フェッチ時点でブローカーが報告した最新オフセット
    pub high_watermark: i64,
    /// フェッチ時点の割り当て世代
    pub generation: u64,
    /// オフセット昇順のメッセージ
    pub messages: Vec<ConsumedMessage>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset)
    }

    /// このバッチ用のカーソルを生成する。
    pub fn cursor(&self) -> BatchCursor {
        BatchCursor::new(&self.topic, self.partition, self.high_watermark)
    }
}

/// BatchCursor はバッチ内で安全にコミットできる最大オフセットを保持する。
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCursor {
    pub topic: String,
    pub partition: i32,
    pub high_watermark: i64,
    resolved_offset: Option<i64>,
}

impl BatchCursor {
    pub fn new(topic: impl Into<String>, partition: i32, high_watermark: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            high_watermark,
            resolved_offset: None,
        }
    }

    /// 処理完了したメッセージのオフセットを確定する。後退は拒否する。
    pub fn resolve(&mut self, offset: i64) -> Result<(), MessagingError> {
        if let Some(resolved) = self.resolved_offset {
            if offset <= resolved {
                return Err(MessagingError::OffsetRegression {
                    topic: self.topic.clone(),
                    partition: self.partition,
                    offset,
                    resolved,
                });
            }
        }
        self.resolved_offset = Some(offset);
        Ok(())
    }

    pub fn resolved_offset(&self) -> Option<i64> {
        self.resolved_offset
    }
}

/// OffsetCommit はコミット対象のパーティションと確定済みオフセット。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommit {
    pub topic: String,
    pub partition: i32,
    /// 処理が完了した最大オフセット
    pub resolved_offset: i64,
}

impl OffsetCommit {
    /// ブローカーに記録する次の読み出し位置（Kafka の慣例で resolved + 1）。
    pub fn next_offset(&self) -> i64 {
        self.resolved_offset + 1
    }
}

/// AssignmentGeneration はリバランス開始ごとに進む世代カウンタ。
/// クライアントとバッチ処理で共有する。
#[derive(Debug, Clone, Default)]
pub struct AssignmentGeneration(Arc<AtomicU64>);

impl AssignmentGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// 世代を 1 進め、新しい世代を返す。
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// BatchScope はバッチ処理ルーチンに渡すキャンセルトークン。
/// メッセージごとに is_running / is_stale を確認し、どちらかが成立したら残りを破棄する。
#[derive(Debug, Clone)]
pub struct BatchScope {
    running: CancellationToken,
    generation: u64,
    current: AssignmentGeneration,
}

impl BatchScope {
    pub fn new(running: CancellationToken, generation: u64, current: AssignmentGeneration) -> Self {
        Self {
            running,
            generation,
            current,
        }
    }

    /// コンシューマーが停止指示を受けていないか。
    pub fn is_running(&self) -> bool {
        !self.running.is_cancelled()
    }

    /// このバッチの割り当てがリバランスで置き換えられたか。
    pub fn is_stale(&self) -> bool {
        self.current.current() != self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// CommitPolicy は commitOffsetsIfNecessary の判定条件。
/// interval と threshold の両方が None の場合は確定のたびにコミットする。
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPolicy {
    pub interval: Option<Duration>,
    pub threshold: Option<u64>,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_millis(5000)),
            threshold: None,
        }
    }
}

impl CommitPolicy {
    /// 毎回コミットするポリシー。
    pub fn always() -> Self {
        Self {
            interval: None,
            threshold: None,
        }
    }
}

/// CommitTracker はパーティションごとの未コミット状態を追跡する。
#[derive(Debug, Clone)]
pub struct CommitTracker {
    policy: CommitPolicy,
    generation: u64,
    resolved: Option<i64>,
    last_committed: Option<i64>,
    last_commit_at: Instant,
    uncommitted: u64,
}

impl CommitTracker {
    pub fn new(policy: CommitPolicy, generation: u64) -> Self {
        Self {
            policy,
            generation,
            resolved: None,
            last_committed: None,
            last_commit_at: Instant::now(),
            uncommitted: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 最後にコミットした確定オフセット。
    pub fn last_committed(&self) -> Option<i64> {
        self.last_committed
    }

    /// 確定済みオフセットを記録する。小さい値は無視する。
    pub fn record(&mut self, resolved: i64) {
        if self.resolved.map_or(true, |current| resolved > current) {
            self.resolved = Some(resolved);
            self.uncommitted += 1;
        }
    }

    /// 前回コミット以降に進んだ確定済みオフセット。
    pub fn pending(&self) -> Option<i64> {
        match (self.resolved, self.last_committed) {
            (Some(resolved), Some(committed)) if resolved <= committed => None,
            (resolved, _) => resolved,
        }
    }

    /// 時間または件数の条件を満たしたか。
    pub fn should_commit(&self, now: Instant) -> bool {
        if self.pending().is_none() {
            return false;
        }
        let (interval, threshold) = (self.policy.interval, self.policy.threshold);
        if interval.is_none() && threshold.is_none() {
            return true;
        }
        let interval_reached =
            interval.is_some_and(|i| now.saturating_duration_since(self.last_commit_at) >= i);
        let threshold_reached = threshold.is_some_and(|t| self.uncommitted >= t);
        interval_reached || threshold_reached
    }

    /// コミット成功を記録する。
    pub fn mark_committed(&mut self, resolved: i64, now: Instant) {
        self.last_committed = Some(self.last_committed.map_or(resolved, |c| c.max(resolved)));
        self.last_commit_at = now;
        self.uncommitted = 0;
    }

    /// 世代が変わった場合に未コミット状態を破棄する。破棄が発生したら true を返す。
    pub fn reset_if_generation_changed(&mut self, generation: u64) -> bool {
        if self.generation == generation {
            return false;
        }
        self.generation = generation;
        self.resolved = None;
        self.last_committed = None;
        self.uncommitted = 0;
        true
    }

    /// 未コミットの確定オフセットを破棄する（stale バッチ用）。
    pub fn discard_pending(&mut self) {
        self.resolved = self.last_committed;
        self.uncommitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: i64) -> ConsumedMessage {
        ConsumedMessage {
            topic: "test-topic".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: Vec::new(),
            timestamp_ms: None,
        }
    }

    #[test]
    fn test_batch_offsets() {
        let batch = Batch {
            topic: "test-topic".to_string(),
            partition: 0,
            high_watermark: 10,
            generation: 1,
            messages: vec![message(3), message(4), message(5)],
        };
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first_offset(), Some(3));
        assert_eq!(batch.last_offset(), Some(5));
        let cursor = batch.cursor();
        assert_eq!(cursor.high_watermark, 10);
        assert_eq!(cursor.resolved_offset(), None);
    }

    #[test]
    fn test_cursor_resolves_monotonically() {
        let mut cursor = BatchCursor::new("test-topic", 1, 100);
        cursor.resolve(10).unwrap();
        cursor.resolve(11).unwrap();
        assert_eq!(cursor.resolved_offset(), Some(11));

        let err = cursor.resolve(11).unwrap_err();
        assert!(matches!(err, MessagingError::OffsetRegression { resolved: 11, .. }));
        assert!(cursor.resolve(3).is_err());
        assert_eq!(cursor.resolved_offset(), Some(11));
    }

    #[test]
    fn test_generation_bump() {
        let generation = AssignmentGeneration::new();
        assert_eq!(generation.current(), 0);
        assert_eq!(generation.bump(), 1);
        let shared = generation.clone();
        shared.bump();
        assert_eq!(generation.current(), 2);
    }

    #[test]
    fn test_scope_running_and_stale() {
        let token = CancellationToken::new();
        let generation = AssignmentGeneration::new();
        generation.bump();
        let scope = BatchScope::new(token.clone(), generation.current(), generation.clone());

        assert!(scope.is_running());
        assert!(!scope.is_stale());

        generation.bump();
        assert!(scope.is_stale());

        token.cancel();
        assert!(!scope.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_interval_policy() {
        let mut tracker = CommitTracker::new(CommitPolicy::default(), 1);
        assert!(!tracker.should_commit(Instant::now()));

        tracker.record(0);
        assert!(!tracker.should_commit(Instant::now()));

        tokio::time::advance(Duration::from_millis(5000)).await;
        assert!(tracker.should_commit(Instant::now()));

        tracker.mark_committed(0, Instant::now());
        assert_eq!(tracker.pending(), None);
        assert!(!tracker.should_commit(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_threshold_policy() {
        let policy = CommitPolicy {
            interval: None,
            threshold: Some(3),
        };
        let mut tracker = CommitTracker::new(policy, 1);
        tracker.record(0);
        tracker.record(1);
        assert!(!tracker.should_commit(Instant::now()));
        tracker.record(2);
        assert!(tracker.should_commit(Instant::now()));
    }

    #[test]
    fn test_tracker_always_policy() {
        let mut tracker = CommitTracker::new(CommitPolicy::always(), 1);
        tracker.record(4);
        assert!(tracker.should_commit(Instant::now()));
    }

    #[test]
    fn test_tracker_ignores_lower_offsets() {
        let mut tracker = CommitTracker::new(CommitPolicy::always(), 1);
        tracker.record(5);
        tracker.record(3);
        assert_eq!(tracker.pending(), Some(5));
        tracker.mark_committed(5, Instant::now());
        tracker.record(5);
        assert_eq!(tracker.pending(), None);
    }

    #[test]
    fn test_tracker_generation_reset() {
        let mut tracker = CommitTracker::new(CommitPolicy::always(), 1);
        tracker.record(9);
        assert!(!tracker.reset_if_generation_changed(1));
        assert!(tracker.reset_if_generation_changed(2));
        assert_eq!(tracker.generation(), 2);
        assert_eq!(tracker.pending(), None);
    }

    #[test]
    fn test_tracker_discard_pending() {
        let mut tracker = CommitTracker::new(CommitPolicy::always(), 1);
        tracker.record(1);
        tracker.mark_committed(1, Instant::now());
        tracker.record(4);
        tracker.discard_pending();
        assert_eq!(tracker.pending(), None);
        assert_eq!(tracker.last_committed(), Some(1));
    }
}
