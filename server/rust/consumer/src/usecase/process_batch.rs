use std::sync::{Arc, Mutex, PoisonError};

use pubsub_messaging::{
    AssignedPartitions, Batch, BatchCursor, BatchScope, CommitPolicy, CommitTracker,
    EventConsumer, OffsetCommit,
};
use pubsub_telemetry::Metrics;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapter::handler::MessageHandler;

/// PartitionState はパーティションごとにバッチをまたいで保持する状態。
#[derive(Debug)]
pub struct PartitionState {
    pub tracker: CommitTracker,
    /// 直近で失敗したオフセットと失敗回数
    failures: Option<(i64, u32)>,
    /// 巻き戻しに失敗したオフセット。再配信されるまで以降のオフセットを確定しない
    rewind: Option<i64>,
}

impl PartitionState {
    pub fn new(policy: CommitPolicy, generation: u64) -> Self {
        Self {
            tracker: CommitTracker::new(policy, generation),
            failures: None,
            rewind: None,
        }
    }

    fn record_failure(&mut self, offset: i64) -> u32 {
        let count = match self.failures {
            Some((failed, count)) if failed == offset => count + 1,
            _ => 1,
        };
        self.failures = Some((offset, count));
        count
    }

    fn clear_failure(&mut self, offset: i64) {
        if self.failures.is_some_and(|(failed, _)| failed == offset) {
            self.failures = None;
        }
    }
}

/// BatchReport は 1 バッチの処理結果。
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    /// ハンドラが成功したメッセージ数
    pub handled: usize,
    /// デコードできずスキップしたメッセージ数
    pub malformed: usize,
    /// 再配信上限を超えて破棄したメッセージ数
    pub dropped: usize,
    /// このバッチで確定した最大オフセット
    pub resolved: Option<i64>,
    /// このバッチの処理後にコミットした確定オフセット
    pub committed: Option<i64>,
    /// ハンドラが失敗し、再配信のため巻き戻したオフセット
    pub rewound_to: Option<i64>,
    /// リバランスで stale になり中断した
    pub stale: bool,
    /// 停止指示で中断した
    pub interrupted: bool,
}

/// ProcessBatchUseCase は 1 パーティション分のバッチをオフセット順に処理する。
pub struct ProcessBatchUseCase {
    consumer: Arc<dyn EventConsumer>,
    handler: Arc<dyn MessageHandler>,
    assigned: Arc<Mutex<AssignedPartitions>>,
    metrics: Arc<Metrics>,
    group_id: String,
    max_redeliveries: u32,
}

impl ProcessBatchUseCase {
    pub fn new(
        consumer: Arc<dyn EventConsumer>,
        handler: Arc<dyn MessageHandler>,
        assigned: Arc<Mutex<AssignedPartitions>>,
        metrics: Arc<Metrics>,
        group_id: impl Into<String>,
        max_redeliveries: u32,
    ) -> Self {
        Self {
            consumer,
            handler,
            assigned,
            metrics,
            group_id: group_id.into(),
            max_redeliveries,
        }
    }

    pub async fn execute(
        &self,
        batch: &Batch,
        scope: &BatchScope,
        state: &mut PartitionState,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        if state.tracker.reset_if_generation_changed(batch.generation) {
            state.failures = None;
            state.rewind = None;
        }
        self.observe_assignment(batch);

        if let Some(target) = state.rewind {
            if batch.first_offset().is_some_and(|first| first <= target) {
                state.rewind = None;
            } else {
                // 失敗したメッセージより先を確定するとコミットがそれを追い越してしまう
                self.retry_rewind(batch, state, &mut report, target).await;
                return report;
            }
        }

        let mut cursor = batch.cursor();
        for message in &batch.messages {
            if !scope.is_running() {
                report.interrupted = true;
                break;
            }
            if scope.is_stale() {
                report.stale = true;
                break;
            }

            let sample = match message.decode() {
                Ok(sample) => sample,
                Err(e) => {
                    // 壊れたバイト列は再配信しても直らないため確定して読み飛ばす
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "メッセージをデコードできませんでした"
                    );
                    self.metrics.record_kafka_message_malformed(&message.topic);
                    report.malformed += 1;
                    if !resolve_offset(&mut cursor, state, &mut report, message.offset) {
                        break;
                    }
                    continue;
                }
            };

            match self.handler.handle(&sample, message).await {
                Ok(()) => {
                    state.clear_failure(message.offset);
                    self.metrics
                        .record_kafka_message_consumed(&message.topic, &self.group_id);
                    report.handled += 1;
                    if !resolve_offset(&mut cursor, state, &mut report, message.offset) {
                        break;
                    }
                    if let Err(e) = self.consumer.heartbeat().await {
                        warn!(error = %e, "ハートビートに失敗しました");
                    }
                }
                Err(e) => {
                    let failures = state.record_failure(message.offset);
                    if failures > self.max_redeliveries {
                        error!(
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            id = sample.id,
                            failures,
                            error = %e,
                            "再配信の上限に達したためメッセージを破棄します"
                        );
                        state.failures = None;
                        report.dropped += 1;
                        if !resolve_offset(&mut cursor, state, &mut report, message.offset) {
                            break;
                        }
                        continue;
                    }
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        id = sample.id,
                        failures,
                        error = %e,
                        "メッセージの処理に失敗しました。再配信します"
                    );
                    match self
                        .consumer
                        .seek(&message.topic, message.partition, message.offset)
                        .await
                    {
                        Ok(()) => report.rewound_to = Some(message.offset),
                        Err(seek_err) => {
                            warn!(
                                topic = %message.topic,
                                partition = message.partition,
                                offset = message.offset,
                                error = %seek_err,
                                "再配信のための巻き戻しに失敗しました"
                            );
                            state.rewind = Some(message.offset);
                        }
                    }
                    break;
                }
            }
        }

        if report.stale || scope.is_stale() {
            report.stale = true;
            state.tracker.discard_pending();
            info!(
                topic = %batch.topic,
                partition = batch.partition,
                generation = batch.generation,
                "リバランスにより stale になったバッチの確定オフセットを破棄しました"
            );
            self.rewind_stale(batch, state, &mut report).await;
            return report;
        }

        report.committed = self
            .commit_if_necessary(&batch.topic, batch.partition, state, false)
            .await;
        report
    }

    /// stale になったバッチの未コミット分を読み直せるよう、読み取り位置を戻す。
    /// 割り当てを失ったパーティションの巻き戻しは失敗するが、新しい持ち主がコミット済み位置から読む。
    async fn rewind_stale(&self, batch: &Batch, state: &PartitionState, report: &mut BatchReport) {
        let Some(first) = batch.first_offset() else {
            return;
        };
        let target = state
            .tracker
            .last_committed()
            .map_or(first, |committed| (committed + 1).min(first));
        match self.consumer.seek(&batch.topic, batch.partition, target).await {
            Ok(()) => report.rewound_to = Some(target),
            Err(e) => debug!(
                topic = %batch.topic,
                partition = batch.partition,
                offset = target,
                error = %e,
                "stale バッチの巻き戻しをスキップしました"
            ),
        }
    }

    async fn retry_rewind(
        &self,
        batch: &Batch,
        state: &mut PartitionState,
        report: &mut BatchReport,
        target: i64,
    ) {
        match self.consumer.seek(&batch.topic, batch.partition, target).await {
            Ok(()) => {
                info!(
                    topic = %batch.topic,
                    partition = batch.partition,
                    offset = target,
                    "失敗したメッセージの位置へ巻き戻しました"
                );
                state.rewind = None;
                report.rewound_to = Some(target);
            }
            Err(e) => warn!(
                topic = %batch.topic,
                partition = batch.partition,
                offset = target,
                error = %e,
                "巻き戻しに再び失敗しました。バッチを処理せずに読み飛ばします"
            ),
        }
    }

    /// 現在の世代で初めて見たパーティションであれば割り当てをログに出す。
    fn observe_assignment(&self, batch: &Batch) {
        let newly_assigned = self
            .assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(batch.partition, batch.generation);
        if let Some(partitions) = newly_assigned {
            info!(
                topic = %batch.topic,
                partition = batch.partition,
                assigned = ?partitions,
                high_watermark = batch.high_watermark,
                messages = batch.len(),
                "PARTITION ASSIGNED"
            );
        }
    }

    /// 条件を満たしていれば確定済みオフセットをコミットする。force の場合は条件を無視する。
    pub async fn commit_if_necessary(
        &self,
        topic: &str,
        partition: i32,
        state: &mut PartitionState,
        force: bool,
    ) -> Option<i64> {
        let resolved = state.tracker.pending()?;
        let now = Instant::now();
        if !force && !state.tracker.should_commit(now) {
            return None;
        }
        let commit = OffsetCommit {
            topic: topic.to_string(),
            partition,
            resolved_offset: resolved,
        };
        match self.consumer.commit(std::slice::from_ref(&commit)).await {
            Ok(()) => {
                state.tracker.mark_committed(resolved, now);
                self.metrics.record_kafka_offset_commit(topic, partition);
                debug!(
                    topic,
                    partition,
                    resolved_offset = resolved,
                    next_offset = commit.next_offset(),
                    "オフセットをコミットしました"
                );
                Some(resolved)
            }
            Err(e) => {
                warn!(topic, partition, error = %e, "オフセットのコミットに失敗しました");
                None
            }
        }
    }
}

/// 処理済みのオフセットをカーソルとトラッカーに記録する。
fn resolve_offset(
    cursor: &mut BatchCursor,
    state: &mut PartitionState,
    report: &mut BatchReport,
    offset: i64,
) -> bool {
    match cursor.resolve(offset) {
        Ok(()) => {
            state.tracker.record(offset);
            report.resolved = Some(offset);
            true
        }
        Err(e) => {
            error!(error = %e, "オフセットの確定に失敗しました");
            false
        }
    }
}
