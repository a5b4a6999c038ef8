use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use pubsub_messaging::{AssignmentGeneration, Batch, BatchScope, CommitPolicy, EventConsumer};
use pubsub_server_common::{ShutdownCoordinator, ShutdownReason};
use tracing::{debug, error, info, warn};

use super::process_batch::{BatchReport, PartitionState, ProcessBatchUseCase};

type PartitionKey = (String, i32);

/// ConsumeBatchesUseCase はフェッチとバッチ処理を停止指示まで繰り返す。
/// 1 回のフェッチで得たバッチはパーティション単位で並行に処理し、
/// すべて終わってから次のフェッチに進む。
pub struct ConsumeBatchesUseCase {
    consumer: Arc<dyn EventConsumer>,
    process: ProcessBatchUseCase,
    coordinator: Arc<ShutdownCoordinator>,
    generation: AssignmentGeneration,
    states: Mutex<HashMap<PartitionKey, PartitionState>>,
    policy: CommitPolicy,
    concurrency: usize,
    fetch_backoff: Duration,
}

impl ConsumeBatchesUseCase {
    pub fn new(
        consumer: Arc<dyn EventConsumer>,
        process: ProcessBatchUseCase,
        coordinator: Arc<ShutdownCoordinator>,
        policy: CommitPolicy,
        concurrency: usize,
        fetch_backoff: Duration,
    ) -> Self {
        let generation = consumer.assignment_generation();
        Self {
            consumer,
            process,
            coordinator,
            generation,
            states: Mutex::new(HashMap::new()),
            policy,
            concurrency: concurrency.max(1),
            fetch_backoff,
        }
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<PartitionKey, PartitionState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 停止指示まで消費を続け、ハンドラが処理したメッセージ数を返す。
    pub async fn run(&self) -> u64 {
        let token = self.coordinator.token();
        let mut handled = 0u64;
        loop {
            let fetched = tokio::select! {
                biased;
                () = token.cancelled() => break,
                fetched = self.consumer.fetch() => fetched,
            };
            match fetched {
                Ok(batches) => {
                    for report in self.process_all(batches).await {
                        handled += u64::try_from(report.handled).unwrap_or(u64::MAX);
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "フェッチで回復不能なエラーが発生しました");
                    self.coordinator.trigger(ShutdownReason::Crash(e.to_string()));
                    break;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.fetch_backoff.as_millis(),
                        "フェッチに失敗しました"
                    );
                    tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(self.fetch_backoff) => {}
                    }
                }
            }
        }
        info!(handled, "メッセージの消費を停止しました");
        handled
    }

    /// 1 回のフェッチ結果を処理する。同じパーティションのバッチが同時に走ることはない。
    async fn process_all(&self, batches: Vec<Batch>) -> Vec<BatchReport> {
        let jobs: Vec<(Batch, PartitionState)> = {
            let mut states = self.lock_states();
            batches
                .into_iter()
                .filter(|batch| !batch.is_empty())
                .map(|batch| {
                    let state = states
                        .remove(&(batch.topic.clone(), batch.partition))
                        .unwrap_or_else(|| PartitionState::new(self.policy.clone(), batch.generation));
                    (batch, state)
                })
                .collect()
        };
        if jobs.is_empty() {
            return Vec::new();
        }

        let token = self.coordinator.token();
        let finished: Vec<(PartitionKey, PartitionState, BatchReport)> = stream::iter(jobs)
            .map(|(batch, mut state)| {
                let scope = BatchScope::new(token.clone(), batch.generation, self.generation.clone());
                async move {
                    let report = self.process.execute(&batch, &scope, &mut state).await;
                    debug!(
                        topic = %batch.topic,
                        partition = batch.partition,
                        first_offset = ?batch.first_offset(),
                        last_offset = ?batch.last_offset(),
                        report = ?report,
                        "バッチを処理しました"
                    );
                    ((batch.topic, batch.partition), state, report)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut states = self.lock_states();
        finished
            .into_iter()
            .map(|(key, state, report)| {
                states.insert(key, state);
                report
            })
            .collect()
    }

    /// 現在の世代に属するパーティションの確定済みオフセットを条件に関係なくコミットする。
    /// 切断の直前に呼び出す。
    pub async fn flush_pending(&self) {
        let current = self.generation.current();
        let pending: Vec<(PartitionKey, PartitionState)> = self.lock_states().drain().collect();
        for ((topic, partition), mut state) in pending {
            if state.tracker.generation() != current {
                debug!(
                    topic = %topic,
                    partition,
                    generation = state.tracker.generation(),
                    current,
                    "以前の世代のオフセットはコミットしません"
                );
                continue;
            }
            if let Some(resolved) = self
                .process
                .commit_if_necessary(&topic, partition, &mut state, true)
                .await
            {
                info!(topic = %topic, partition, resolved_offset = resolved, "終了前にオフセットをコミットしました");
            }
        }
    }
}
