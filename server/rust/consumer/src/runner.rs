use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pubsub_messaging::{
    AssignedPartitions, ConsumerConfig, EventConsumer, GroupMembership, MessagingConfig,
};
use pubsub_retry::with_retry;
use pubsub_server_common::{ShutdownCoordinator, ShutdownOutcome, ShutdownReason};
use pubsub_telemetry::Metrics;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::handler::{
    GroupEventDispatcher, LoggingEventHandler, MembershipRecorder, MessageHandler,
    ShutdownOnCrash,
};
use crate::usecase::{ConsumeBatchesUseCase, ProcessBatchUseCase};

/// ConsumerRunner は接続・グループ参加・バッチ消費・シャットダウンまでのコンシューマーの一生を管理する。
pub struct ConsumerRunner {
    consumer: Arc<dyn EventConsumer>,
    handler: Arc<dyn MessageHandler>,
    coordinator: Arc<ShutdownCoordinator>,
    metrics: Arc<Metrics>,
    assigned: Arc<Mutex<AssignedPartitions>>,
    membership: Arc<MembershipRecorder>,
}

impl ConsumerRunner {
    pub fn new(
        consumer: Arc<dyn EventConsumer>,
        handler: Arc<dyn MessageHandler>,
        coordinator: Arc<ShutdownCoordinator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            consumer,
            handler,
            coordinator,
            metrics,
            assigned: Arc::new(Mutex::new(AssignedPartitions::new())),
            membership: Arc::new(MembershipRecorder::new()),
        }
    }

    /// 現在の世代で処理したパーティション（昇順）。
    pub fn assigned_partitions(&self) -> Vec<i32> {
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// 直近のグループ参加で得たメンバー情報。
    pub fn membership(&self) -> Option<GroupMembership> {
        self.membership.membership()
    }

    /// 接続してバッチ消費を実行し、シャットダウンの結果を返す。
    pub async fn run(&self, kafka: &MessagingConfig, settings: &ConsumerConfig) -> ShutdownOutcome {
        // 接続前に購読しておかないと Connect / GroupJoin を取りこぼす
        let stop_dispatch = CancellationToken::new();
        let dispatcher = GroupEventDispatcher::new()
            .register(Arc::new(LoggingEventHandler::new(
                settings.group_id.as_str(),
                self.metrics.clone(),
            )))
            .register(self.membership.clone())
            .register(Arc::new(ShutdownOnCrash::new(self.coordinator.clone())))
            .spawn(self.consumer.events(), stop_dispatch.clone());

        let process = ProcessBatchUseCase::new(
            self.consumer.clone(),
            self.handler.clone(),
            self.assigned.clone(),
            self.metrics.clone(),
            settings.group_id.as_str(),
            settings.max_redeliveries,
        );
        let consume = ConsumeBatchesUseCase::new(
            self.consumer.clone(),
            process,
            self.coordinator.clone(),
            settings.commit_policy(),
            settings.concurrency(),
            Duration::from_millis(kafka.retry.initial_retry_time_ms),
        );

        let handled = if self.connect(kafka, settings).await {
            consume.run().await
        } else {
            0
        };

        let outcome = self.shutdown(&consume, handled).await;
        stop_dispatch.cancel();
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "グループイベントの配信タスクが異常終了しました");
        }
        outcome
    }

    async fn connect(&self, kafka: &MessagingConfig, settings: &ConsumerConfig) -> bool {
        let retry = kafka.retry.to_retry_config();
        let join = || async move {
            self.consumer.connect().await?;
            self.consumer
                .subscribe(&settings.topic, settings.from_beginning)
                .await
        };
        let result = tokio::select! {
            result = with_retry(&retry, join) => result,
            () = self.coordinator.cancelled() => return false,
        };
        match result {
            Ok(()) => {
                info!(
                    brokers = %kafka.brokers_string(),
                    group_id = %settings.group_id,
                    topic = %settings.topic,
                    from_beginning = settings.from_beginning,
                    "コンシューマーグループに参加しました"
                );
                true
            }
            Err(e) => {
                error!(error = %e, "ブローカーに接続できませんでした");
                self.coordinator
                    .trigger(ShutdownReason::ConnectFailed(e.to_string()));
                false
            }
        }
    }

    async fn shutdown(&self, consume: &ConsumeBatchesUseCase, handled: u64) -> ShutdownOutcome {
        let assigned = self
            .assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_string();
        info!(assigned = %assigned, "コンシューマーを停止します");

        let outcome = self
            .coordinator
            .finish(async {
                consume.flush_pending().await;
                self.consumer.disconnect().await
            })
            .await;
        info!(handled, exit_status = outcome.exit_status(), "コンシューマーを停止しました");
        tracing::debug!(metrics = %self.metrics.gather_metrics(), "メトリクス");
        outcome
    }
}
