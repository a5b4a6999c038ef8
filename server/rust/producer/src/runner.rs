use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use pubsub_messaging::{EventProducer, MessagingConfig};
use pubsub_retry::with_retry;
use pubsub_server_common::{PeriodicTask, ShutdownCoordinator, ShutdownOutcome, ShutdownReason};
use pubsub_telemetry::Metrics;
use tracing::{error, info, warn};

use crate::infrastructure::config::ProducerSettings;
use crate::usecase::ProduceMessagesUseCase;

/// ProducerRunner は接続・周期送信・シャットダウンまでのプロデューサーの一生を管理する。
pub struct ProducerRunner {
    producer: Arc<dyn EventProducer>,
    coordinator: Arc<ShutdownCoordinator>,
    metrics: Arc<Metrics>,
}

impl ProducerRunner {
    pub fn new(
        producer: Arc<dyn EventProducer>,
        coordinator: Arc<ShutdownCoordinator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            producer,
            coordinator,
            metrics,
        }
    }

    /// 接続して送信ループを実行し、シャットダウンの結果を返す。
    pub async fn run(&self, kafka: &MessagingConfig, settings: &ProducerSettings) -> ShutdownOutcome {
        if !self.connect(kafka).await {
            return self.shutdown(0).await;
        }

        let usecase = ProduceMessagesUseCase::new(
            self.producer.clone(),
            self.metrics.clone(),
            settings.topic.as_str(),
            settings.message_count,
        );
        if !usecase.is_complete() {
            let task = PeriodicTask::new(
                Duration::from_millis(settings.interval_ms),
                self.coordinator.token(),
            );
            task.run(|| async {
                if let Err(e) = usecase.execute().await {
                    warn!(
                        topic = %settings.topic,
                        id = usecase.sent(),
                        error = %e,
                        "メッセージの送信に失敗しました"
                    );
                }
                if usecase.is_complete() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;
        }

        if usecase.is_complete() {
            info!(sent = usecase.sent(), "予定数のメッセージを送信しました");
            self.coordinator.trigger(ShutdownReason::Completed);
        }
        self.shutdown(usecase.sent()).await
    }

    async fn connect(&self, kafka: &MessagingConfig) -> bool {
        let retry = kafka.retry.to_retry_config();
        let result = tokio::select! {
            result = with_retry(&retry, || self.producer.connect()) => result,
            () = self.coordinator.cancelled() => return false,
        };
        match result {
            Ok(()) => {
                info!(brokers = %kafka.brokers_string(), "プロデューサーが接続しました");
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

    async fn shutdown(&self, sent: u64) -> ShutdownOutcome {
        let outcome = self.coordinator.finish(self.producer.disconnect()).await;
        info!(sent, exit_status = outcome.exit_status(), "プロデューサーを停止しました");
        tracing::debug!(metrics = %self.metrics.gather_metrics(), "メトリクス");
        outcome
    }
}
