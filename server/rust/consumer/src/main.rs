use std::process::ExitCode;
use std::sync::Arc;

use tracing::{info, Instrument};

use pubsub_consumer::adapter::handler::{LoggingMessageHandler, MessageHandler};
use pubsub_consumer::infrastructure::config::Config;
use pubsub_consumer::runner::ConsumerRunner;
use pubsub_messaging::{EventConsumer, KafkaEventConsumer};
use pubsub_server_common::{instance_id, load_config, spawn_signal_listener, ShutdownCoordinator};
use pubsub_telemetry::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Config
    let mut cfg: Config = load_config()?;
    cfg.apply_env_overrides();

    // Telemetry
    pubsub_telemetry::init_logger(&cfg.log)?;

    let instance = instance_id("CONSUMER_ID", "consumer");
    // CONSUMER_ID が明示されていれば設定ファイルの client_id より優先する
    let client_id = std::env::var("CONSUMER_ID")
        .ok()
        .or_else(|| cfg.kafka.client_id.clone())
        .unwrap_or_else(|| instance.clone());
    let span = tracing::info_span!("consumer", instance = %instance);

    info!(
        parent: &span,
        app_name = %cfg.app.name,
        version = %cfg.app.version,
        environment = %cfg.app.environment,
        client_id = %client_id,
        brokers = %cfg.kafka.brokers_string(),
        group_id = %cfg.consumer.group_id,
        topic = %cfg.consumer.topic,
        concurrency = cfg.consumer.concurrency(),
        "starting pubsub-consumer"
    );

    let metrics = Arc::new(Metrics::new(&cfg.app.name)?);
    let consumer: Arc<dyn EventConsumer> = Arc::new(KafkaEventConsumer::new(
        &cfg.kafka,
        &cfg.consumer,
        &client_id,
    )?);
    let handler: Arc<dyn MessageHandler> = Arc::new(LoggingMessageHandler);

    let coordinator = Arc::new(ShutdownCoordinator::new());
    spawn_signal_listener(coordinator.clone());

    let runner = ConsumerRunner::new(consumer, handler, coordinator, metrics);
    let outcome = runner
        .run(&cfg.kafka, &cfg.consumer)
        .instrument(span)
        .await;

    Ok(outcome.exit_code())
}
