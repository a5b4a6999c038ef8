use std::process::ExitCode;
use std::sync::Arc;

use tracing::{info, Instrument};

use pubsub_messaging::{EventProducer, KafkaEventProducer};
use pubsub_producer::infrastructure::config::Config;
use pubsub_producer::runner::ProducerRunner;
use pubsub_server_common::{instance_id, load_config, spawn_signal_listener, ShutdownCoordinator};
use pubsub_telemetry::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Config
    let mut cfg: Config = load_config()?;
    cfg.apply_env_overrides();

    // Telemetry
    pubsub_telemetry::init_logger(&cfg.log)?;

    let instance = instance_id("PRODUCER_ID", "producer");
    // PRODUCER_ID が明示されていれば設定ファイルの client_id より優先する
    let client_id = std::env::var("PRODUCER_ID")
        .ok()
        .or_else(|| cfg.kafka.client_id.clone())
        .unwrap_or_else(|| instance.clone());
    let span = tracing::info_span!("producer", instance = %instance);

    info!(
        parent: &span,
        app_name = %cfg.app.name,
        version = %cfg.app.version,
        environment = %cfg.app.environment,
        client_id = %client_id,
        brokers = %cfg.kafka.brokers_string(),
        topic = %cfg.producer.topic,
        "starting pubsub-producer"
    );

    let metrics = Arc::new(Metrics::new(&cfg.app.name)?);
    let producer: Arc<dyn EventProducer> =
        Arc::new(KafkaEventProducer::new(&cfg.kafka, &client_id)?);

    let coordinator = Arc::new(ShutdownCoordinator::new());
    spawn_signal_listener(coordinator.clone());

    let runner = ProducerRunner::new(producer, coordinator, metrics);
    let outcome = runner
        .run(&cfg.kafka, &cfg.producer)
        .instrument(span)
        .await;

    Ok(outcome.exit_code())
}
