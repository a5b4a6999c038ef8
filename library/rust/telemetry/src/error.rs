use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize logger: {0}")]
    LoggerInit(String),

    #[error("failed to register metric: {0}")]
    Metrics(#[from] prometheus::Error),
}
