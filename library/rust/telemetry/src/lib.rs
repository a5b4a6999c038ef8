pub mod error;
pub mod logger;
pub mod metrics;

#[cfg(test)]
mod tests;

pub use error::TelemetryError;
pub use logger::{init_logger, LogConfig};
pub use metrics::Metrics;
