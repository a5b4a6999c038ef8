//! 構造化ログユーティリティ。
//! tracing クレートを使用し、JSON またはテキスト形式の構造化ログを出力する。
//!
//! # 使用例
//!
//! ```ignore
//! use tracing::{info, warn, error};
//!
//! info!(topic = "test-topic", partition = 0, offset = 42, "Received message");
//! warn!(error = %e, "Failed to send message");
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::TelemetryError;

/// LogConfig はログ出力の設定を表す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// ログレベル（trace / debug / info / warn / error）。RUST_LOG が設定されていればそちらが優先される
    #[serde(default = "default_level")]
    pub level: String,
    /// 出力形式。"text" の場合はプレーンテキスト、それ以外は JSON
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "json".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// build_filter は EnvFilter を組み立てる。RUST_LOG が有効であればそれを使い、
/// 無ければ level を使う。level が不正な場合は info にフォールバックする。
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// init_logger は tracing-subscriber を初期化する。
/// format が "text" の場合はプレーンテキスト出力、それ以外は JSON 出力。
/// グローバルサブスクライバーが既に設定済みの場合はエラーを返す。
pub fn init_logger(config: &LogConfig) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(build_filter(&config.level));

    let result = if config.format == "text" {
        registry.with(fmt::layer().with_target(true)).try_init()
    } else {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    };
    result.map_err(|e| TelemetryError::LoggerInit(e.to_string()))
}
