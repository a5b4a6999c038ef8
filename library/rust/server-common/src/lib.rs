//! pubsub-server-common: プロデューサー・コンシューマープロセス共通の基盤。
//!
//! シャットダウン調停、シグナル監視、周期タスク、インスタンス ID の解決、
//! YAML 設定ファイルの読み込みを提供する。

pub mod config;
pub mod instance;
pub mod schedule;
pub mod shutdown;

pub use config::{load_config, ConfigError};
pub use instance::instance_id;
pub use schedule::PeriodicTask;
pub use shutdown::{
    spawn_signal_listener, ShutdownCoordinator, ShutdownOutcome, ShutdownReason, ShutdownState,
};
