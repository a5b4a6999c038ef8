//! pubsub-retry: ブローカー接続用のリトライライブラリ。
//!
//! 固定の初期遅延から始まる指数バックオフ（上限付き）と最大リトライ回数を提供する。

pub mod error;
pub mod policy;
pub mod retry;

pub use error::RetryError;
pub use policy::{RetryConfig, RetrySettings};
pub use retry::with_retry;
