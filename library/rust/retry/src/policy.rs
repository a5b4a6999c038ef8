use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// リトライ回数から生成する。初回試行を含めるため試行回数は retries + 1 になる。
    pub fn from_retries(retries: u32) -> Self {
        Self::new(retries.saturating_add(1))
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let delay_ms = if self.jitter {
            let jitter_range = capped * 0.1;
            capped - jitter_range + (rand::random::<f64>() * jitter_range * 2.0)
        } else {
            capped
        };
        Duration::from_millis(delay_ms as u64)
    }
}

/// RetrySettings は設定ファイルから読み込むリトライ設定を表す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// 初回リトライまでの待機時間（ミリ秒）
    #[serde(default = "default_initial_retry_time_ms")]
    pub initial_retry_time_ms: u64,
    /// 最大リトライ回数（初回試行を含まない）
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// バックオフの上限（ミリ秒）
    #[serde(default = "default_max_retry_time_ms")]
    pub max_retry_time_ms: u64,
    /// バックオフ倍率
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_retry_time_ms() -> u64 {
    100
}

fn default_retries() -> u32 {
    8
}

fn default_max_retry_time_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_retry_time_ms: default_initial_retry_time_ms(),
            retries: default_retries(),
            max_retry_time_ms: default_max_retry_time_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    /// RetryConfig に変換する。
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::from_retries(self.retries)
            .with_initial_delay(Duration::from_millis(self.initial_retry_time_ms))
            .with_max_delay(Duration::from_millis(self.max_retry_time_ms))
            .with_multiplier(self.multiplier)
    }
}
