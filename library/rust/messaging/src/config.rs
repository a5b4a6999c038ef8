use pubsub_retry::RetrySettings;
use serde::{Deserialize, Serialize};

/// MessagingConfig はブローカー接続設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// ブローカーアドレスのリスト（例: ["localhost:19092"]）
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    /// クライアント ID。未指定の場合はインスタンス ID を使う
    #[serde(default)]
    pub client_id: Option<String>,
    /// セキュリティプロトコル（PLAINTEXT / SSL / SASL_PLAINTEXT / SASL_SSL）
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// メタデータ取得・フラッシュなど単発リクエストのタイムアウト（ミリ秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 接続時のリトライ設定
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:19092".to_string()]
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: None,
            security_protocol: default_security_protocol(),
            timeout_ms: default_timeout_ms(),
            retry: RetrySettings::default(),
        }
    }
}

impl MessagingConfig {
    /// ブローカーアドレスをカンマ区切り文字列で返す（rdkafka 用）。
    pub fn brokers_string(&self) -> String {
        self.brokers.join(",")
    }

    /// カンマ区切りのブローカー文字列で上書きする。空要素は無視する。
    pub fn override_brokers(&mut self, brokers: &str) {
        let parsed: Vec<String> = brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(ToString::to_string)
            .collect();
        if !parsed.is_empty() {
            self.brokers = parsed;
        }
    }
}
