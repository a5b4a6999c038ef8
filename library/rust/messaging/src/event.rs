/// EventEnvelope はトピック・キー・ペイロードをラップするメッセージエンベロープ。
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// 送信先トピック名（例: "test-topic"）
    pub topic: String,
    /// パーティションキー。None の場合はブローカー側の既定パーティショナーに任せる
    pub key: Option<String>,
    /// JSON シリアライズされたペイロード
    pub payload: Vec<u8>,
    /// メッセージのヘッダー（オプション）
    pub headers: Vec<(String, Vec<u8>)>,
}

impl EventEnvelope {
    /// ヘッダーを追加する。
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}
