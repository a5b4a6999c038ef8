/// MessagingError はメッセージング操作に関するエラーを表す。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessagingError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("publish error: {0}")]
    PublishError(String),

    #[error("consume error: {0}")]
    ConsumeError(String),

    #[error("commit error: {0}")]
    CommitError(String),

    #[error("heartbeat error: {0}")]
    HeartbeatError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("fatal client error: {0}")]
    FatalClientError(String),

    #[error("offset regression on {topic}[{partition}]: {offset} <= resolved {resolved}")]
    OffsetRegression {
        topic: String,
        partition: i32,
        offset: i64,
        resolved: i64,
    },
}

impl MessagingError {
    /// 接続レベルのエラー（シャットダウンへエスカレーションすべきもの）かを判定する。
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionError(_) | Self::FatalClientError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_display() {
        let err = MessagingError::PublishError("kafka broker unreachable".to_string());
        assert!(err.to_string().contains("kafka broker unreachable"));
    }

    #[test]
    fn test_is_fatal() {
        assert!(MessagingError::ConnectionError("refused".to_string()).is_fatal());
        assert!(MessagingError::FatalClientError("crash".to_string()).is_fatal());
        assert!(!MessagingError::PublishError("timeout".to_string()).is_fatal());
        assert!(!MessagingError::DeserializationError("bad json".to_string()).is_fatal());
        assert!(!MessagingError::CommitError("rebalance".to_string()).is_fatal());
    }

    #[test]
    fn test_offset_regression_display() {
        let err = MessagingError::OffsetRegression {
            topic: "test-topic".to_string(),
            partition: 2,
            offset: 5,
            resolved: 7,
        };
        assert_eq!(
            err.to_string(),
            "offset regression on test-topic[2]: 5 <= resolved 7"
        );
    }
}
