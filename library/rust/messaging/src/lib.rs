//! pubsub-messaging: Kafka 互換ブローカー向けのプロデューサー・コンシューマーグループ抽象化ライブラリ。
//!
//! バッチ単位のオフセット管理（resolve / 条件付きコミット / 世代による stale 判定）と、
//! グループイベントの通知チャネルを提供する。

pub mod batch;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod group;
pub mod message;
pub mod producer;

#[cfg(feature = "kafka")]
pub mod kafka_consumer;
#[cfg(feature = "kafka")]
pub mod kafka_producer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use batch::{
    AssignmentGeneration, Batch, BatchCursor, BatchScope, CommitPolicy, CommitTracker,
    OffsetCommit,
};
pub use config::MessagingConfig;
pub use consumer::{ConsumedMessage, ConsumerConfig, EventConsumer};
pub use error::MessagingError;
pub use event::EventEnvelope;
pub use group::{AssignedPartitions, GroupEvent, GroupMembership};
pub use message::{message_key, SampleMessage};
pub use producer::EventProducer;

#[cfg(feature = "kafka")]
pub use kafka_consumer::KafkaEventConsumer;
#[cfg(feature = "kafka")]
pub use kafka_producer::KafkaEventProducer;

#[cfg(feature = "mock")]
pub use consumer::MockEventConsumer;
#[cfg(feature = "mock")]
pub use producer::MockEventProducer;

#[cfg(any(test, feature = "testing"))]
pub use testing::{InMemoryBroker, InMemoryConsumer, InMemoryProducer};
