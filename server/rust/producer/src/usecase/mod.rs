pub mod produce_messages;

pub use produce_messages::ProduceMessagesUseCase;
