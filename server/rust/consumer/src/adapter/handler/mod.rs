pub mod group_event_handler;
pub mod message_handler;

pub use group_event_handler::{
    GroupEventDispatcher, GroupEventHandler, LoggingEventHandler, MembershipRecorder,
    ShutdownOnCrash,
};
pub use message_handler::{LoggingMessageHandler, MessageHandler};
