//! Core data types for PeerMessenger

pub mod friend;
pub mod message;

pub use friend::Friend;
pub use message::{Message, MessageId};

/// Current Unix time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
