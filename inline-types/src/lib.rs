//! Core type definitions for the Inline realtime client.
//!
//! This crate defines the plain data model shared by the sync engine:
//! - Server-assigned identifiers (chats, spaces, users, messages)
//! - Unix-second timestamps used for server dates and sync cursors
//! - Sync partitions ("buckets") and their persisted cursors
//! - Server-pushed updates and their payloads
//!
//! Nothing here performs I/O.

mod bucket;
mod ids;
mod timestamp;
mod update;

pub use bucket::{Bucket, BucketCursor};
pub use ids::{ChatId, MessageId, SpaceId, UserId};
pub use timestamp::UnixTime;
pub use update::{Message, Reaction, Update, UpdatePayload};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid bucket key: {0}")]
    InvalidBucketKey(String),

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] std::num::ParseIntError),
}
