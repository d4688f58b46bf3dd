//! Sync partitions.
//!
//! The server numbers updates per bucket: every chat and every space has its
//! own monotonically increasing `seq`. The client persists one cursor per
//! bucket and catches up on each independently.

use crate::{ChatId, Error, SpaceId, UnixTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A logical sync partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Bucket {
    /// Updates scoped to one chat.
    Chat(ChatId),
    /// Updates scoped to one space.
    Space(SpaceId),
}

impl Bucket {
    /// Stable string key used for persistence (`chat:42`, `space:7`).
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Space(id) => write!(f, "space:{id}"),
        }
    }
}

impl FromStr for Bucket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidBucketKey(s.to_string()))?;
        match kind {
            "chat" => Ok(Self::Chat(id.parse()?)),
            "space" => Ok(Self::Space(id.parse()?)),
            _ => Err(Error::InvalidBucketKey(s.to_string())),
        }
    }
}

/// Persisted position of a bucket: the last applied `seq` and its date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketCursor {
    /// Last seq whose update has been applied (or adopted by fast-forward).
    pub seq: u64,
    /// Server date associated with `seq`.
    pub date: UnixTime,
}

impl BucketCursor {
    /// Creates a cursor.
    #[must_use]
    pub const fn new(seq: u64, date: UnixTime) -> Self {
        Self { seq, date }
    }

    /// Returns the cursor advanced to `seq`/`date`, never moving backwards.
    #[must_use]
    pub fn advanced(&self, seq: u64, date: UnixTime) -> Self {
        if seq <= self.seq {
            return *self;
        }
        Self {
            seq,
            date: date.max(self.date),
        }
    }
}
