//! Identifier types used throughout the Inline client.
//!
//! All identifiers are assigned by the server as 64-bit integers. Each kind
//! gets its own newtype so a chat id can never be passed where a space id is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! server_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw server id.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Returns the raw server id.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.trim().parse()?))
            }
        }
    };
}

server_id!(
    /// Identifier of a chat (direct message or thread).
    ChatId
);

server_id!(
    /// Identifier of a space (a workspace grouping chats and members).
    SpaceId
);

server_id!(
    /// Identifier of a user.
    UserId
);

server_id!(
    /// Identifier of a message, unique within its chat.
    MessageId
);
