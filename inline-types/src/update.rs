//! Server-pushed updates.
//!
//! An update is one server-side mutation. Updates that belong to a bucket
//! carry that bucket's `seq`, which defines their apply order; updates
//! without a `seq` are unordered and applied as they arrive.
//!
//! "Has new updates" notices are also updates: they carry no data of their
//! own, only the bucket and the server's current seq for it, and tell the
//! client to catch up with `getUpdates`.

use crate::{Bucket, ChatId, MessageId, SpaceId, UnixTime, UserId};
use serde::{Deserialize, Serialize};

/// A chat message as carried by message updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub from_id: UserId,
    #[serde(default)]
    pub text: Option<String>,
    pub date: UnixTime,
}

/// One user's reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

/// The mutation an update describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdatePayload {
    NewMessage {
        message: Message,
    },
    EditMessage {
        message: Message,
    },
    DeleteMessages {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    UpdateReaction {
        reaction: Reaction,
    },
    DeleteReaction {
        reaction: Reaction,
    },
    ParticipantAdd {
        chat_id: ChatId,
        user_id: UserId,
    },
    ParticipantDelete {
        chat_id: ChatId,
        user_id: UserId,
    },
    SpaceMemberAdd {
        space_id: SpaceId,
        user_id: UserId,
    },
    SpaceMemberDelete {
        space_id: SpaceId,
        user_id: UserId,
    },
    /// The chat's bucket advanced to `update_seq` on the server.
    ChatHasNewUpdates {
        chat_id: ChatId,
        update_seq: u64,
    },
    /// The space's bucket advanced to `update_seq` on the server.
    SpaceHasNewUpdates {
        space_id: SpaceId,
        update_seq: u64,
    },
    /// A kind this client does not understand.
    #[serde(other)]
    Unknown,
}

impl UpdatePayload {
    /// Short name for logs.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessages { .. } => "delete_messages",
            Self::UpdateReaction { .. } => "update_reaction",
            Self::DeleteReaction { .. } => "delete_reaction",
            Self::ParticipantAdd { .. } => "participant_add",
            Self::ParticipantDelete { .. } => "participant_delete",
            Self::SpaceMemberAdd { .. } => "space_member_add",
            Self::SpaceMemberDelete { .. } => "space_member_delete",
            Self::ChatHasNewUpdates { .. } => "chat_has_new_updates",
            Self::SpaceHasNewUpdates { .. } => "space_has_new_updates",
            Self::Unknown => "unknown",
        }
    }
}

/// A single server-side mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Position in the owning bucket, if the update is sequenced.
    #[serde(default)]
    pub seq: Option<u64>,
    /// Server date of the mutation.
    #[serde(default)]
    pub date: Option<UnixTime>,
    pub payload: UpdatePayload,
}

impl Update {
    /// Creates an unsequenced update.
    #[must_use]
    pub fn new(payload: UpdatePayload) -> Self {
        Self {
            seq: None,
            date: None,
            payload,
        }
    }

    /// Creates a sequenced update.
    #[must_use]
    pub fn sequenced(seq: u64, date: UnixTime, payload: UpdatePayload) -> Self {
        Self {
            seq: Some(seq),
            date: Some(date),
            payload,
        }
    }

    /// Builds a "chat has new updates" notice.
    #[must_use]
    pub fn chat_notice(chat_id: ChatId, update_seq: u64) -> Self {
        Self::new(UpdatePayload::ChatHasNewUpdates {
            chat_id,
            update_seq,
        })
    }

    /// Builds a "space has new updates" notice.
    #[must_use]
    pub fn space_notice(space_id: SpaceId, update_seq: u64) -> Self {
        Self::new(UpdatePayload::SpaceHasNewUpdates {
            space_id,
            update_seq,
        })
    }

    /// The bucket whose seq numbers this update, for data-carrying updates.
    ///
    /// Notices return `None`: they point at a bucket but are not part of it.
    #[must_use]
    pub fn bucket(&self) -> Option<Bucket> {
        match &self.payload {
            UpdatePayload::NewMessage { message } | UpdatePayload::EditMessage { message } => {
                Some(Bucket::Chat(message.chat_id))
            }
            UpdatePayload::DeleteMessages { chat_id, .. }
            | UpdatePayload::ParticipantAdd { chat_id, .. }
            | UpdatePayload::ParticipantDelete { chat_id, .. } => Some(Bucket::Chat(*chat_id)),
            UpdatePayload::UpdateReaction { reaction }
            | UpdatePayload::DeleteReaction { reaction } => Some(Bucket::Chat(reaction.chat_id)),
            UpdatePayload::SpaceMemberAdd { space_id, .. }
            | UpdatePayload::SpaceMemberDelete { space_id, .. } => Some(Bucket::Space(*space_id)),
            UpdatePayload::ChatHasNewUpdates { .. }
            | UpdatePayload::SpaceHasNewUpdates { .. }
            | UpdatePayload::Unknown => None,
        }
    }

    /// If this is a "has new updates" notice, the bucket and server seq it announces.
    #[must_use]
    pub fn bucket_notice(&self) -> Option<(Bucket, u64)> {
        match &self.payload {
            UpdatePayload::ChatHasNewUpdates {
                chat_id,
                update_seq,
            } => Some((Bucket::Chat(*chat_id), *update_seq)),
            UpdatePayload::SpaceHasNewUpdates {
                space_id,
                update_seq,
            } => Some((Bucket::Space(*space_id), *update_seq)),
            _ => None,
        }
    }

    /// Whether this client knows how to apply the update.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        !matches!(self.payload, UpdatePayload::Unknown)
    }

    /// Short name for logs.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.payload.kind_name()
    }
}
