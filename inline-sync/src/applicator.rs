//! Update application.
//!
//! Push delivery and catch-up both end in an [`UpdateApplicator`]. The two
//! paths can overlap, so applying the same update twice must leave the
//! store exactly as applying it once.

use async_trait::async_trait;
use inline_types::{
    Bucket, ChatId, Message, MessageId, Reaction, SpaceId, Update, UpdatePayload, UserId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Applies updates to the application's data store.
#[async_trait]
pub trait UpdateApplicator: Send + Sync {
    /// Applies one update. Must be idempotent.
    async fn apply_update(&self, update: &Update) -> SyncResult<()>;

    /// Applies a catch-up batch, in order.
    async fn apply_batch(&self, updates: &[Update]) -> SyncResult<()> {
        for update in updates {
            self.apply_update(update).await?;
        }
        Ok(())
    }
}

/// Data state of a [`MemoryMessageStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStoreState {
    pub messages: BTreeMap<ChatId, BTreeMap<MessageId, Message>>,
    pub reactions: BTreeSet<(ChatId, MessageId, UserId, String)>,
    pub participants: BTreeMap<ChatId, BTreeSet<UserId>>,
    pub members: BTreeMap<SpaceId, BTreeSet<UserId>>,
}

impl MessageStoreState {
    fn apply(&mut self, payload: &UpdatePayload) {
        match payload {
            UpdatePayload::NewMessage { message } | UpdatePayload::EditMessage { message } => {
                self.messages
                    .entry(message.chat_id)
                    .or_default()
                    .insert(message.id, message.clone());
            }
            UpdatePayload::DeleteMessages {
                chat_id,
                message_ids,
            } => {
                if let Some(chat) = self.messages.get_mut(chat_id) {
                    for id in message_ids {
                        chat.remove(id);
                    }
                }
                self.reactions
                    .retain(|(chat, message, _, _)| chat != chat_id || !message_ids.contains(message));
            }
            UpdatePayload::UpdateReaction { reaction } => {
                self.reactions.insert(reaction_key(reaction));
            }
            UpdatePayload::DeleteReaction { reaction } => {
                self.reactions.remove(&reaction_key(reaction));
            }
            UpdatePayload::ParticipantAdd { chat_id, user_id } => {
                self.participants.entry(*chat_id).or_default().insert(*user_id);
            }
            UpdatePayload::ParticipantDelete { chat_id, user_id } => {
                if let Some(users) = self.participants.get_mut(chat_id) {
                    users.remove(user_id);
                }
            }
            UpdatePayload::SpaceMemberAdd { space_id, user_id } => {
                self.members.entry(*space_id).or_default().insert(*user_id);
            }
            UpdatePayload::SpaceMemberDelete { space_id, user_id } => {
                if let Some(users) = self.members.get_mut(space_id) {
                    users.remove(user_id);
                }
            }
            UpdatePayload::ChatHasNewUpdates { .. }
            | UpdatePayload::SpaceHasNewUpdates { .. }
            | UpdatePayload::Unknown => {}
        }
    }
}

fn reaction_key(reaction: &Reaction) -> (ChatId, MessageId, UserId, String) {
    (
        reaction.chat_id,
        reaction.message_id,
        reaction.user_id,
        reaction.emoji.clone(),
    )
}

#[derive(Default)]
struct Inner {
    state: MessageStoreState,
    log: Vec<Update>,
    fail_applies: usize,
}

/// In-memory message store.
///
/// Besides the data it keeps a log of every update it was asked to apply,
/// in call order, which tests use to check apply ordering.
#[derive(Clone, Default)]
pub struct MemoryMessageStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies an update synchronously.
    pub fn apply(&self, update: &Update) -> SyncResult<()> {
        let mut inner = self.lock();
        if inner.fail_applies > 0 {
            inner.fail_applies -= 1;
            return Err(SyncError::Apply(format!(
                "injected failure for {}",
                update.kind_name()
            )));
        }
        inner.state.apply(&update.payload);
        inner.log.push(update.clone());
        Ok(())
    }

    /// Makes the next `n` applications fail.
    pub fn fail_next_applies(&self, n: usize) {
        self.lock().fail_applies = n;
    }

    /// Copy of the current data state.
    pub fn state(&self) -> MessageStoreState {
        self.lock().state.clone()
    }

    /// Every update applied so far, in application order.
    pub fn applied(&self) -> Vec<Update> {
        self.lock().log.clone()
    }

    /// Seqs applied for `bucket`, in application order.
    pub fn applied_seqs(&self, bucket: Bucket) -> Vec<u64> {
        self.lock()
            .log
            .iter()
            .filter(|update| update.bucket() == Some(bucket))
            .filter_map(|update| update.seq)
            .collect()
    }

    /// Messages of a chat, ordered by id.
    pub fn messages(&self, chat_id: ChatId) -> Vec<Message> {
        self.lock()
            .state
            .messages
            .get(&chat_id)
            .map(|chat| chat.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UpdateApplicator for MemoryMessageStore {
    async fn apply_update(&self, update: &Update) -> SyncResult<()> {
        debug!("[STORE] apply {} seq {:?}", update.kind_name(), update.seq);
        self.apply(update)
    }
}
