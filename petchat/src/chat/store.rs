//! Ordered message log for one chat room.
//!
//! The log merges three sources: optimistic local sends, pushes from the
//! broker, and REST history snapshots. It owns the deduplication rules
//! that keep a message from showing up twice when the broker echoes a
//! send back to its author:
//!
//! 1. An id the server already assigned is never appended twice.
//! 2. A push carrying a `clientId` replaces the optimistic copy with that
//!    placeholder id.
//! 3. A push from ourselves without a `clientId` replaces the oldest
//!    unconfirmed optimistic copy with the same receiver and content.
//! 4. Anything else is appended.

use petchat_proto::message::{ChatMessage, Conversation, MessageId, UserId};

/// Delivery state of a message in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Rendered locally, not yet handed to the transport.
    Pending,
    /// Handed to the transport, not yet echoed by the broker.
    Sent,
    /// Echoed by the broker or loaded from history.
    Delivered,
    /// Could not be sent.
    Failed(String),
}

impl MessageStatus {
    /// Whether a broker echo may still reconcile this entry.
    #[must_use]
    pub const fn awaiting_echo(&self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }
}

/// One entry of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// The message as last seen.
    pub message: ChatMessage,
    /// Where it is in its delivery lifecycle.
    pub status: MessageStatus,
    /// Survives history replacement until the server reflects it.
    pub pinned: bool,
}

/// What [`MessageStore::ingest`] did with a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// A new entry was added at the end.
    Appended(MessageId),
    /// An optimistic entry was replaced by its echo.
    Reconciled {
        /// Id the entry had before.
        previous: MessageId,
        /// Id it has now.
        current: MessageId,
    },
    /// The message was already in the log.
    Duplicate(MessageId),
}

/// The ordered message log.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<StoredMessage>,
}

impl MessageStore {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in display order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredMessage> {
        self.entries.iter()
    }

    /// Entries belonging to `conversation`, in display order.
    pub fn conversation(
        &self,
        conversation: Conversation,
    ) -> impl Iterator<Item = &StoredMessage> {
        self.entries
            .iter()
            .filter(move |e| conversation.contains(&e.message))
    }

    /// Look an entry up by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&StoredMessage> {
        self.entries.iter().find(|e| e.message.id == *id)
    }

    /// Add an optimistic local message with status `Pending`.
    pub fn append_local(&mut self, message: ChatMessage, pinned: bool) -> MessageId {
        let id = message.id;
        self.entries.push(StoredMessage {
            message,
            status: MessageStatus::Pending,
            pinned,
        });
        id
    }

    /// Change the status of an entry. Returns `false` if it is gone.
    pub fn set_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == *id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Remove an entry.
    pub fn remove(&mut self, id: &MessageId) -> Option<StoredMessage> {
        let index = self.entries.iter().position(|e| e.message.id == *id)?;
        Some(self.entries.remove(index))
    }

    /// Merge a message pushed by the broker. `me` is the local user.
    pub fn ingest(&mut self, message: ChatMessage, me: UserId) -> Ingest {
        if let MessageId::Server(_) = message.id {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == message.id) {
                if message.is_confirmed() {
                    entry.message.confirmed = Some(true);
                }
                return Ingest::Duplicate(message.id);
            }
        }

        let optimistic = match message.client_id {
            Some(client_id) => self
                .entries
                .iter()
                .position(|e| e.message.client_id == Some(client_id)),
            None if message.sender_id == me => self.entries.iter().position(|e| {
                e.message.id.is_local()
                    && e.status.awaiting_echo()
                    && e.message.sender_id == me
                    && e.message.receiver_id == message.receiver_id
                    && e.message.kind == message.kind
            }),
            None => None,
        };

        if let Some(index) = optimistic {
            let entry = &mut self.entries[index];
            let previous = entry.message.id;
            if entry.status == MessageStatus::Delivered && previous == message.id {
                return Ingest::Duplicate(previous);
            }
            let current = message.id;
            entry.message = ChatMessage {
                client_id: message.client_id.or(entry.message.client_id),
                timestamp: message.timestamp.or(entry.message.timestamp),
                ..message
            };
            entry.status = MessageStatus::Delivered;
            return Ingest::Reconciled { previous, current };
        }

        let id = message.id;
        self.entries.push(StoredMessage {
            message,
            status: MessageStatus::Delivered,
            pinned: false,
        });
        Ingest::Appended(id)
    }

    /// Replace the entries of `conversation` with a history snapshot.
    ///
    /// History entries come first, in server order. Pinned local entries
    /// the snapshot does not yet reflect are kept after them; a reflected
    /// pinned entry is dropped in favour of the server copy. Entries of
    /// other conversations are untouched.
    pub fn replace_with_history(
        &mut self,
        conversation: Conversation,
        history: Vec<ChatMessage>,
        me: UserId,
    ) {
        let (ours, others): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| conversation.contains(&e.message));

        let kept_pinned: Vec<StoredMessage> = ours
            .into_iter()
            .filter(|e| e.pinned && !reflected_in(&e.message, &history, me))
            .collect();

        self.entries = others;
        self.entries.extend(
            history
                .into_iter()
                .filter(|m| conversation.contains(m))
                .map(|message| StoredMessage {
                    message,
                    status: MessageStatus::Delivered,
                    pinned: false,
                }),
        );
        self.entries.extend(kept_pinned);
    }
}

/// Whether the server copy of a local message appears in `history`.
fn reflected_in(local: &ChatMessage, history: &[ChatMessage], me: UserId) -> bool {
    history.iter().any(|m| {
        (local.client_id.is_some() && m.client_id == local.client_id)
            || (m.sender_id == me
                && m.receiver_id == local.receiver_id
                && m.kind == local.kind)
    })
}
