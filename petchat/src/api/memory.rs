//! In-process [`ChatApi`] for tests.
//!
//! Holds messages, profiles and contact lists in memory and records every
//! call so tests can assert on what the chat core asked for.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use petchat_proto::message::{ChatMessage, Conversation, MessageId, PetId, UserId};

use super::{ApiError, ChatApi, Upload, User};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// `history(a, b)`.
    History(UserId, UserId),
    /// `delete_message(id)`.
    Delete(i64),
    /// `upload_image` with this file name.
    Upload(String),
    /// `user(id)`.
    User(UserId),
    /// `confirm_adoption(adopter, pet)`.
    ConfirmAdoption {
        /// Who adopts.
        adopter: UserId,
        /// Which pet.
        pet: PetId,
    },
    /// `cancel_adoption(pet)`.
    CancelAdoption(PetId),
    /// `chat_users(me)`.
    ChatUsers(UserId),
}

#[derive(Default)]
struct State {
    messages: Vec<ChatMessage>,
    users: HashMap<UserId, User>,
    contacts: HashMap<UserId, Vec<User>>,
    calls: Vec<ApiCall>,
    failing: bool,
    history_gate: Option<Arc<Notify>>,
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryApi {
    state: Mutex<State>,
}

impl MemoryApi {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a persisted message. A local id is replaced by the next free
    /// server id, as the real backend would.
    pub fn insert_message(&self, mut message: ChatMessage) -> MessageId {
        let mut state = self.state.lock();
        if message.id.is_local() {
            let next = state
                .messages
                .iter()
                .filter_map(|m| m.id.server())
                .max()
                .unwrap_or(0)
                + 1;
            message.id = MessageId::Server(next);
        }
        let id = message.id;
        state.messages.push(message);
        id
    }

    /// Register a user profile.
    pub fn insert_user(&self, user: User) {
        self.state.lock().users.insert(user.id, user);
    }

    /// Set the contact list returned for `me`.
    pub fn set_chat_users(&self, me: UserId, users: Vec<User>) {
        self.state.lock().contacts.insert(me, users);
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Hold history responses until the returned handle is notified.
    ///
    /// Each `notify_one` releases one pending (or the next) history call.
    #[must_use]
    pub fn gate_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().history_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    /// Messages currently persisted.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    /// Mark `adopter`'s stored adoption requests for `pet` as confirmed.
    pub fn mark_confirmed(&self, adopter: UserId, pet: PetId) {
        for msg in &mut self.state.lock().messages {
            if msg.sender_id == adopter && msg.kind.pet_id() == Some(pet) {
                msg.confirmed = Some(true);
            }
        }
    }

    /// Record `call` and fail if the backend is set to fail.
    fn begin(&self, call: ApiCall) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing {
            return Err(ApiError::Status {
                status: 500,
                body: "internal error".into(),
            });
        }
        Ok(())
    }
}

impl ChatApi for MemoryApi {
    async fn history(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>, ApiError> {
        let gate = self.state.lock().history_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.begin(ApiCall::History(a, b))?;
        let conversation = Conversation::new(a, b);
        Ok(self
            .state
            .lock()
            .messages
            .iter()
            .filter(|m| conversation.contains(m))
            .cloned()
            .collect())
    }

    async fn delete_message(&self, id: i64) -> Result<(), ApiError> {
        self.begin(ApiCall::Delete(id))?;
        self.state
            .lock()
            .messages
            .retain(|m| m.id != MessageId::Server(id));
        Ok(())
    }

    async fn upload_image(&self, upload: Upload) -> Result<String, ApiError> {
        self.begin(ApiCall::Upload(upload.file_name.clone()))?;
        Ok(format!("http://localhost/uploads/{}", upload.file_name))
    }

    async fn user(&self, id: UserId) -> Result<User, ApiError> {
        self.begin(ApiCall::User(id))?;
        self.state
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                body: format!("user {id} not found"),
            })
    }

    async fn confirm_adoption(&self, adopter: UserId, pet: PetId) -> Result<(), ApiError> {
        self.begin(ApiCall::ConfirmAdoption { adopter, pet })?;
        self.mark_confirmed(adopter, pet);
        Ok(())
    }

    async fn cancel_adoption(&self, pet: PetId) -> Result<(), ApiError> {
        self.begin(ApiCall::CancelAdoption(pet))
    }

    async fn chat_users(&self, me: UserId) -> Result<Vec<User>, ApiError> {
        self.begin(ApiCall::ChatUsers(me))?;
        Ok(self
            .state
            .lock()
            .contacts
            .get(&me)
            .cloned()
            .unwrap_or_default())
    }
}
