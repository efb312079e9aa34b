//! Chat room controller.
//!
//! A [`ChatRoom`] is one conversation between the local user and a peer.
//! It owns the message log, applies transport events and history
//! snapshots to it, runs the send and adoption flows, and reports every
//! visible change as a [`RoomEvent`].
//!
//! The room never spawns work itself. History loads are handed back to
//! the caller as a [`HistoryRequest`] so the caller decides whether to
//! await it inline or run it concurrently (see [`crate::session`]).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use petchat_proto::message::{
    ChatMessage, Conversation, MessageId, MessageKind, PetId, UserId, ValidationError,
};

use crate::api::{ApiError, ChatApi, Upload, User};
use crate::chat::adoption::{AdoptionError, AdoptionState, AdoptionTracker};
use crate::chat::store::{Ingest, MessageStatus, MessageStore, StoredMessage};
use crate::location::{LocationError, LocationProvider};
use crate::storage::KeyValueStore;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Errors from room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// No transport session is active.
    #[error("not connected")]
    NotConnected,

    /// The message failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Publishing failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A REST call failed.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// No position could be obtained.
    #[error("location error: {0}")]
    Location(#[from] LocationError),

    /// An adoption guard refused the action.
    #[error("adoption refused: {0}")]
    Adoption(#[from] AdoptionError),

    /// No such message in this room.
    #[error("no message {0} in this conversation")]
    UnknownMessage(MessageId),
}

/// Static settings of a room.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// The local user.
    pub me: UserId,
    /// The other participant.
    pub peer: UserId,
    /// Sent once, on the first successful connection.
    pub initial_message: Option<String>,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl RoomConfig {
    /// A room between `me` and `peer` with no initial message.
    #[must_use]
    pub const fn new(me: UserId, peer: UserId) -> Self {
        Self {
            me,
            peer,
            initial_message: None,
            event_buffer: 256,
        }
    }
}

/// A message as it should be displayed.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    /// Message id (local placeholder until the server assigns one).
    pub id: MessageId,
    /// Who sent it.
    pub sender_id: UserId,
    /// `You`, the sender's first name, or `User <id>`.
    pub sender_label: String,
    /// Whether the local user sent it.
    pub is_own: bool,
    /// Content.
    pub kind: MessageKind,
    /// Delivery state.
    pub status: MessageStatus,
    /// Adoption state for the local user.
    pub adoption: AdoptionState,
    /// Creation time, if known.
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageView {
    /// Whether the confirm action is on offer.
    #[must_use]
    pub const fn can_confirm(&self) -> bool {
        self.adoption.is_actionable()
    }

    /// Whether the cancel action is on offer.
    #[must_use]
    pub const fn can_cancel(&self) -> bool {
        self.adoption.is_actionable()
    }

    /// One-line text rendering of the content.
    #[must_use]
    pub fn body(&self) -> String {
        match &self.kind {
            MessageKind::Text(text) => text.clone(),
            MessageKind::Image { url } => format!("[image] {url}"),
            MessageKind::Location { lat, lng } => {
                format!("[location] https://www.google.com/maps?q={lat},{lng}")
            }
            MessageKind::AdoptionRequest { text, pet_id } => match pet_id {
                Some(pet) => format!("[adoption request, pet #{pet}] {text}"),
                None => format!("[adoption request] {text}"),
            },
            MessageKind::Other { kind, content } => format!("[{kind}] {content}"),
        }
    }
}

/// Visible changes reported by a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// The transport session came up or went down.
    Connection {
        /// Whether a session is active now.
        connected: bool,
    },
    /// The peer's profile was loaded.
    PeerResolved(User),
    /// A message was added at the end of the log.
    Appended(MessageView),
    /// A message changed (status, id, adoption state).
    Updated {
        /// The id the message had before the change.
        previous: MessageId,
        /// The message now.
        view: MessageView,
    },
    /// A message was deleted.
    Removed(MessageId),
    /// The log was replaced by a history snapshot.
    Reloaded(Vec<MessageView>),
    /// The log grew; the view should follow the newest message.
    ScrollToLatest,
    /// Something the user should be told about.
    Alert(String),
    /// A requested action failed.
    Failed {
        /// What was attempted.
        action: String,
        /// Why it failed.
        error: String,
    },
}

/// A pending history load, detached from the room.
pub struct HistoryRequest<A> {
    generation: u64,
    api: Arc<A>,
    me: UserId,
    peer: UserId,
}

impl<A: ChatApi> HistoryRequest<A> {
    /// Run the REST call.
    pub async fn fetch(self) -> HistoryResult {
        let result = self.api.history(self.me, self.peer).await;
        HistoryResult {
            generation: self.generation,
            result,
        }
    }
}

/// Outcome of a [`HistoryRequest`], to be fed to [`ChatRoom::apply_history`].
#[derive(Debug)]
pub struct HistoryResult {
    generation: u64,
    result: Result<Vec<ChatMessage>, ApiError>,
}

/// Text sent to the adopter after a confirmation.
#[must_use]
pub fn confirmation_text(pet: PetId) -> String {
    format!("Your adoption request for pet #{pet} has been confirmed!")
}

/// One conversation and everything needed to drive it.
pub struct ChatRoom<T, A, K, L>
where
    K: KeyValueStore,
{
    me: UserId,
    peer: UserId,
    conversation: Conversation,
    initial_message: Option<String>,
    initial_sent: bool,
    transport: T,
    api: Arc<A>,
    adoption: AdoptionTracker<K>,
    location: L,
    store: MessageStore,
    peer_profile: Option<User>,
    connected: bool,
    /// Number of sessions seen so far.
    sessions: u64,
    /// Generation of the newest history request; older results are stale.
    history_generation: u64,
    events: mpsc::Sender<RoomEvent>,
}

impl<T, A, K, L> ChatRoom<T, A, K, L>
where
    T: Transport,
    A: ChatApi,
    K: KeyValueStore,
    L: LocationProvider,
{
    /// Create a room and the receiver of its events.
    pub fn new(
        config: RoomConfig,
        transport: T,
        api: Arc<A>,
        adoption: AdoptionTracker<K>,
        location: L,
    ) -> (Self, mpsc::Receiver<RoomEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let initial_message = config
            .initial_message
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        let room = Self {
            me: config.me,
            peer: config.peer,
            conversation: Conversation::new(config.me, config.peer),
            initial_message,
            initial_sent: false,
            transport,
            api,
            adoption,
            location,
            store: MessageStore::new(),
            peer_profile: None,
            connected: false,
            sessions: 0,
            history_generation: 0,
            events: event_tx,
        };
        (room, event_rx)
    }

    /// The local user.
    #[must_use]
    pub const fn me(&self) -> UserId {
        self.me
    }

    /// The other participant.
    #[must_use]
    pub const fn peer(&self) -> UserId {
        self.peer
    }

    /// The peer's profile, once loaded.
    #[must_use]
    pub const fn peer_profile(&self) -> Option<&User> {
        self.peer_profile.as_ref()
    }

    /// Whether a session is active and the transport agrees.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected && self.transport.is_connected()
    }

    /// The raw message log.
    #[must_use]
    pub const fn store(&self) -> &MessageStore {
        &self.store
    }

    /// The adoption tracker.
    #[must_use]
    pub const fn adoption(&self) -> &AdoptionTracker<K> {
        &self.adoption
    }

    /// Load the peer profile and decide when history is fetched.
    ///
    /// Without an initial message, history is requested right away. With
    /// one, it waits for the first connection so the message is sent
    /// before the snapshot is taken.
    pub async fn mount(&mut self) -> Option<HistoryRequest<A>> {
        tracing::info!(me = %self.me, peer = %self.peer, "mounting chat room");
        match self.api.user(self.peer).await {
            Ok(user) => {
                self.peer_profile = Some(user.clone());
                self.emit(RoomEvent::PeerResolved(user));
            }
            Err(e) => tracing::warn!(peer = %self.peer, err = %e, "could not load peer profile"),
        }
        if self.initial_message.is_some() {
            None
        } else {
            Some(self.history_request())
        }
    }

    /// Disconnect the transport.
    pub async fn unmount(&mut self) {
        self.transport.disconnect().await;
        self.connected = false;
        tracing::info!(peer = %self.peer, "chat room unmounted");
    }

    /// Start a new history load, superseding any in flight.
    pub fn history_request(&mut self) -> HistoryRequest<A> {
        self.history_generation += 1;
        HistoryRequest {
            generation: self.history_generation,
            api: Arc::clone(&self.api),
            me: self.me,
            peer: self.peer,
        }
    }

    /// Fetch and apply history inline.
    pub async fn load_history(&mut self) {
        let result = self.history_request().fetch().await;
        self.apply_history(result);
    }

    /// Apply a history snapshot. Results of superseded requests are dropped.
    pub fn apply_history(&mut self, result: HistoryResult) {
        if result.generation != self.history_generation {
            tracing::debug!(
                generation = result.generation,
                current = self.history_generation,
                "discarding stale history"
            );
            return;
        }
        let history = match result.result {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(peer = %self.peer, err = %e, "history load failed");
                return;
            }
        };

        self.adoption.reconcile(&history);
        let before = self.store.conversation(self.conversation).count();
        self.store
            .replace_with_history(self.conversation, history, self.me);
        let views = self.view();
        tracing::debug!(count = views.len(), "history applied");
        let grew = views.len() > before;
        self.emit(RoomEvent::Reloaded(views));
        if grew {
            self.emit(RoomEvent::ScrollToLatest);
        }
    }

    /// React to a transport event. May ask for a history load.
    pub async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Option<HistoryRequest<A>> {
        match event {
            TransportEvent::Connected => {
                self.connected = true;
                self.sessions += 1;
                tracing::info!(sessions = self.sessions, "chat room connected");
                self.emit(RoomEvent::Connection { connected: true });

                if !self.initial_sent {
                    if let Some(text) = self.initial_message.clone() {
                        self.initial_sent = true;
                        if let Err(e) = self
                            .send_kind(self.peer, MessageKind::Text(text), true)
                            .await
                        {
                            tracing::warn!(err = %e, "initial message not sent");
                        }
                        return Some(self.history_request());
                    }
                }
                (self.sessions > 1).then(|| self.history_request())
            }
            TransportEvent::Disconnected => {
                self.connected = false;
                tracing::warn!("chat room disconnected");
                self.emit(RoomEvent::Connection { connected: false });
                None
            }
            TransportEvent::Message(message) => {
                self.receive(message);
                None
            }
        }
    }

    fn receive(&mut self, message: ChatMessage) {
        if !self.conversation.contains(&message) {
            tracing::trace!(
                sender = %message.sender_id,
                receiver = %message.receiver_id,
                "message for another conversation"
            );
            return;
        }
        match self.store.ingest(message, self.me) {
            Ingest::Appended(id) => self.emit_appended(id),
            Ingest::Reconciled { previous, current } => {
                self.adoption.rekey(previous, current);
                self.emit_updated(previous, current);
            }
            Ingest::Duplicate(id) => tracing::debug!(%id, "duplicate message ignored"),
        }
    }

    /// Send a text message to the peer.
    ///
    /// # Errors
    ///
    /// Fails on blank text, when disconnected, or when publishing fails.
    pub async fn send_text(&mut self, text: &str) -> Result<MessageId, RoomError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::Empty.into());
        }
        self.send_kind(self.peer, MessageKind::Text(text.to_string()), false)
            .await
    }

    /// Upload an image and send its URL to the peer.
    ///
    /// # Errors
    ///
    /// Fails when disconnected, when the upload fails, or when publishing
    /// fails.
    pub async fn send_image(&mut self, upload: Upload) -> Result<MessageId, RoomError> {
        self.ensure_connected()?;
        let url = match self.api.upload_image(upload).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(err = %e, "image upload failed");
                self.alert(format!("Could not upload the image: {e}"));
                return Err(e.into());
            }
        };
        self.send_kind(self.peer, MessageKind::Image { url }, false)
            .await
    }

    /// Send the device's current position to the peer.
    ///
    /// # Errors
    ///
    /// Fails when disconnected, when no position is available, or when
    /// publishing fails.
    pub async fn send_location(&mut self) -> Result<MessageId, RoomError> {
        self.ensure_connected()?;
        let position = match self.location.current_position().await {
            Ok(position) => position,
            Err(e) => {
                tracing::warn!(err = %e, "geolocation failed");
                return Err(e.into());
            }
        };
        self.send_kind(
            self.peer,
            MessageKind::Location {
                lat: position.lat,
                lng: position.lng,
            },
            false,
        )
        .await
    }

    /// Delete a message locally and, if the server knows it, remotely.
    ///
    /// The local removal stands even if the REST call fails.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids and when the REST call fails.
    pub async fn delete_message(&mut self, id: MessageId) -> Result<(), RoomError> {
        if self.store.remove(&id).is_none() {
            return Err(RoomError::UnknownMessage(id));
        }
        self.emit(RoomEvent::Removed(id));
        if let Some(server_id) = id.server() {
            if let Err(e) = self.api.delete_message(server_id).await {
                tracing::warn!(%id, err = %e, "remote delete failed");
                return Err(e.into());
            }
        }
        tracing::debug!(%id, "message deleted");
        Ok(())
    }

    /// Confirm an adoption request addressed to the local user.
    ///
    /// On success the decision is cached durably and the adopter is told
    /// over the transport.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids, when a guard refuses, or when the REST call
    /// fails. Refusals and failures are also raised as alerts.
    pub async fn confirm_adoption(&mut self, id: MessageId) -> Result<(), RoomError> {
        let message = self.find(id)?.message.clone();
        let pet = match self.adoption.check_confirm(&message, self.me) {
            Ok(pet) => pet,
            Err(e) => {
                self.alert(e.to_string());
                return Err(e.into());
            }
        };

        if let Err(e) = self.api.confirm_adoption(message.sender_id, pet).await {
            tracing::warn!(%id, %pet, err = %e, "adoption confirmation failed");
            self.alert(format!("Could not confirm the adoption: {e}"));
            return Err(e.into());
        }
        if let Err(e) = self.adoption.record_confirmed(id, pet) {
            tracing::warn!(%id, %pet, err = %e, "adoption confirmed but not cached");
        }
        tracing::info!(%id, %pet, adopter = %message.sender_id, "adoption confirmed");
        self.emit_updated(id, id);
        let closed: Vec<MessageId> = self
            .store
            .conversation(self.conversation)
            .map(|entry| &entry.message)
            .filter(|m| {
                m.id != id && m.kind.is_adoption_request() && m.kind.pet_id() == Some(pet)
            })
            .map(|m| m.id)
            .collect();
        for other in closed {
            self.emit_updated(other, other);
        }

        let notice = MessageKind::Text(confirmation_text(pet));
        if let Err(e) = self.send_kind(message.sender_id, notice, false).await {
            tracing::warn!(err = %e, "confirmation notice not sent");
        }
        Ok(())
    }

    /// Cancel an adoption request addressed to the local user.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids, when a guard refuses, or when the REST call
    /// fails. Refusals and failures are also raised as alerts.
    pub async fn cancel_adoption(&mut self, id: MessageId) -> Result<(), RoomError> {
        let message = self.find(id)?.message.clone();
        let pet = match self.adoption.check_cancel(&message, self.me) {
            Ok(pet) => pet,
            Err(e) => {
                self.alert(e.to_string());
                return Err(e.into());
            }
        };

        if let Err(e) = self.api.cancel_adoption(pet).await {
            tracing::warn!(%id, %pet, err = %e, "adoption cancellation failed");
            self.alert(format!("Could not cancel the adoption: {e}"));
            return Err(e.into());
        }
        self.adoption.record_cancelled(id);
        tracing::info!(%id, %pet, "adoption cancelled");
        self.emit_updated(id, id);
        Ok(())
    }

    /// The conversation as it should be displayed, oldest first.
    #[must_use]
    pub fn view(&self) -> Vec<MessageView> {
        self.store
            .conversation(self.conversation)
            .map(|entry| self.render(entry))
            .collect()
    }

    fn render(&self, entry: &StoredMessage) -> MessageView {
        let message = &entry.message;
        MessageView {
            id: message.id,
            sender_id: message.sender_id,
            sender_label: self.sender_label(message),
            is_own: message.sender_id == self.me,
            kind: message.kind.clone(),
            status: entry.status.clone(),
            adoption: self.adoption.state(message, self.me),
            timestamp: message.timestamp,
        }
    }

    fn sender_label(&self, message: &ChatMessage) -> String {
        if message.sender_id == self.me {
            return "You".to_string();
        }
        let non_blank = |name: &Option<String>| {
            name.as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
        };
        self.peer_profile
            .as_ref()
            .filter(|profile| profile.id == message.sender_id)
            .and_then(|profile| non_blank(&profile.firstname))
            .or_else(|| {
                message
                    .sender
                    .as_ref()
                    .and_then(|sender| non_blank(&sender.firstname))
            })
            .unwrap_or_else(|| format!("User {}", message.sender_id))
    }

    fn find(&self, id: MessageId) -> Result<&StoredMessage, RoomError> {
        self.store
            .get(&id)
            .filter(|entry| self.conversation.contains(&entry.message))
            .ok_or(RoomError::UnknownMessage(id))
    }

    fn ensure_connected(&self) -> Result<(), RoomError> {
        if self.is_connected() {
            Ok(())
        } else {
            tracing::error!(peer = %self.peer, "cannot send while disconnected");
            Err(RoomError::NotConnected)
        }
    }

    /// Render optimistically, then publish.
    async fn send_kind(
        &mut self,
        receiver: UserId,
        kind: MessageKind,
        pinned: bool,
    ) -> Result<MessageId, RoomError> {
        self.ensure_connected()?;
        let message = ChatMessage::outgoing(self.me, receiver, kind);
        message.validate()?;

        let id = self.store.append_local(message.clone(), pinned);
        self.emit_appended(id);

        match self.transport.publish(&message).await {
            Ok(()) => {
                let still_pending = self
                    .store
                    .get(&id)
                    .is_some_and(|entry| entry.status == MessageStatus::Pending);
                if still_pending {
                    self.store.set_status(&id, MessageStatus::Sent);
                    self.emit_updated(id, id);
                }
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(%id, err = %e, "send failed");
                self.store
                    .set_status(&id, MessageStatus::Failed(e.to_string()));
                self.emit_updated(id, id);
                Err(e.into())
            }
        }
    }

    fn emit_appended(&self, id: MessageId) {
        let Some(entry) = self.store.get(&id) else {
            return;
        };
        if self.conversation.contains(&entry.message) {
            self.emit(RoomEvent::Appended(self.render(entry)));
            self.emit(RoomEvent::ScrollToLatest);
        }
    }

    fn emit_updated(&self, previous: MessageId, current: MessageId) {
        let Some(entry) = self.store.get(&current) else {
            return;
        };
        if self.conversation.contains(&entry.message) {
            self.emit(RoomEvent::Updated {
                previous,
                view: self.render(entry),
            });
        }
    }

    /// Report that `action` failed with `error`.
    pub fn report_failure(&self, action: &str, error: &RoomError) {
        self.emit(RoomEvent::Failed {
            action: action.to_string(),
            error: error.to_string(),
        });
    }

    fn alert(&self, text: String) {
        tracing::info!(alert = %text, "room alert");
        self.emit(RoomEvent::Alert(text));
    }

    fn emit(&self, event: RoomEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::warn!(?event, "room event dropped, receiver is lagging");
        }
    }
}
