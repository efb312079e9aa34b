//! Adoption request state machine with a durable local cache.
//!
//! An adoption request addressed to the local user starts `Pending`. The
//! receiver may confirm it (the pet goes to the requester) or cancel it.
//! Confirmed message ids and adopted pet ids are written through to a
//! [`KeyValueStore`] so a restarted client does not offer the actions
//! again; server-side `confirmed` flags seen in history are merged into
//! the same sets. Entries are only ever added.

use std::collections::HashSet;

use petchat_proto::message::{ChatMessage, MessageId, PetId, UserId};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::storage::{KeyValueStore, StorageError};

/// Storage key of the confirmed adoption message ids.
pub const CONFIRMED_MESSAGES_KEY: &str = "confirmedMessageIds";
/// Storage key of the adopted pet ids.
pub const ADOPTED_PETS_KEY: &str = "adoptedPetIds";

/// Where an adoption request stands from the receiver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptionState {
    /// Not an adoption request, or not addressed to the local user.
    NotApplicable,
    /// Awaiting the receiver's decision.
    Pending,
    /// Accepted; the pet is adopted.
    Confirmed,
    /// Withdrawn by the receiver in this session.
    Cancelled,
    /// The pet was already adopted through another request.
    PetUnavailable,
}

impl AdoptionState {
    /// Whether confirm and cancel are on offer.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Why an adoption action was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdoptionError {
    /// The message is not an adoption request.
    #[error("message {0} is not an adoption request")]
    NotAnAdoptionRequest(MessageId),

    /// Only the addressee of a request may answer it.
    #[error("only the receiver of request {0} can answer it")]
    NotReceiver(MessageId),

    /// The request names no pet.
    #[error("adoption request {0} does not name a pet")]
    MissingPet(MessageId),

    /// The pet has already been adopted.
    #[error("pet {0} has already been adopted")]
    AlreadyAdopted(PetId),

    /// The request was already confirmed.
    #[error("adoption request {0} was already confirmed")]
    AlreadyConfirmed(MessageId),

    /// The request was already cancelled.
    #[error("adoption request {0} was already cancelled")]
    AlreadyCancelled(MessageId),
}

/// Tracks adoption decisions and mirrors them into durable storage.
pub struct AdoptionTracker<K: KeyValueStore> {
    storage: K,
    confirmed: HashSet<MessageId>,
    adopted: HashSet<PetId>,
    cancelled: HashSet<MessageId>,
}

impl<K: KeyValueStore> AdoptionTracker<K> {
    /// Load the cached sets from `storage`.
    ///
    /// Unreadable or corrupt entries are logged and treated as empty.
    pub fn load(storage: K) -> Self {
        let confirmed = read_set(&storage, CONFIRMED_MESSAGES_KEY);
        let adopted = read_set(&storage, ADOPTED_PETS_KEY);
        tracing::debug!(
            confirmed = confirmed.len(),
            adopted = adopted.len(),
            "adoption cache loaded"
        );
        Self {
            storage,
            confirmed,
            adopted,
            cancelled: HashSet::new(),
        }
    }

    /// State of `message` for the local user `me`.
    #[must_use]
    pub fn state(&self, message: &ChatMessage, me: UserId) -> AdoptionState {
        if !message.kind.is_adoption_request() || message.receiver_id != me {
            return AdoptionState::NotApplicable;
        }
        if self.is_confirmed(message) {
            return AdoptionState::Confirmed;
        }
        if self.cancelled.contains(&message.id) {
            return AdoptionState::Cancelled;
        }
        match message.kind.pet_id() {
            Some(pet) if self.adopted.contains(&pet) => AdoptionState::PetUnavailable,
            _ => AdoptionState::Pending,
        }
    }

    /// Whether the server flag or the local cache marks `message` confirmed.
    #[must_use]
    pub fn is_confirmed(&self, message: &ChatMessage) -> bool {
        message.is_confirmed() || self.confirmed.contains(&message.id)
    }

    /// Whether `pet` has been adopted.
    #[must_use]
    pub fn is_adopted(&self, pet: PetId) -> bool {
        self.adopted.contains(&pet)
    }

    /// Check that `me` may confirm `message`; returns the pet it names.
    ///
    /// # Errors
    ///
    /// Returns the [`AdoptionError`] describing the first failed guard.
    pub fn check_confirm(&self, message: &ChatMessage, me: UserId) -> Result<PetId, AdoptionError> {
        self.check_open(message, me)
    }

    /// Check that `me` may cancel `message`; returns the pet it names.
    ///
    /// # Errors
    ///
    /// Returns the [`AdoptionError`] describing the first failed guard.
    pub fn check_cancel(&self, message: &ChatMessage, me: UserId) -> Result<PetId, AdoptionError> {
        self.check_open(message, me)
    }

    /// Both actions need an open request addressed to `me` naming a pet
    /// that is still available.
    fn check_open(&self, message: &ChatMessage, me: UserId) -> Result<PetId, AdoptionError> {
        if !message.kind.is_adoption_request() {
            return Err(AdoptionError::NotAnAdoptionRequest(message.id));
        }
        if message.receiver_id != me {
            return Err(AdoptionError::NotReceiver(message.id));
        }
        let pet = message
            .kind
            .pet_id()
            .ok_or(AdoptionError::MissingPet(message.id))?;
        if self.is_confirmed(message) {
            return Err(AdoptionError::AlreadyConfirmed(message.id));
        }
        if self.cancelled.contains(&message.id) {
            return Err(AdoptionError::AlreadyCancelled(message.id));
        }
        if self.adopted.contains(&pet) {
            return Err(AdoptionError::AlreadyAdopted(pet));
        }
        Ok(pet)
    }

    /// Record a successful confirmation and persist both sets.
    ///
    /// The in-memory state is updated even when persisting fails.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the cache could not be written.
    pub fn record_confirmed(&mut self, message: MessageId, pet: PetId) -> Result<(), StorageError> {
        self.confirmed.insert(message);
        self.adopted.insert(pet);
        self.persist()
    }

    /// Record a cancellation for this session.
    pub fn record_cancelled(&mut self, message: MessageId) {
        self.cancelled.insert(message);
    }

    /// A message known under the placeholder `previous` now has the server
    /// id `current`. Decisions taken on the placeholder move over, and a
    /// confirmation becomes durable.
    pub fn rekey(&mut self, previous: MessageId, current: MessageId) {
        if previous == current || current.is_local() {
            return;
        }
        if self.cancelled.remove(&previous) {
            self.cancelled.insert(current);
        }
        if self.confirmed.remove(&previous) {
            self.confirmed.insert(current);
            if let Err(e) = self.persist() {
                tracing::warn!(%current, err = %e, "could not persist rekeyed confirmation");
            }
            tracing::debug!(%previous, %current, "confirmation moved to server id");
        }
    }

    /// Merge server-confirmed requests from `history` into the cache.
    ///
    /// Confirmations taken on a placeholder id are moved to the server id
    /// the history carries for the same `clientId`. Returns how many new
    /// confirmations were learned. Only writes to storage when either set
    /// changed.
    pub fn reconcile(&mut self, history: &[ChatMessage]) -> usize {
        for msg in history.iter().filter(|m| !m.id.is_local()) {
            if let Some(client_id) = msg.client_id {
                self.rekey(MessageId::Local(client_id), msg.id);
            }
        }

        let mut learned = 0;
        let mut changed = false;
        for msg in history
            .iter()
            .filter(|m| m.kind.is_adoption_request() && m.is_confirmed())
        {
            if !msg.id.is_local() && self.confirmed.insert(msg.id) {
                learned += 1;
                changed = true;
            }
            if let Some(pet) = msg.kind.pet_id() {
                changed |= self.adopted.insert(pet);
            }
        }
        if changed {
            if let Err(e) = self.persist() {
                tracing::warn!(err = %e, "could not persist reconciled adoption cache");
            }
            tracing::debug!(learned, "adoption cache reconciled with history");
        }
        learned
    }

    fn persist(&self) -> Result<(), StorageError> {
        let mut ids: Vec<i64> = self.confirmed.iter().filter_map(MessageId::server).collect();
        ids.sort_unstable();
        let mut pets: Vec<PetId> = self.adopted.iter().copied().collect();
        pets.sort_unstable();
        write_list(&self.storage, CONFIRMED_MESSAGES_KEY, &ids)?;
        write_list(&self.storage, ADOPTED_PETS_KEY, &pets)
    }
}

fn read_set<K, T>(storage: &K, key: &str) -> HashSet<T>
where
    K: KeyValueStore,
    T: DeserializeOwned + Eq + std::hash::Hash,
{
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return HashSet::new(),
        Err(e) => {
            tracing::warn!(key, err = %e, "could not read adoption cache");
            return HashSet::new();
        }
    };
    match serde_json::from_str::<Vec<T>>(&raw) {
        Ok(items) => items.into_iter().collect(),
        Err(e) => {
            tracing::warn!(key, err = %e, "ignoring corrupt adoption cache entry");
            HashSet::new()
        }
    }
}

fn write_list<K: KeyValueStore, T: Serialize>(
    storage: &K,
    key: &str,
    items: &[T],
) -> Result<(), StorageError> {
    storage.set(key, &serde_json::to_string(items)?)
}
