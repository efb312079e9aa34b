// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for the adoption confirm/cancel flow.
//!
//! A pet owner (Bob) receives adoption requests from adopters and answers
//! them from his chat room. Verifies:
//! - confirming calls the backend, notifies the adopter and is cached on disk
//! - the cached decision survives a restart even if the server forgets it
//! - confirm and cancel are idempotent: a second attempt is refused
//! - once a pet is adopted, other requests for it are no longer actionable
//! - backend failures leave the request pending and alert the user
//! - cancellation lasts for the session only

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use petchat::api::User;
use petchat::api::memory::{ApiCall, MemoryApi};
use petchat::chat::adoption::{ADOPTED_PETS_KEY, CONFIRMED_MESSAGES_KEY};
use petchat::chat::room::{ChatRoom, RoomConfig, RoomError, RoomEvent, confirmation_text};
use petchat::chat::{AdoptionError, AdoptionState, AdoptionTracker};
use petchat::location::DeniedLocation;
use petchat::storage::{FileStorage, KeyValueStore};
use petchat::transport::TransportEvent;
use petchat::transport::loopback::{LoopbackHub, LoopbackTransport};
use petchat_proto::message::{ChatMessage, MessageId, MessageKind, PetId, UserId};

const ALICE: UserId = UserId::new(1);
const BOB: UserId = UserId::new(2);
const CAROL: UserId = UserId::new(3);
const LUNA: PetId = PetId::new(9);

type Room = ChatRoom<LoopbackTransport, MemoryApi, FileStorage, DeniedLocation>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Owner {
    room: Room,
    events: mpsc::Receiver<RoomEvent>,
    transport_events: mpsc::Receiver<TransportEvent>,
}

impl Owner {
    /// Open Bob's room with `adopter`, loading history and connecting.
    async fn open(hub: &LoopbackHub, api: &Arc<MemoryApi>, adopter: UserId, storage: &Path) -> Self {
        let (transport, transport_events) = hub.attach(64);
        let (mut room, events) = ChatRoom::new(
            RoomConfig::new(BOB, adopter),
            transport,
            Arc::clone(api),
            AdoptionTracker::load(FileStorage::open(storage)),
            DeniedLocation,
        );
        if let Some(request) = room.mount().await {
            let result = request.fetch().await;
            room.apply_history(result);
        }
        let mut owner = Self {
            room,
            events,
            transport_events,
        };
        owner.pump().await;
        owner.drain();
        owner
    }

    async fn pump(&mut self) {
        while let Ok(event) = self.transport_events.try_recv() {
            if let Some(request) = self.room.handle_transport_event(event).await {
                let result = request.fetch().await;
                self.room.apply_history(result);
            }
        }
    }

    fn drain(&mut self) -> Vec<RoomEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn state_of(&self, id: MessageId) -> AdoptionState {
        self.room
            .view()
            .into_iter()
            .find(|v| v.id == id)
            .map(|v| v.adoption)
            .unwrap()
    }

    fn alerts(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                RoomEvent::Alert(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

fn storage_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("petchat-adoption-{}", uuid::Uuid::now_v7()))
        .join("storage.json")
}

fn request(from: UserId, text: &str) -> ChatMessage {
    ChatMessage::outgoing(
        from,
        BOB,
        MessageKind::AdoptionRequest {
            text: text.into(),
            pet_id: Some(LUNA),
        },
    )
}

fn backend() -> Arc<MemoryApi> {
    let api = Arc::new(MemoryApi::new());
    api.insert_user(User::named(ALICE, "Alice", "Martin"));
    api.insert_user(User::named(CAROL, "Carol", "Petit"));
    api
}

fn cached(path: &Path, key: &str) -> Option<Vec<i64>> {
    FileStorage::open(path)
        .get(key)
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

// ---------------------------------------------------------------------------
// Confirm
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirm_notifies_adopter_and_is_cached() {
    let hub = LoopbackHub::new();
    let api = backend();
    let path = storage_path();
    let id = api.insert_message(request(ALICE, "I would love to adopt Luna"));
    let mut bob = Owner::open(&hub, &api, ALICE, &path).await;

    let view = bob.room.view();
    assert_eq!(view[0].adoption, AdoptionState::Pending);
    assert!(view[0].can_confirm() && view[0].can_cancel());

    bob.room.confirm_adoption(id).await.unwrap();

    assert!(api.calls().contains(&ApiCall::ConfirmAdoption {
        adopter: ALICE,
        pet: LUNA
    }));
    assert_eq!(bob.state_of(id), AdoptionState::Confirmed);
    assert!(!bob.room.view()[0].can_confirm());

    let notice = hub.published().pop().unwrap();
    assert_eq!(notice.receiver_id, ALICE);
    assert_eq!(notice.kind, MessageKind::Text(confirmation_text(LUNA)));

    assert_eq!(cached(&path, CONFIRMED_MESSAGES_KEY), Some(vec![id.server().unwrap()]));
    assert_eq!(cached(&path, ADOPTED_PETS_KEY), Some(vec![9]));
}

#[tokio::test]
async fn confirmation_survives_restart_without_server_flag() {
    let hub = LoopbackHub::new();
    let path = storage_path();

    let api = backend();
    let id = api.insert_message(request(ALICE, "Luna please"));
    let mut bob = Owner::open(&hub, &api, ALICE, &path).await;
    bob.room.confirm_adoption(id).await.unwrap();
    drop(bob);

    // A backend that never recorded the decision.
    let forgetful = backend();
    let same = forgetful.insert_message(request(ALICE, "Luna please"));
    assert_eq!(same, id);
    let mut bob = Owner::open(&hub, &forgetful, ALICE, &path).await;

    assert_eq!(bob.state_of(id), AdoptionState::Confirmed);
    let err = bob.room.confirm_adoption(id).await.unwrap_err();
    assert!(matches!(
        err,
        RoomError::Adoption(AdoptionError::AlreadyConfirmed(m)) if m == id
    ));
    assert_eq!(bob.alerts().len(), 1);
    assert!(
        !forgetful
            .calls()
            .iter()
            .any(|c| matches!(c, ApiCall::ConfirmAdoption { .. }))
    );
}

#[tokio::test]
async fn server_flag_is_learned_into_cache() {
    let hub = LoopbackHub::new();
    let path = storage_path();
    let api = backend();
    let mut confirmed = request(ALICE, "Luna?");
    confirmed.confirmed = Some(true);
    let id = api.insert_message(confirmed);

    let bob = Owner::open(&hub, &api, ALICE, &path).await;
    assert_eq!(bob.state_of(id), AdoptionState::Confirmed);
    assert_eq!(cached(&path, CONFIRMED_MESSAGES_KEY), Some(vec![id.server().unwrap()]));
}

#[tokio::test]
async fn cancel_after_confirm_is_refused() {
    let hub = LoopbackHub::new();
    let path = storage_path();
    let api = backend();
    let id = api.insert_message(request(ALICE, "Luna?"));
    let mut bob = Owner::open(&hub, &api, ALICE, &path).await;

    bob.room.confirm_adoption(id).await.unwrap();
    bob.drain();
    let err = bob.room.cancel_adoption(id).await.unwrap_err();
    assert!(matches!(
        err,
        RoomError::Adoption(AdoptionError::AlreadyConfirmed(_))
    ));
    assert_eq!(bob.alerts().len(), 1);
    assert!(!api.calls().contains(&ApiCall::CancelAdoption(LUNA)));
}

#[tokio::test]
async fn adopted_pet_closes_other_requests() {
    let hub = LoopbackHub::new();
    let path = storage_path();
    let api = backend();
    let alice_request = api.insert_message(request(ALICE, "Luna for me"));
    let carol_request = api.insert_message(request(CAROL, "Luna for me too"));

    let mut with_alice = Owner::open(&hub, &api, ALICE, &path).await;
    with_alice.room.confirm_adoption(alice_request).await.unwrap();

    let mut with_carol = Owner::open(&hub, &api, CAROL, &path).await;
    assert_eq!(
        with_carol.state_of(carol_request),
        AdoptionState::PetUnavailable
    );
    let err = with_carol
        .room
        .confirm_adoption(carol_request)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RoomError::Adoption(AdoptionError::AlreadyAdopted(pet)) if pet == LUNA
    ));
}

#[tokio::test]
async fn backend_failure_keeps_request_pending() {
    let hub = LoopbackHub::new();
    let path = storage_path();
    let api = backend();
    let id = api.insert_message(request(ALICE, "Luna?"));
    let mut bob = Owner::open(&hub, &api, ALICE, &path).await;

    api.set_failing(true);
    let err = bob.room.confirm_adoption(id).await.unwrap_err();
    assert!(matches!(err, RoomError::Api(_)));

    let alerts = bob.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].starts_with("Could not confirm the adoption"));
    assert_eq!(bob.state_of(id), AdoptionState::Pending);
    assert_eq!(cached(&path, CONFIRMED_MESSAGES_KEY), None);
    assert!(hub.published().is_empty());

    // A retry after the backend recovers goes through.
    api.set_failing(false);
    bob.room.confirm_adoption(id).await.unwrap();
    assert_eq!(bob.state_of(id), AdoptionState::Confirmed);
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_closes_request_for_this_session_only() {
    let hub = LoopbackHub::new();
    let path = storage_path();
    let api = backend();
    let id = api.insert_message(request(ALICE, "Luna?"));
    let mut bob = Owner::open(&hub, &api, ALICE, &path).await;

    bob.room.cancel_adoption(id).await.unwrap();
    assert!(api.calls().contains(&ApiCall::CancelAdoption(LUNA)));
    assert_eq!(bob.state_of(id), AdoptionState::Cancelled);
    bob.drain();

    let err = bob.room.confirm_adoption(id).await.unwrap_err();
    assert!(matches!(
        err,
        RoomError::Adoption(AdoptionError::AlreadyCancelled(_))
    ));
    let err = bob.room.cancel_adoption(id).await.unwrap_err();
    assert!(matches!(
        err,
        RoomError::Adoption(AdoptionError::AlreadyCancelled(_))
    ));
    assert_eq!(bob.alerts().len(), 2);
    drop(bob);

    let bob = Owner::open(&hub, &api, ALICE, &path).await;
    assert_eq!(bob.state_of(id), AdoptionState::Pending);
}

#[tokio::test]
async fn adopter_sees_no_actions_on_own_request() {
    let hub = LoopbackHub::new();
    let api = backend();
    let id = api.insert_message(request(ALICE, "Luna?"));

    let (transport, mut transport_events) = hub.attach(64);
    let (mut alice, _events) = ChatRoom::new(
        RoomConfig::new(ALICE, BOB),
        transport,
        Arc::clone(&api),
        AdoptionTracker::load(FileStorage::open(storage_path())),
        DeniedLocation,
    );
    alice.load_history().await;
    while let Ok(event) = transport_events.try_recv() {
        let _ = alice.handle_transport_event(event).await;
    }

    let view = alice.view();
    assert_eq!(view[0].adoption, AdoptionState::NotApplicable);
    assert!(!view[0].can_confirm());
    let err = alice.confirm_adoption(id).await.unwrap_err();
    assert!(matches!(
        err,
        RoomError::Adoption(AdoptionError::NotReceiver(_))
    ));
}
