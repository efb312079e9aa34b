// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for the HTTP client of the marketplace REST API.
//!
//! Runs `HttpChatApi` against the in-process fake backend and checks the
//! paths, query strings, headers and bodies it produces, plus how error
//! statuses come back. The contact list is exercised over the same client.

mod support;

use std::sync::Arc;
use std::time::Duration;

use petchat::api::http::HttpChatApi;
use petchat::api::{ApiError, ChatApi, Upload, User};
use petchat::chat::ConversationList;
use petchat_proto::message::{ChatMessage, MessageKind, PetId, UserId};

use support::{FakeBackend, token_for};

const ALICE: UserId = UserId::new(1);
const BOB: UserId = UserId::new(2);
const CAROL: UserId = UserId::new(3);
const LUNA: PetId = PetId::new(9);

fn api_for(backend: &FakeBackend, user: i64) -> HttpChatApi {
    HttpChatApi::new(
        &backend.api_url(),
        Some(token_for(user)),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn text(from: UserId, to: UserId, body: &str) -> ChatMessage {
    ChatMessage::outgoing(from, to, MessageKind::Text(body.to_string()))
}

fn adoption_request(from: UserId, to: UserId) -> ChatMessage {
    ChatMessage::outgoing(
        from,
        to,
        MessageKind::AdoptionRequest {
            text: "I'd love to adopt Luna".into(),
            pet_id: Some(LUNA),
        },
    )
}

#[tokio::test]
async fn history_returns_only_the_conversation() {
    let backend = FakeBackend::start().await;
    backend.state.insert_message(text(ALICE, BOB, "hi bob"));
    backend.state.insert_message(text(ALICE, CAROL, "hi carol"));
    backend.state.insert_message(text(BOB, ALICE, "hi alice"));

    let history = api_for(&backend, 1).history(ALICE, BOB).await.unwrap();

    let bodies: Vec<String> = history.iter().map(|m| m.kind.wire_content()).collect();
    assert_eq!(bodies, vec!["hi bob", "hi alice"]);
    assert!(history.iter().all(|m| m.id.server().is_some()));

    let requests = backend.state.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/api/messages/history/1/2");
    assert_eq!(
        requests[0].authorization.as_deref(),
        Some(format!("Bearer {}", token_for(1)).as_str())
    );
}

#[tokio::test]
async fn delete_reports_missing_messages() {
    let backend = FakeBackend::start().await;
    let saved = backend.state.insert_message(text(ALICE, BOB, "oops"));
    let id = saved.id.server().unwrap();
    let api = api_for(&backend, 1);

    api.delete_message(id).await.unwrap();
    assert!(backend.state.messages().is_empty());

    let err = api.delete_message(id).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 404, .. }));

    let paths: Vec<String> = backend
        .state
        .requests()
        .into_iter()
        .map(|r| format!("{} {}", r.method, r.path))
        .collect();
    assert_eq!(paths, vec![format!("DELETE /api/messages/{id}"); 2]);
}

#[tokio::test]
async fn upload_sends_multipart_file_and_returns_url() {
    let backend = FakeBackend::start().await;
    let upload = Upload {
        file_name: "luna.png".into(),
        bytes: vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3],
    };

    let url = api_for(&backend, 1).upload_image(upload).await.unwrap();

    assert_eq!(url, "/uploads/luna.png");
    assert_eq!(backend.state.uploads(), vec![("luna.png".to_string(), 8)]);
    let requests = backend.state.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/api/messages/upload");
}

#[tokio::test]
async fn user_profile_is_fetched_by_id() {
    let backend = FakeBackend::start().await;
    backend.state.insert_user(User::named(BOB, "Bob", "Keeper"));
    let api = api_for(&backend, 1);

    let bob = api.user(BOB).await.unwrap();
    assert_eq!(bob.display_name(), "Bob Keeper");
    assert_eq!(bob.image, None);

    let err = api.user(CAROL).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 404, .. }));
}

#[tokio::test]
async fn confirm_passes_adopter_and_pet_as_query() {
    let backend = FakeBackend::start().await;
    backend.state.insert_message(adoption_request(ALICE, BOB));
    backend.state.insert_message(adoption_request(CAROL, BOB));

    api_for(&backend, 2)
        .confirm_adoption(ALICE, LUNA)
        .await
        .unwrap();

    let requests = backend.state.requests();
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/api/adoptions/confirm");
    assert_eq!(request.query.as_deref(), Some("adopterId=1&petId=9"));

    // Only Alice's request is marked; Carol's stays open on the server.
    let flags: Vec<(UserId, bool)> = backend
        .state
        .messages()
        .iter()
        .map(|m| (m.sender_id, m.is_confirmed()))
        .collect();
    assert_eq!(flags, vec![(ALICE, true), (CAROL, false)]);

    // The flag shows up in history.
    let history = api_for(&backend, 2).history(BOB, ALICE).await.unwrap();
    assert_eq!(history[0].confirmed, Some(true));
}

#[tokio::test]
async fn cancel_passes_pet_as_query() {
    let backend = FakeBackend::start().await;

    api_for(&backend, 2).cancel_adoption(LUNA).await.unwrap();

    let requests = backend.state.requests();
    let request = &requests[0];
    assert_eq!(request.path, "/api/adoptions/cancel");
    assert_eq!(request.query.as_deref(), Some("petId=9"));
}

#[tokio::test]
async fn server_errors_surface_as_status() {
    let backend = FakeBackend::start().await;
    backend.state.set_fail_adoptions(true);
    let api = api_for(&backend, 2);

    let confirm = api.confirm_adoption(ALICE, LUNA).await.unwrap_err();
    assert!(matches!(confirm, ApiError::Status { status: 500, .. }));
    let cancel = api.cancel_adoption(LUNA).await.unwrap_err();
    assert!(matches!(cancel, ApiError::Status { status: 500, .. }));
}

#[tokio::test]
async fn unreachable_backend_is_a_request_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = HttpChatApi::new(&format!("http://{addr}"), None, Duration::from_secs(1)).unwrap();
    let err = api.history(ALICE, BOB).await.unwrap_err();
    assert!(matches!(err, ApiError::Request(_)));
}

#[tokio::test]
async fn contact_list_loads_and_searches_over_http() {
    let backend = FakeBackend::start().await;
    backend.state.set_contacts(
        ALICE,
        vec![
            User::named(BOB, "Bob", "Keeper"),
            User::named(ALICE, "Alice", "Self"),
            User::named(CAROL, "Carol", "Barker"),
        ],
    );

    let mut contacts = ConversationList::new(Arc::new(api_for(&backend, 1)), ALICE);
    let loaded: Vec<UserId> = contacts.refresh().await.iter().map(|u| u.id).collect();
    assert_eq!(loaded, vec![BOB, CAROL]);

    let found: Vec<UserId> = contacts.search("bark").iter().map(|u| u.id).collect();
    assert_eq!(found, vec![CAROL]);
    let found: Vec<UserId> = contacts.search("BOB KEE").iter().map(|u| u.id).collect();
    assert_eq!(found, vec![BOB]);
    assert_eq!(contacts.search("  ").len(), 2);

    assert_eq!(
        backend.state.requests()[0].path,
        "/api/messages/chat-users/1"
    );
}

#[tokio::test]
async fn contact_list_is_empty_when_backend_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = HttpChatApi::new(&format!("http://{addr}"), None, Duration::from_secs(1)).unwrap();
    let mut contacts = ConversationList::new(Arc::new(api), ALICE);

    assert!(contacts.refresh().await.is_empty());
    assert!(contacts.users().is_empty());
    assert!(contacts.search("bob").is_empty());
}
