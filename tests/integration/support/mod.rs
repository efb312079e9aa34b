//! In-process fake of the marketplace backend.
//!
//! Serves the REST routes the chat core calls and a STOMP-over-WebSocket
//! endpoint at `/ws` that persists every `SEND` and fans it out to all
//! sessions on `/topic/public`, the way the real broker does.

#![allow(dead_code, clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use petchat::api::User;
use petchat_proto::codec;
use petchat_proto::message::{ChatMessage, Conversation, MessageId, PetId, UserId};
use petchat_proto::stomp::{Command, Frame};

/// One REST request as the backend saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone)]
enum Control {
    Deliver(Vec<u8>),
    Kick,
}

/// Shared backend state, inspectable from tests.
pub struct BackendState {
    messages: Mutex<Vec<ChatMessage>>,
    users: Mutex<HashMap<UserId, User>>,
    contacts: Mutex<HashMap<UserId, Vec<User>>>,
    requests: Mutex<Vec<Recorded>>,
    connects: Mutex<Vec<Frame>>,
    uploads: Mutex<Vec<(String, usize)>>,
    next_id: AtomicI64,
    delivered: AtomicU64,
    strip_client_id: AtomicBool,
    fail_adoptions: AtomicBool,
    control: broadcast::Sender<Control>,
}

impl BackendState {
    fn new() -> Self {
        let (control, _) = broadcast::channel(256);
        Self {
            messages: Mutex::new(Vec::new()),
            users: Mutex::new(HashMap::new()),
            contacts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            delivered: AtomicU64::new(0),
            strip_client_id: AtomicBool::new(false),
            fail_adoptions: AtomicBool::new(false),
            control,
        }
    }

    /// Persist `message` under a fresh server id.
    pub fn insert_message(&self, mut message: ChatMessage) -> ChatMessage {
        message.id = MessageId::Server(self.next_id.fetch_add(1, Ordering::SeqCst));
        if self.strip_client_id.load(Ordering::SeqCst) {
            message.client_id = None;
        }
        self.messages.lock().push(message.clone());
        message
    }

    /// Persist `message` and push it to every STOMP session.
    pub fn publish(&self, message: ChatMessage) -> ChatMessage {
        let saved = self.insert_message(message);
        self.broadcast(&saved);
        saved
    }

    /// Push a raw body to every STOMP session without persisting it.
    pub fn broadcast_raw(&self, body: &[u8]) {
        let _ = self.control.send(Control::Deliver(body.to_vec()));
    }

    fn broadcast(&self, message: &ChatMessage) {
        let body = codec::encode(message).unwrap();
        self.broadcast_raw(&body);
    }

    pub fn insert_user(&self, user: User) {
        self.users.lock().insert(user.id, user);
    }

    pub fn set_contacts(&self, me: UserId, users: Vec<User>) {
        self.contacts.lock().insert(me, users);
    }

    /// Drop the server id and `clientId` echo, like a backend that does
    /// not reflect correlation ids.
    pub fn set_strip_client_id(&self, strip: bool) {
        self.strip_client_id.store(strip, Ordering::SeqCst);
    }

    /// Make adoption endpoints answer 500.
    pub fn set_fail_adoptions(&self, fail: bool) {
        self.fail_adoptions.store(fail, Ordering::SeqCst);
    }

    /// Close every STOMP session from the server side.
    pub fn kick_sessions(&self) {
        let _ = self.control.send(Control::Kick);
    }

    /// Number of live STOMP sessions.
    pub fn sessions(&self) -> usize {
        self.control.receiver_count()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    pub fn connects(&self) -> Vec<Frame> {
        self.connects.lock().clone()
    }

    pub fn uploads(&self) -> Vec<(String, usize)> {
        self.uploads.lock().clone()
    }

    /// Number of `MESSAGE` frames written across all sessions.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

/// A running fake backend.
pub struct FakeBackend {
    pub addr: SocketAddr,
    pub state: Arc<BackendState>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeBackend {
    /// Bind to an OS-assigned port and start serving.
    pub async fn start() -> Self {
        let state = Arc::new(BackendState::new());
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/messages/history/{a}/{b}", get(history))
            .route("/api/messages/upload", post(upload))
            .route("/api/messages/chat-users/{me}", get(chat_users))
            .route("/api/messages/{id}", delete(delete_message))
            .route("/api/users/{id}", get(user))
            .route("/api/adoptions/confirm", post(confirm_adoption))
            .route("/api/adoptions/cancel", post(cancel_adoption))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&state),
                record,
            ))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "fake backend error");
            }
        });
        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An unsigned JWT whose payload carries `{"id": user}`.
pub fn token_for(user: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"id":{user},"sub":"user{user}"}}"#));
    format!("{header}.{payload}.signature")
}

/// Poll `condition` every 10 ms until it holds; panic after two seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

async fn record(State(state): State<Arc<BackendState>>, request: Request, next: Next) -> Response {
    state.requests.lock().push(Recorded {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        query: request.uri().query().map(str::to_string),
        authorization: request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });
    next.run(request).await
}

async fn history(
    State(state): State<Arc<BackendState>>,
    Path((a, b)): Path<(i64, i64)>,
) -> Json<Vec<ChatMessage>> {
    let conversation = Conversation::new(UserId::new(a), UserId::new(b));
    let messages = state
        .messages
        .lock()
        .iter()
        .filter(|m| conversation.contains(m))
        .cloned()
        .collect();
    Json(messages)
}

async fn delete_message(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<i64>,
) -> StatusCode {
    let mut messages = state.messages.lock();
    let before = messages.len();
    messages.retain(|m| m.id != MessageId::Server(id));
    if messages.len() < before {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn upload(
    State(state): State<Arc<BackendState>>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, StatusCode> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
        state.uploads.lock().push((name.clone(), bytes.len()));
        return Ok(Json(
            serde_json::json!({ "imageUrl": format!("/uploads/{name}") }),
        ));
    }
    Err(StatusCode::BAD_REQUEST)
}

async fn user(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<i64>,
) -> Result<Json<User>, StatusCode> {
    state
        .users
        .lock()
        .get(&UserId::new(id))
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn chat_users(
    State(state): State<Arc<BackendState>>,
    Path(me): Path<i64>,
) -> Json<Vec<User>> {
    Json(
        state
            .contacts
            .lock()
            .get(&UserId::new(me))
            .cloned()
            .unwrap_or_default(),
    )
}

async fn confirm_adoption(
    State(state): State<Arc<BackendState>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    if state.fail_adoptions.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let (Some(adopter), Some(pet)) = (
        params.get("adopterId").and_then(|v| v.parse::<i64>().ok()),
        params.get("petId").and_then(|v| v.parse::<i64>().ok()),
    ) else {
        return StatusCode::BAD_REQUEST;
    };
    for message in state.messages.lock().iter_mut() {
        if message.sender_id == UserId::new(adopter) && message.kind.pet_id() == Some(PetId::new(pet)) {
            message.confirmed = Some(true);
        }
    }
    StatusCode::OK
}

async fn cancel_adoption(
    State(state): State<Arc<BackendState>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    if state.fail_adoptions.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if params.get("petId").and_then(|v| v.parse::<i64>().ok()).is_none() {
        return StatusCode::BAD_REQUEST;
    }
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// STOMP broker
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stomp_session(socket, state))
}

fn frame_message(frame: &Frame) -> Message {
    Message::Text(String::from_utf8_lossy(&frame.encode()).into_owned().into())
}

async fn stomp_session(socket: WebSocket, state: Arc<BackendState>) {
    let (mut sink, mut stream) = socket.split();
    let mut control = state.control.subscribe();
    let mut sequence = 0_u64;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let bytes = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(Some(frame)) = Frame::decode(&bytes) else {
                    continue;
                };
                match frame.command {
                    Command::Connect | Command::Stomp => {
                        state.connects.lock().push(frame);
                        let connected = Frame::new(Command::Connected)
                            .header("version", "1.2")
                            .header("heart-beat", "0,0");
                        if sink.send(frame_message(&connected)).await.is_err() {
                            return;
                        }
                    }
                    Command::Send => {
                        if let Ok(message) = codec::decode(&frame.body) {
                            state.publish(message);
                        }
                    }
                    Command::Disconnect => return,
                    _ => {}
                }
            }
            control_msg = control.recv() => match control_msg {
                Ok(Control::Deliver(body)) => {
                    sequence += 1;
                    let frame = Frame::new(Command::Message)
                        .header("destination", "/topic/public")
                        .header("subscription", "sub-0")
                        .header("message-id", sequence.to_string())
                        .header("content-type", "application/json")
                        .with_body(body);
                    if sink.send(frame_message(&frame)).await.is_err() {
                        return;
                    }
                    state.delivered.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Control::Kick) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}
