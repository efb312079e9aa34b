//! STOMP-over-WebSocket transport for `PetChat`.
//!
//! Implements the [`Transport`] trait on top of a WebSocket connection to
//! the backend's message broker. A background supervisor task owns the
//! connection lifecycle:
//!
//! 1. Open the WebSocket (bounded by the connect timeout)
//! 2. Send `CONNECT` and wait for `CONNECTED`
//! 3. `SUBSCRIBE` to the public topic and emit [`TransportEvent::Connected`]
//! 4. Read `MESSAGE` frames until the socket closes, then emit
//!    [`TransportEvent::Disconnected`]
//! 5. Sleep for the reconnect delay and start over
//!
//! The loop runs until [`Transport::disconnect`] is called or the
//! transport is dropped. Publishing while no session is active fails
//! immediately; there is no outbound queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use petchat_proto::codec;
use petchat_proto::message::ChatMessage;
use petchat_proto::stomp::{self as frames, Command, Frame};

use super::{Transport, TransportError, TransportEvent, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Subscription id used for the single topic subscription.
const SUBSCRIPTION_ID: &str = "sub-0";

/// Default broker endpoint.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";
/// Default topic every client subscribes to.
pub const DEFAULT_TOPIC: &str = "/topic/public";
/// Default destination outgoing messages are sent to.
pub const DEFAULT_SEND_DESTINATION: &str = "/app/chat.sendMessage";

/// Connection settings for [`StompTransport`].
#[derive(Debug, Clone)]
pub struct StompConfig {
    /// WebSocket URL of the broker endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Topic to subscribe to.
    pub topic: String,
    /// Destination for `SEND` frames.
    pub send_destination: String,
    /// Bearer token passed in the `CONNECT` frame's `Authorization` header.
    pub auth_token: Option<String>,
    /// Upper bound for opening the socket and for the STOMP handshake.
    pub connect_timeout: Duration,
    /// Pause between a lost session and the next attempt.
    pub reconnect_delay: Duration,
    /// Capacity of the event channel handed to the owner.
    pub event_buffer: usize,
}

impl StompConfig {
    /// Settings for `url` with the default topic, destination and timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            topic: DEFAULT_TOPIC.to_string(),
            send_destination: DEFAULT_SEND_DESTINATION.to_string(),
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

/// STOMP transport implementing the [`Transport`] trait.
///
/// Created via [`StompTransport::connect`], which spawns the supervisor
/// task and returns the event receiver alongside the transport.
pub struct StompTransport {
    /// Destination `SEND` frames are addressed to.
    send_destination: String,
    /// Write half of the current session's socket, if any.
    writer: Arc<Mutex<Option<WsSender>>>,
    /// Whether a STOMP session is currently established.
    connected: Arc<AtomicBool>,
    /// Flips to `true` once [`Transport::disconnect`] is called.
    shutdown: watch::Sender<bool>,
    /// Handle to the supervisor task.
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StompTransport {
    /// Start connecting to the broker described by `config`.
    ///
    /// Returns immediately. Connection progress is reported on the
    /// returned receiver: a [`TransportEvent::Connected`] once the topic
    /// subscription is active, then pushed messages, then
    /// [`TransportEvent::Disconnected`] if the session drops.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn connect(config: StompConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));
        let send_destination = config.send_destination.clone();

        let supervisor = tokio::spawn(supervise(
            config,
            Arc::clone(&writer),
            Arc::clone(&connected),
            event_tx,
            shutdown_rx,
        ));

        let transport = Self {
            send_destination,
            writer,
            connected,
            shutdown: shutdown_tx,
            supervisor: parking_lot::Mutex::new(Some(supervisor)),
        };
        (transport, event_rx)
    }
}

impl Transport for StompTransport {
    /// Send a message as a `SEND` frame with a JSON body.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] if no session is active.
    /// - [`TransportError::Codec`] if the message cannot be encoded.
    /// - [`TransportError::ConnectionClosed`] if the socket write fails.
    async fn publish(&self, message: &ChatMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            tracing::error!(message_id = %message.id, "publish while disconnected, message dropped");
            return Err(TransportError::NotConnected);
        }

        let body = codec::encode(message)?;
        let frame = frames::send_frame(&self.send_destination, body);

        let mut writer = self.writer.lock().await;
        let Some(sender) = writer.as_mut() else {
            tracing::error!(message_id = %message.id, "publish while disconnected, message dropped");
            return Err(TransportError::NotConnected);
        };
        sender.send(to_ws_message(&frame)).await.map_err(|e| {
            tracing::warn!(err = %e, "STOMP send failed");
            self.connected.store(false, Ordering::Release);
            TransportError::ConnectionClosed
        })?;

        tracing::debug!(message_id = %message.id, kind = message.kind.wire_type(), "published");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send `DISCONNECT`, close the socket and stop the supervisor.
    async fn disconnect(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.connected.store(false, Ordering::Release);

        close_writer(&self.writer).await;

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            handle.abort();
            let _ = handle.await;
        }

        // The supervisor may have installed a fresh session before it saw
        // the abort.
        close_writer(&self.writer).await;
        self.connected.store(false, Ordering::Release);
        tracing::info!("STOMP transport shut down");
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Stomp
    }
}

impl Drop for StompTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

/// Take the current writer, say goodbye to the broker and close the socket.
async fn close_writer(writer: &Mutex<Option<WsSender>>) {
    let sender = writer.lock().await.take();
    if let Some(mut sender) = sender {
        if let Err(e) = sender.send(to_ws_message(&frames::disconnect_frame())).await {
            tracing::debug!(err = %e, "DISCONNECT frame not delivered");
        }
        let _ = sender.close().await;
    }
}

/// Supervisor task: connect, pump one session, wait, repeat.
async fn supervise(
    config: StompConfig,
    writer: Arc<Mutex<Option<WsSender>>>,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u64 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        attempt += 1;

        let session = tokio::select! {
            result = open_session(&config) => result,
            _ = shutdown.changed() => break,
        };

        match session {
            Ok((sender, reader)) => {
                *writer.lock().await = Some(sender);
                connected.store(true, Ordering::Release);
                tracing::info!(url = %config.url, attempt, "STOMP session established");
                attempt = 0;

                if events.send(TransportEvent::Connected).await.is_err() {
                    break;
                }

                let stopped = tokio::select! {
                    () = read_loop(reader, &events) => false,
                    _ = shutdown.changed() => true,
                };

                if stopped {
                    break;
                }
                connected.store(false, Ordering::Release);
                writer.lock().await.take();
                tracing::warn!(url = %config.url, "STOMP session lost");
                if events.send(TransportEvent::Disconnected).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(url = %config.url, attempt, err = %e, "STOMP connect failed");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    connected.store(false, Ordering::Release);
    tracing::debug!("STOMP supervisor exiting");
}

/// Open the socket, perform the STOMP handshake and subscribe.
async fn open_session(config: &StompConfig) -> Result<(WsSender, WsReader), TransportError> {
    let (ws_stream, _response) =
        tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %config.url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(map_ws_connect_error)?;

    let (mut sender, mut reader) = ws_stream.split();

    let host = url::Url::parse(&config.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    send_frame(
        &mut sender,
        &frames::connect_frame(&host, config.auth_token.as_deref()),
    )
    .await?;

    let connected = tokio::time::timeout(config.connect_timeout, await_connected(&mut reader))
        .await
        .map_err(|_| {
            tracing::warn!(url = %config.url, "STOMP CONNECTED frame timed out");
            TransportError::Timeout
        })??;
    tracing::debug!(
        version = connected.get_header("version").unwrap_or("unknown"),
        server = connected.get_header("server").unwrap_or("unknown"),
        "STOMP handshake complete"
    );

    send_frame(
        &mut sender,
        &frames::subscribe_frame(SUBSCRIPTION_ID, &config.topic),
    )
    .await?;
    tracing::debug!(topic = %config.topic, "subscribed");

    Ok((sender, reader))
}

/// Wait for the broker's `CONNECTED` (or `ERROR`) reply.
async fn await_connected(reader: &mut WsReader) -> Result<Frame, TransportError> {
    while let Some(msg_result) = reader.next().await {
        let msg = msg_result.map_err(|e| {
            TransportError::Io(std::io::Error::other(format!(
                "WebSocket error during handshake: {e}"
            )))
        })?;
        let frame = match msg {
            Message::Text(text) => Frame::decode(text.as_bytes()),
            Message::Binary(data) => Frame::decode(&data),
            Message::Close(_) => return Err(TransportError::ConnectionClosed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        match frame {
            Ok(Some(frame)) if frame.command == Command::Connected => return Ok(frame),
            Ok(Some(frame)) if frame.command == Command::Error => {
                let reason = frame.get_header("message").unwrap_or("ERROR frame");
                return Err(TransportError::Handshake(reason.to_string()));
            }
            Ok(Some(other)) => {
                tracing::debug!(command = %other.command, "unexpected frame during handshake");
            }
            Ok(None) => {}
            Err(e) => return Err(TransportError::Handshake(e.to_string())),
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// Reads frames for one session until the socket closes.
///
/// Malformed frames and message bodies are logged and skipped; the
/// session stays up on bad data.
async fn read_loop(mut reader: WsReader, events: &mpsc::Sender<TransportEvent>) {
    while let Some(msg_result) = reader.next().await {
        let keep_going = match msg_result {
            Ok(Message::Text(text)) => dispatch(text.as_bytes(), events).await,
            Ok(Message::Binary(data)) => dispatch(&data, events).await,
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by broker");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => true,
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        };
        if !keep_going {
            break;
        }
    }
}

/// Handle one inbound payload. Returns `false` when the event receiver is gone.
async fn dispatch(payload: &[u8], events: &mpsc::Sender<TransportEvent>) -> bool {
    let frame = match Frame::decode(payload) {
        Ok(Some(frame)) => frame,
        Ok(None) => return true,
        Err(e) => {
            tracing::warn!(err = %e, "malformed STOMP frame, skipping");
            return true;
        }
    };

    match frame.command {
        Command::Message => match codec::decode(&frame.body) {
            Ok(message) => events.send(TransportEvent::Message(message)).await.is_ok(),
            Err(e) => {
                tracing::warn!(
                    err = %e,
                    destination = frame.get_header("destination").unwrap_or(""),
                    "malformed message body, skipping"
                );
                true
            }
        },
        Command::Error => {
            tracing::warn!(
                reason = frame.get_header("message").unwrap_or(""),
                "broker sent ERROR frame"
            );
            true
        }
        other => {
            tracing::debug!(command = %other, "ignoring frame");
            true
        }
    }
}

async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<(), TransportError> {
    sender.send(to_ws_message(frame)).await.map_err(|e| {
        tracing::warn!(command = %frame.command, err = %e, "failed to send STOMP frame");
        TransportError::Io(std::io::Error::other(format!(
            "failed to send {}: {e}",
            frame.command
        )))
    })
}

/// Frames go out as text messages; a non-UTF-8 body falls back to binary.
fn to_ws_message(frame: &Frame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => TransportError::Io(io_err),
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Handshake(format!(
            "HTTP upgrade rejected: status {}",
            response.status()
        )),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
