//! Transport layer abstraction for `PetChat`.
//!
//! Defines the [`Transport`] trait the chat room publishes through and the
//! [`TransportEvent`] stream it consumes. Concrete implementations:
//! - [`stomp::StompTransport`]: STOMP 1.2 over WebSocket with automatic
//!   reconnection
//! - [`loopback::LoopbackHub`]: in-process fan-out broker for testing

pub mod loopback;
pub mod stomp;

use std::fmt;

use petchat_proto::codec::CodecError;
use petchat_proto::message::ChatMessage;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// STOMP over a WebSocket to the message broker.
    Stomp,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stomp => write!(f, "STOMP"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Lifecycle and delivery notifications produced by a transport.
///
/// Events arrive in order on a single channel: a `Connected` always
/// precedes the messages of that session, and a `Disconnected` follows
/// its last message.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A session was established and the topic subscription is active.
    Connected,
    /// A message was pushed on the subscribed topic.
    Message(ChatMessage),
    /// The session was lost. A reconnect attempt follows unless the
    /// transport was shut down.
    Disconnected,
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No session is active; the message was not sent.
    #[error("not connected to the message broker")]
    NotConnected,

    /// The connection was closed while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The broker refused or broke the STOMP handshake.
    #[error("STOMP handshake failed: {0}")]
    Handshake(String),

    /// The message body could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async transport trait for publishing chat messages.
///
/// Incoming traffic is not pulled through this trait: each implementation
/// hands out an [`tokio::sync::mpsc::Receiver`] of [`TransportEvent`]s when
/// it is created, so the owner can `select!` over it.
pub trait Transport: Send + Sync {
    /// Publish a message to the broker's send destination.
    ///
    /// Returns `Ok(())` once the frame has been handed to the socket. This
    /// does not guarantee delivery; the broker's echo on the topic is the
    /// only confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when no session is active.
    /// The message is dropped, not queued.
    fn publish(
        &self,
        message: &ChatMessage,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Check whether a session is currently established.
    fn is_connected(&self) -> bool;

    /// Tear the session down and stop reconnecting. Idempotent.
    fn disconnect(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    fn publish(
        &self,
        message: &ChatMessage,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        (**self).publish(message)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn disconnect(&self) -> impl std::future::Future<Output = ()> + Send {
        (**self).disconnect()
    }

    fn transport_type(&self) -> TransportType {
        (**self).transport_type()
    }
}
