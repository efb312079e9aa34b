//! Loopback transport for testing.
//!
//! A [`LoopbackHub`] plays the broker: every endpoint attached to it
//! receives every published message (including its own), in publish order.
//! That matches the public-topic broadcast the real backend performs.
//! The hub can also push server-originated messages and simulate dropped
//! and restored sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use petchat_proto::message::ChatMessage;

use super::{Transport, TransportError, TransportEvent, TransportType};

/// One attached endpoint as seen by the hub.
struct Endpoint {
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct HubState {
    endpoints: Vec<Endpoint>,
    published: Vec<ChatMessage>,
    echo: bool,
}

/// In-process stand-in for the message broker.
///
/// Cloning a hub yields another handle to the same broker.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    /// Create an empty hub that echoes publishes to every endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                echo: true,
                ..HubState::default()
            })),
        }
    }

    /// Attach a new connected endpoint.
    ///
    /// The returned receiver already holds a [`TransportEvent::Connected`].
    #[must_use]
    pub fn attach(&self, buffer: usize) -> (LoopbackTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let connected = Arc::new(AtomicBool::new(true));
        if tx.try_send(TransportEvent::Connected).is_err() {
            tracing::debug!("loopback endpoint dropped its receiver before attach");
        }
        self.state.lock().endpoints.push(Endpoint {
            connected: Arc::clone(&connected),
            events: tx,
        });
        let transport = LoopbackTransport {
            hub: self.clone(),
            connected,
        };
        (transport, rx)
    }

    /// Turn the broadcast of published messages on or off.
    ///
    /// With echo off, publishes are recorded but never delivered, like a
    /// broker that accepted the frame and then lost it.
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Every message published through any endpoint, in order.
    #[must_use]
    pub fn published(&self) -> Vec<ChatMessage> {
        self.state.lock().published.clone()
    }

    /// Deliver a server-originated message to every connected endpoint.
    pub async fn push(&self, message: ChatMessage) {
        self.fan_out(TransportEvent::Message(message), true).await;
    }

    /// Drop every session: endpoints go offline and see `Disconnected`.
    pub async fn drop_sessions(&self) {
        self.set_all_connected(false);
        self.fan_out(TransportEvent::Disconnected, false).await;
    }

    /// Restore every session: endpoints come back and see `Connected`.
    pub async fn restore_sessions(&self) {
        self.set_all_connected(true);
        self.fan_out(TransportEvent::Connected, true).await;
    }

    fn set_all_connected(&self, connected: bool) {
        for endpoint in &self.state.lock().endpoints {
            endpoint.connected.store(connected, Ordering::Release);
        }
    }

    /// Send `event` to each endpoint whose connection flag equals `online`.
    async fn fan_out(&self, event: TransportEvent, online: bool) {
        let targets: Vec<mpsc::Sender<TransportEvent>> = {
            let mut state = self.state.lock();
            state.endpoints.retain(|e| !e.events.is_closed());
            state
                .endpoints
                .iter()
                .filter(|e| e.connected.load(Ordering::Acquire) == online)
                .map(|e| e.events.clone())
                .collect()
        };
        for tx in targets {
            if tx.send(event.clone()).await.is_err() {
                tracing::debug!("loopback endpoint went away during fan-out");
            }
        }
    }

    fn detach(&self, connected: &Arc<AtomicBool>) {
        self.state
            .lock()
            .endpoints
            .retain(|e| !Arc::ptr_eq(&e.connected, connected));
    }
}

/// One client's view of a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    connected: Arc<AtomicBool>,
}

impl Transport for LoopbackTransport {
    async fn publish(&self, message: &ChatMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            tracing::error!(message_id = %message.id, "publish while disconnected, message dropped");
            return Err(TransportError::NotConnected);
        }
        let echo = {
            let mut state = self.hub.state.lock();
            state.published.push(message.clone());
            state.echo
        };
        if echo {
            self.hub
                .fan_out(TransportEvent::Message(message.clone()), true)
                .await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.hub.detach(&self.connected);
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}
