//! Background driver for a [`ChatRoom`].
//!
//! [`spawn_room`] moves a room into a tokio task that owns it for the rest
//! of its life. The task multiplexes three inputs:
//!
//! ```text
//! transport events ──┐
//! history results  ──┼──> ChatRoom ──> RoomEvent receiver
//! RoomCommand      ──┘
//! ```
//!
//! History loads run as separate tasks so a slow backend never blocks
//! incoming messages or user commands. Results from superseded loads are
//! dropped by the room itself.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use petchat_proto::message::MessageId;

use crate::api::{ChatApi, Upload};
use crate::chat::room::{ChatRoom, HistoryRequest, HistoryResult, RoomError};
use crate::location::LocationProvider;
use crate::storage::KeyValueStore;
use crate::transport::{Transport, TransportEvent};

/// Default capacity of the command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Capacity of the internal history result channel.
const HISTORY_RESULT_BUFFER: usize = 4;

/// Requests sent to a running room.
#[derive(Debug)]
pub enum RoomCommand {
    /// Send a text message to the peer.
    SendText(String),
    /// Upload an image and send its URL.
    SendImage(Upload),
    /// Send the current position.
    SendLocation,
    /// Delete a message.
    Delete(MessageId),
    /// Confirm an adoption request.
    ConfirmAdoption(MessageId),
    /// Cancel an adoption request.
    CancelAdoption(MessageId),
    /// Fetch history again.
    ReloadHistory,
    /// Stop the session and disconnect.
    Shutdown,
}

impl RoomCommand {
    /// Short name used in logs and failure reports.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::SendText(_) => "send message",
            Self::SendImage(_) => "send image",
            Self::SendLocation => "send location",
            Self::Delete(_) => "delete message",
            Self::ConfirmAdoption(_) => "confirm adoption",
            Self::CancelAdoption(_) => "cancel adoption",
            Self::ReloadHistory => "reload history",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run `room` in a background task.
///
/// Returns the command sender and the task handle. The task ends on
/// [`RoomCommand::Shutdown`] or when every command sender is dropped; it
/// then aborts pending history loads, disconnects, and hands the room
/// back through the join handle.
pub fn spawn_room<T, A, K, L>(
    room: ChatRoom<T, A, K, L>,
    transport_events: mpsc::Receiver<TransportEvent>,
    capacity: usize,
) -> (mpsc::Sender<RoomCommand>, JoinHandle<ChatRoom<T, A, K, L>>)
where
    T: Transport + 'static,
    A: ChatApi + 'static,
    K: KeyValueStore + 'static,
    L: LocationProvider + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(run_room(room, transport_events, cmd_rx));
    (cmd_tx, handle)
}

/// In-flight history loads.
struct HistoryTasks {
    results: mpsc::Sender<HistoryResult>,
    running: Vec<JoinHandle<()>>,
}

impl HistoryTasks {
    const fn new(results: mpsc::Sender<HistoryResult>) -> Self {
        Self {
            results,
            running: Vec::new(),
        }
    }

    fn schedule<A: ChatApi + 'static>(&mut self, request: HistoryRequest<A>) {
        self.running.retain(|task| !task.is_finished());
        let results = self.results.clone();
        self.running.push(tokio::spawn(async move {
            let result = request.fetch().await;
            if results.send(result).await.is_err() {
                tracing::debug!("room stopped before history arrived");
            }
        }));
    }

    fn abort_all(&mut self) {
        for task in self.running.drain(..) {
            task.abort();
        }
    }
}

async fn run_room<T, A, K, L>(
    mut room: ChatRoom<T, A, K, L>,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<RoomCommand>,
) -> ChatRoom<T, A, K, L>
where
    T: Transport + 'static,
    A: ChatApi + 'static,
    K: KeyValueStore + 'static,
    L: LocationProvider + 'static,
{
    let (history_tx, mut history_rx) = mpsc::channel(HISTORY_RESULT_BUFFER);
    let mut history = HistoryTasks::new(history_tx);

    if let Some(request) = room.mount().await {
        history.schedule(request);
    }

    let mut transport_open = true;
    loop {
        tokio::select! {
            Some(result) = history_rx.recv() => room.apply_history(result),
            event = transport_events.recv(), if transport_open => match event {
                Some(event) => {
                    if let Some(request) = room.handle_transport_event(event).await {
                        history.schedule(request);
                    }
                }
                None => {
                    tracing::warn!("transport event stream ended");
                    transport_open = false;
                }
            },
            command = commands.recv() => match command {
                Some(RoomCommand::Shutdown) | None => {
                    tracing::info!("room session shutting down");
                    break;
                }
                Some(command) => execute(&mut room, &mut history, command).await,
            },
        }
    }

    history.abort_all();
    room.unmount().await;
    room
}

async fn execute<T, A, K, L>(
    room: &mut ChatRoom<T, A, K, L>,
    history: &mut HistoryTasks,
    command: RoomCommand,
) where
    T: Transport + 'static,
    A: ChatApi + 'static,
    K: KeyValueStore + 'static,
    L: LocationProvider + 'static,
{
    let action = command.action();
    let result: Result<(), RoomError> = match command {
        RoomCommand::SendText(text) => room.send_text(&text).await.map(drop),
        RoomCommand::SendImage(upload) => room.send_image(upload).await.map(drop),
        RoomCommand::SendLocation => room.send_location().await.map(drop),
        RoomCommand::Delete(id) => room.delete_message(id).await,
        RoomCommand::ConfirmAdoption(id) => room.confirm_adoption(id).await,
        RoomCommand::CancelAdoption(id) => room.cancel_adoption(id).await,
        RoomCommand::ReloadHistory => {
            history.schedule(room.history_request());
            Ok(())
        }
        RoomCommand::Shutdown => Ok(()),
    };
    if let Err(e) = result {
        tracing::warn!(action, err = %e, "room command failed");
        room.report_failure(action, &e);
    }
}
