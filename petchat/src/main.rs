//! Line-oriented chat client for the pet-care marketplace.
//!
//! Connects to the backend's STOMP endpoint, opens a room with one peer
//! and reads commands from stdin. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/petchat/config.toml`).
//!
//! ```bash
//! PETCHAT_TOKEN=eyJ... cargo run --bin petchat -- --peer 42
//!
//! # Against a remote backend, opening with a question
//! cargo run --bin petchat -- --api-url https://api.example.com \
//!     --ws-url wss://api.example.com/ws --peer 42 \
//!     --initial-message "Is Luna still available?"
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use petchat::api::http::HttpChatApi;
use petchat::api::{ApiError, Upload};
use petchat::auth::{AuthError, Identity};
use petchat::chat::{AdoptionTracker, ChatRoom, ConversationList, MessageStatus, MessageView, RoomEvent};
use petchat::config::{CliArgs, ClientConfig};
use petchat::location::ConfiguredLocation;
use petchat::session::{self, RoomCommand};
use petchat::storage::{FileStorage, StorageError};
use petchat::transport::stomp::StompTransport;
use petchat_proto::message::MessageId;

/// Errors that stop the client before the room is running.
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("no auth token (use --token or PETCHAT_TOKEN)")]
    MissingToken,

    #[error("no peer to chat with (use --peer)")]
    MissingPeer,

    #[error("invalid auth token: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("stdin: {0}")]
    Io(#[from] io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("petchat: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file; stdout is the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!("petchat starting");
    let result = run(config).await;
    tracing::info!("petchat exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("petchat: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("petchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: ClientConfig) -> Result<(), StartupError> {
    let token = config.token.as_deref().ok_or(StartupError::MissingToken)?;
    let identity = Identity::from_token(token)?;
    let room_config = config
        .to_room_config(identity.user_id)
        .ok_or(StartupError::MissingPeer)?;
    tracing::info!(me = %identity.user_id, peer = %room_config.peer, "identity resolved");

    let api = Arc::new(HttpChatApi::new(
        &config.api_url,
        Some(identity.token.clone()),
        config.request_timeout,
    )?);
    let storage = match &config.storage_path {
        Some(path) => FileStorage::open(path.clone()),
        None => FileStorage::open_default()?,
    };
    tracing::debug!(path = %storage.path().display(), "using storage file");

    let (transport, transport_events) = StompTransport::connect(config.to_stomp_config());
    let (room, events) = ChatRoom::new(
        room_config,
        transport,
        Arc::clone(&api),
        AdoptionTracker::load(storage),
        ConfiguredLocation::from(config.location),
    );
    let (commands, session) = session::spawn_room(room, transport_events, config.channel_capacity);
    let printer = tokio::spawn(print_events(events, config.timestamp_format.clone()));

    println!("Connecting to {} ... type /help for commands.", config.ws_url);
    let mut contacts = ConversationList::new(api, identity.user_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match parse_input(&line) {
            Ok(Input::Empty) => continue,
            Ok(Input::Quit) => break,
            Ok(Input::Help) => {
                print_help();
                continue;
            }
            Ok(Input::Users(query)) => {
                contacts.refresh().await;
                for user in contacts.search(&query) {
                    println!("  {:>6}  {}", user.id, user.display_name());
                }
                continue;
            }
            Ok(Input::Image(path)) => match read_upload(&path).await {
                Ok(upload) => RoomCommand::SendImage(upload),
                Err(e) => {
                    println!("! cannot read {}: {e}", path.display());
                    continue;
                }
            },
            Ok(Input::Command(command)) => command,
            Err(usage) => {
                println!("! {usage}");
                continue;
            }
        };
        if commands.send(command).await.is_err() {
            tracing::warn!("room session ended");
            break;
        }
    }

    if commands.send(RoomCommand::Shutdown).await.is_err() {
        tracing::debug!("room session already stopped");
    }
    if let Err(e) = session.await {
        tracing::error!(err = %e, "room session panicked");
    }
    if let Err(e) = printer.await {
        tracing::error!(err = %e, "event printer panicked");
    }
    Ok(())
}

/// One parsed line of user input.
#[derive(Debug)]
enum Input {
    Empty,
    Quit,
    Help,
    Users(String),
    Image(PathBuf),
    Command(RoomCommand),
}

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Input::Command(RoomCommand::SendText(line.to_string())));
    };
    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, arg)| (name, arg.trim()));

    let message_id = |arg: &str| {
        arg.parse::<MessageId>()
            .map_err(|_| format!("usage: /{name} <message id>"))
    };

    match name {
        "quit" | "exit" => Ok(Input::Quit),
        "help" => Ok(Input::Help),
        "users" => Ok(Input::Users(arg.to_string())),
        "location" => Ok(Input::Command(RoomCommand::SendLocation)),
        "reload" => Ok(Input::Command(RoomCommand::ReloadHistory)),
        "image" if !arg.is_empty() => Ok(Input::Image(PathBuf::from(arg))),
        "image" => Err("usage: /image <path>".to_string()),
        "delete" => Ok(Input::Command(RoomCommand::Delete(message_id(arg)?))),
        "confirm" => Ok(Input::Command(RoomCommand::ConfirmAdoption(message_id(arg)?))),
        "cancel" => Ok(Input::Command(RoomCommand::CancelAdoption(message_id(arg)?))),
        other => Err(format!("unknown command /{other}, try /help")),
    }
}

fn print_help() {
    println!("  <text>            send a message");
    println!("  /image <path>     upload and send an image");
    println!("  /location         send your position");
    println!("  /delete <id>      delete a message");
    println!("  /confirm <id>     confirm an adoption request");
    println!("  /cancel <id>      cancel an adoption request");
    println!("  /users [query]    list or search your conversations");
    println!("  /reload           fetch history again");
    println!("  /quit             leave");
}

async fn read_upload(path: &Path) -> io::Result<Upload> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_string();
    Ok(Upload { file_name, bytes })
}

async fn print_events(mut events: mpsc::Receiver<RoomEvent>, timestamp_format: String) {
    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::Connection { connected: true } => println!("* connected"),
            RoomEvent::Connection { connected: false } => println!("* disconnected, retrying"),
            RoomEvent::PeerResolved(user) => println!("* chatting with {}", user.display_name()),
            RoomEvent::Appended(view) => println!("{}", render(&view, &timestamp_format)),
            RoomEvent::Updated { previous, view } => {
                if previous != view.id || matches!(view.status, MessageStatus::Failed(_)) {
                    println!("~ {}", render(&view, &timestamp_format));
                }
            }
            RoomEvent::Removed(id) => println!("* message {id} deleted"),
            RoomEvent::Reloaded(views) => {
                println!("* history ({} messages)", views.len());
                for view in &views {
                    println!("{}", render(view, &timestamp_format));
                }
            }
            RoomEvent::ScrollToLatest => {}
            RoomEvent::Alert(text) => println!("! {text}"),
            RoomEvent::Failed { action, error } => println!("! {action} failed: {error}"),
        }
    }
}

fn render(view: &MessageView, timestamp_format: &str) -> String {
    let time = view.timestamp.map_or_else(String::new, |ts| {
        format!(
            "[{}] ",
            ts.with_timezone(&chrono::Local).format(timestamp_format)
        )
    });
    let status = match &view.status {
        MessageStatus::Pending => " (sending)".to_string(),
        MessageStatus::Sent => " (sent)".to_string(),
        MessageStatus::Delivered => String::new(),
        MessageStatus::Failed(reason) => format!(" (failed: {reason})"),
    };
    let actions = if view.can_confirm() {
        format!("  -> /confirm {0} or /cancel {0}", view.id)
    } else {
        String::new()
    };
    format!(
        "{time}{}: {}{status}  #{}{actions}",
        view.sender_label,
        view.body(),
        view.id
    )
}
