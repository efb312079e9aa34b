//! Client settings: backend endpoints, transport timings, session and display.
//!
//! A value set on the command line (or through its `PETCHAT_*` variable)
//! beats the TOML file at `~/.config/petchat/config.toml`, which beats the
//! compiled defaults. Without `--config` an absent file just means
//! defaults; a `--config` path that cannot be read stops startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use petchat_proto::message::UserId;

use crate::api::http::DEFAULT_API_URL;
use crate::chat::room::RoomConfig;
use crate::location::Coordinates;
use crate::transport::stomp::{
    DEFAULT_SEND_DESTINATION, DEFAULT_TOPIC, DEFAULT_WS_URL, StompConfig,
};

const CONFIG_DIR: &str = "petchat";
const CONFIG_FILE: &str = "config.toml";

/// Why the config file could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read, or an explicit path is missing.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this layout.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// On-disk layout; every field optional so a file may set only a few
// ---------------------------------------------------------------------------

/// The whole config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    transport: TransportFileConfig,
    session: SessionFileConfig,
    ui: UiFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_url: Option<String>,
    ws_url: Option<String>,
    topic: Option<String>,
    send_destination: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// `[transport]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    connect_timeout_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    token: Option<String>,
    peer: Option<UserId>,
    initial_message: Option<String>,
    location: Option<Coordinates>,
    storage_path: Option<PathBuf>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Effective settings
// ---------------------------------------------------------------------------

/// Settings after CLI, file and defaults are merged.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Base URL of the REST API.
    pub api_url: String,
    /// WebSocket URL of the STOMP endpoint.
    pub ws_url: String,
    /// Broadcast topic to subscribe to.
    pub topic: String,
    /// Destination for outgoing messages.
    pub send_destination: String,
    /// Timeout for each REST request.
    pub request_timeout: Duration,

    // -- Transport --
    /// Timeout for opening the socket and the STOMP handshake.
    pub connect_timeout: Duration,
    /// Pause before reconnecting after a lost session.
    pub reconnect_delay: Duration,
    /// Capacity of event and command channels.
    pub channel_capacity: usize,

    // -- Session --
    /// Auth token (JWT) identifying the local user.
    pub token: Option<String>,
    /// Peer to chat with.
    pub peer: Option<UserId>,
    /// Text sent once when the room first connects.
    pub initial_message: Option<String>,
    /// Position reported by `/location`. Unset means location is denied.
    pub location: Option<Coordinates>,
    /// Path of the durable key-value file.
    pub storage_path: Option<PathBuf>,

    // -- UI --
    /// Format for message times, `strftime` style.
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            send_destination: DEFAULT_SEND_DESTINATION.to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            channel_capacity: 256,
            token: None,
            peer: None,
            initial_message: None,
            location: None,
            storage_path: None,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Read the config file named by `cli` (or the default one) and
    /// overlay the command-line values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// CLI over file over default, field by field.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.server.api_url.clone())
                .unwrap_or(defaults.api_url),
            ws_url: cli
                .ws_url
                .clone()
                .or_else(|| file.server.ws_url.clone())
                .unwrap_or(defaults.ws_url),
            topic: file.server.topic.clone().unwrap_or(defaults.topic),
            send_destination: file
                .server
                .send_destination
                .clone()
                .unwrap_or(defaults.send_destination),
            request_timeout: file
                .server
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            connect_timeout: file
                .transport
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect_delay: file
                .transport
                .reconnect_delay_secs
                .map_or(defaults.reconnect_delay, Duration::from_secs),
            channel_capacity: file
                .transport
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            token: cli.token.clone().or_else(|| file.session.token.clone()),
            peer: cli.peer.or(file.session.peer),
            initial_message: cli
                .initial_message
                .clone()
                .or_else(|| file.session.initial_message.clone()),
            location: cli.location.or(file.session.location),
            storage_path: cli
                .storage_path
                .clone()
                .or_else(|| file.session.storage_path.clone()),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Build the STOMP transport settings.
    #[must_use]
    pub fn to_stomp_config(&self) -> StompConfig {
        StompConfig {
            url: self.ws_url.clone(),
            topic: self.topic.clone(),
            send_destination: self.send_destination.clone(),
            auth_token: self.token.clone(),
            connect_timeout: self.connect_timeout,
            reconnect_delay: self.reconnect_delay,
            event_buffer: self.channel_capacity,
        }
    }

    /// Build the room settings for `me`, if a peer is configured.
    #[must_use]
    pub fn to_room_config(&self, me: UserId) -> Option<RoomConfig> {
        let peer = self.peer?;
        let mut room = RoomConfig::new(me, peer);
        room.initial_message.clone_from(&self.initial_message);
        room.event_buffer = self.channel_capacity;
        Some(room)
    }
}

/// Command-line flags of the `petchat` binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Pet-care marketplace chat client")]
pub struct CliArgs {
    /// Base URL of the REST API.
    #[arg(long, env = "PETCHAT_API_URL")]
    pub api_url: Option<String>,

    /// WebSocket URL of the STOMP endpoint.
    #[arg(long, env = "PETCHAT_WS_URL")]
    pub ws_url: Option<String>,

    /// Auth token (JWT) of the local user.
    #[arg(long, env = "PETCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// User id of the peer to chat with.
    #[arg(long)]
    pub peer: Option<UserId>,

    /// Message sent once when the room first connects.
    #[arg(long)]
    pub initial_message: Option<String>,

    /// Position reported by `/location`, as `lat,lng`.
    #[arg(long)]
    pub location: Option<Coordinates>,

    /// Path of the durable key-value file.
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Path to config file (default: `~/.config/petchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// `strftime`-style format for message times.
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log filter directive, e.g. `info` or `petchat=debug`. `RUST_LOG` wins.
    #[arg(long, default_value = "info", env = "PETCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/petchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Parse the config file. An explicit path must exist; the default one
/// may be absent.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    match explicit_path {
        Some(path) => read_config_file(path, true),
        None => dirs::config_dir().map_or_else(
            || Ok(ConfigFile::default()),
            |dir| read_config_file(&dir.join(CONFIG_DIR).join(CONFIG_FILE), false),
        ),
    }
}

fn read_config_file(path: &Path, required: bool) -> Result<ConfigFile, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(ConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}
