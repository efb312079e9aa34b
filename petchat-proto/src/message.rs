//! Wire format message types for the `PetChat` protocol.
//!
//! The backend speaks loosely-typed JSON: identifiers arrive as numbers or
//! numeric strings and the message `type` is a free-form string. This module
//! normalizes both at the boundary: identifiers become [`UserId`], [`PetId`]
//! and [`MessageId`], and the `type`/`content` pair becomes a
//! [`MessageKind`]. The JSON shape on the wire is preserved in both
//! directions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Wire `type` of a plain text message.
pub const TYPE_TEXT: &str = "text";
/// Wire `type` of an image message (content is the image URL).
pub const TYPE_IMAGE: &str = "Image";
/// Wire `type` of a location message (content is `"lat,lng"`).
pub const TYPE_LOCATION: &str = "LOCATION";
/// Wire `type` of an adoption request.
pub const TYPE_ADOPTION: &str = "adoption message";

/// Prefix used when a local placeholder id is rendered as a string.
const LOCAL_ID_PREFIX: &str = "local-";

/// Error returned when an identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier {0:?}")]
pub struct IdParseError(pub String);

/// A number-or-string identifier as sent by the backend.
#[derive(Deserialize)]
#[serde(untagged)]
enum LooseInt {
    Int(i64),
    Str(String),
}

impl LooseInt {
    fn into_i64(self) -> Result<i64, IdParseError> {
        match self {
            Self::Int(n) => Ok(n),
            Self::Str(s) => parse_loose(&s),
        }
    }
}

fn parse_loose(s: &str) -> Result<i64, IdParseError> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| IdParseError(s.to_string()))
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw numeric identifier.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Returns the raw numeric identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_loose(s).map(Self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                LooseInt::deserialize(deserializer)?
                    .into_i64()
                    .map(Self)
                    .map_err(serde::de::Error::custom)
            }
        }
    };
}

numeric_id!(
    /// Identifies a marketplace user (owner, vet, provider, admin).
    UserId
);

numeric_id!(
    /// Identifies a pet record referenced by adoption requests.
    PetId
);

/// Identifies a message in the chat log.
///
/// Server-assigned ids are integers. Messages rendered before the server
/// has seen them carry a `Local` placeholder (UUID v7) which is never
/// written into the outbound `id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Durable id assigned by the backend.
    Server(i64),
    /// Non-durable placeholder minted by this client.
    Local(Uuid),
}

impl MessageId {
    /// Mints a fresh local placeholder id.
    #[must_use]
    pub fn local() -> Self {
        Self::Local(Uuid::now_v7())
    }

    /// Returns `true` for a local placeholder.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Returns the server id, if assigned.
    #[must_use]
    pub const fn server(&self) -> Option<i64> {
        match self {
            Self::Server(n) => Some(*n),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(n) => write!(f, "{n}"),
            Self::Local(uuid) => write!(f, "{LOCAL_ID_PREFIX}{uuid}"),
        }
    }
}

impl FromStr for MessageId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(raw) = s.trim().strip_prefix(LOCAL_ID_PREFIX) {
            return Uuid::parse_str(raw)
                .map(Self::Local)
                .map_err(|_| IdParseError(s.to_string()));
        }
        parse_loose(s).map(Self::Server)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Server(n) => serializer.serialize_i64(*n),
            Self::Local(_) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match LooseInt::deserialize(deserializer)? {
            LooseInt::Int(n) => Ok(Self::Server(n)),
            LooseInt::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Content of a chat message, discriminated by the wire `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// Free text.
    Text(String),
    /// An uploaded image, referenced by URL.
    Image {
        /// Where the image can be fetched.
        url: String,
    },
    /// A shared device location.
    Location {
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lng: f64,
    },
    /// An adoption offer the receiver can confirm or cancel.
    AdoptionRequest {
        /// Human-readable request text.
        text: String,
        /// The pet being adopted, when the sender attached one.
        pet_id: Option<PetId>,
    },
    /// Any other wire type, kept verbatim.
    Other {
        /// The wire `type` string.
        kind: String,
        /// The raw wire content.
        content: String,
    },
}

impl MessageKind {
    /// Builds a kind from the wire `type`, `content` and `petId` fields.
    ///
    /// Type matching is case-insensitive. A `LOCATION` whose content is not
    /// a valid `"lat,lng"` pair is kept as [`MessageKind::Other`].
    #[must_use]
    pub fn from_wire(kind: &str, content: String, pet_id: Option<PetId>) -> Self {
        if kind.eq_ignore_ascii_case(TYPE_TEXT) {
            Self::Text(content)
        } else if kind.eq_ignore_ascii_case(TYPE_IMAGE) {
            Self::Image { url: content }
        } else if kind.eq_ignore_ascii_case(TYPE_ADOPTION) {
            Self::AdoptionRequest {
                text: content,
                pet_id,
            }
        } else if kind.eq_ignore_ascii_case(TYPE_LOCATION) {
            match parse_lat_lng(&content) {
                Some((lat, lng)) => Self::Location { lat, lng },
                None => Self::Other {
                    kind: kind.to_string(),
                    content,
                },
            }
        } else {
            Self::Other {
                kind: kind.to_string(),
                content,
            }
        }
    }

    /// Returns the wire `type` string.
    #[must_use]
    pub fn wire_type(&self) -> &str {
        match self {
            Self::Text(_) => TYPE_TEXT,
            Self::Image { .. } => TYPE_IMAGE,
            Self::Location { .. } => TYPE_LOCATION,
            Self::AdoptionRequest { .. } => TYPE_ADOPTION,
            Self::Other { kind, .. } => kind,
        }
    }

    /// Returns the wire `content` string.
    #[must_use]
    pub fn wire_content(&self) -> String {
        match self {
            Self::Text(text) | Self::AdoptionRequest { text, .. } => text.clone(),
            Self::Image { url } => url.clone(),
            Self::Location { lat, lng } => format!("{lat},{lng}"),
            Self::Other { content, .. } => content.clone(),
        }
    }

    /// Returns the pet an adoption request refers to.
    #[must_use]
    pub const fn pet_id(&self) -> Option<PetId> {
        match self {
            Self::AdoptionRequest { pet_id, .. } => *pet_id,
            _ => None,
        }
    }

    /// Returns `true` for adoption requests.
    #[must_use]
    pub const fn is_adoption_request(&self) -> bool {
        matches!(self, Self::AdoptionRequest { .. })
    }
}

/// Parses a `"lat,lng"` pair, rejecting out-of-range coordinates.
#[must_use]
pub fn parse_lat_lng(content: &str) -> Option<(f64, f64)> {
    let (lat, lng) = content.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lng: f64 = lng.trim().parse().ok()?;
    let valid = lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng);
    valid.then_some((lat, lng))
}

/// Denormalized display info about the sender, attached by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Sender's first name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    /// Sender's last name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
}

/// A chat message between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct ChatMessage {
    /// Server id, or a local placeholder until the server reflects it.
    pub id: MessageId,
    /// Client-generated correlation id echoed back by the backend.
    pub client_id: Option<Uuid>,
    /// Who sent the message.
    pub sender_id: UserId,
    /// Who the message is addressed to.
    pub receiver_id: UserId,
    /// What the message carries.
    pub kind: MessageKind,
    /// Server-side adoption flag; `Some(true)` once accepted.
    pub confirmed: Option<bool>,
    /// Denormalized sender display info.
    pub sender: Option<SenderInfo>,
    /// When the message was created.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Builds a new outgoing message with a local placeholder id.
    ///
    /// The placeholder doubles as the `clientId` correlation token so a
    /// server echo can be matched back to the optimistic copy.
    #[must_use]
    pub fn outgoing(sender_id: UserId, receiver_id: UserId, kind: MessageKind) -> Self {
        let uuid = Uuid::now_v7();
        Self {
            id: MessageId::Local(uuid),
            client_id: Some(uuid),
            sender_id,
            receiver_id,
            kind,
            confirmed: None,
            sender: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Validates this message for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if the text or image URL is blank,
    /// or [`ValidationError::TooLarge`] if the content exceeds
    /// [`MAX_MESSAGE_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        let content = self.kind.wire_content();
        let blank = match &self.kind {
            MessageKind::Text(_)
            | MessageKind::Image { .. }
            | MessageKind::AdoptionRequest { .. }
            | MessageKind::Other { .. } => content.trim().is_empty(),
            MessageKind::Location { .. } => false,
        };
        if blank {
            return Err(ValidationError::Empty);
        }
        if content.len() > MAX_MESSAGE_SIZE {
            return Err(ValidationError::TooLarge {
                size: content.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Returns `true` if the server (or a local cache) reports the
    /// adoption as accepted.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.confirmed == Some(true)
    }
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// The flat JSON shape exchanged with the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<Uuid>,
    sender_id: UserId,
    receiver_id: UserId,
    #[serde(default)]
    content: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pet_id: Option<PetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confirmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<SenderInfo>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<WireMessage> for ChatMessage {
    type Error = IdParseError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kind = wire.kind.unwrap_or_else(|| TYPE_TEXT.to_string());
        let content = wire.content.unwrap_or_default();
        let id = match wire.id {
            Some(id) => id,
            None => wire.client_id.map_or_else(MessageId::local, MessageId::Local),
        };
        Ok(Self {
            id,
            client_id: wire.client_id,
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            kind: MessageKind::from_wire(&kind, content, wire.pet_id),
            confirmed: wire.confirmed,
            sender: wire.sender,
            timestamp: wire.timestamp,
        })
    }
}

impl From<ChatMessage> for WireMessage {
    fn from(msg: ChatMessage) -> Self {
        Self {
            id: msg.id.server().map(MessageId::Server),
            client_id: msg.client_id,
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            content: Some(msg.kind.wire_content()),
            kind: Some(msg.kind.wire_type().to_string()),
            pet_id: msg.kind.pet_id(),
            confirmed: msg.confirmed,
            sender: msg.sender,
            timestamp: msg.timestamp,
        }
    }
}

/// Accepts RFC 3339, zone-less ISO local date-times (taken as UTC) and
/// epoch milliseconds. Anything else is dropped rather than failing the
/// whole message.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => parse_timestamp(&s),
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// An unordered pair of participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conversation {
    low: UserId,
    high: UserId,
}

impl Conversation {
    /// Creates the conversation between `a` and `b` (order irrelevant).
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    /// Returns `true` iff `{sender, receiver} == {a, b}`.
    #[must_use]
    pub fn contains(&self, msg: &ChatMessage) -> bool {
        Self::new(msg.sender_id, msg.receiver_id) == *self
    }

    /// Returns the other participant, if `me` is one of the two.
    #[must_use]
    pub fn counterpart(&self, me: UserId) -> Option<UserId> {
        if me == self.low {
            Some(self.high)
        } else if me == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}
