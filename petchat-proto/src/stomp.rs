//! STOMP 1.2 frame codec.
//!
//! The chat transport runs STOMP over WebSocket text frames. Each frame is
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! body^@
//! ```
//!
//! Header names and values are escaped (`\\`, `\n`, `\r`, `\c`) on every
//! command except `CONNECT` and `CONNECTED`. A `content-length` header, when
//! present, bounds the body; otherwise the body runs to the first NUL.
//! Bare EOLs between frames are heart-beats.

use std::fmt;

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The command line is missing or not a known STOMP command.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    /// The frame ended before the header block was terminated.
    #[error("truncated frame: {0}")]
    Truncated(&'static str),
    /// A header line had no `:` separator.
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    /// A header used an escape sequence STOMP does not define.
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),
    /// The `content-length` header was not a number or exceeds the frame.
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    /// The body was not followed by the NUL terminator.
    #[error("frame is not NUL-terminated")]
    MissingNul,
    /// The frame is not valid UTF-8 where text is required.
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

/// STOMP frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client opens a session.
    Connect,
    /// Alias for `CONNECT` in STOMP 1.2.
    Stomp,
    /// Server accepts a session.
    Connected,
    /// Client sends to a destination.
    Send,
    /// Client subscribes to a destination.
    Subscribe,
    /// Client removes a subscription.
    Unsubscribe,
    /// Client acknowledges a message.
    Ack,
    /// Client rejects a message.
    Nack,
    /// Client starts a transaction.
    Begin,
    /// Client commits a transaction.
    Commit,
    /// Client aborts a transaction.
    Abort,
    /// Client closes the session.
    Disconnect,
    /// Server delivers a subscribed message.
    Message,
    /// Server confirms a receipt request.
    Receipt,
    /// Server reports an error.
    Error,
}

impl Command {
    /// Returns the command as it appears on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(line: &str) -> Option<Self> {
        Some(match line {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    /// `CONNECT`, `STOMP` and `CONNECTED` headers are never escaped.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names are allowed; the first wins.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the value of the first header called `name`.
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::NotUtf8`] if the body is binary.
    pub fn body_str(&self) -> Result<&str, FrameError> {
        std::str::from_utf8(&self.body).map_err(|_| FrameError::NotUtf8)
    }

    /// Encodes the frame, including the trailing NUL.
    ///
    /// A `content-length` header is added for non-empty bodies unless the
    /// caller already set one.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            push_header_part(&mut out, name, escape);
            out.push(b':');
            push_header_part(&mut out, value, escape);
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decodes one frame from `bytes`.
    ///
    /// Returns `Ok(None)` if the input holds only heart-beat EOLs. Bytes
    /// after the NUL terminator are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first structural problem.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, FrameError> {
        let start = bytes
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(bytes.len());
        let rest = &bytes[start..];
        if matches!(rest, [] | [0]) {
            return Ok(None);
        }

        let (command_line, mut rest) = split_line(rest).ok_or(FrameError::Truncated("command"))?;
        let command_line = std::str::from_utf8(command_line).map_err(|_| FrameError::NotUtf8)?;
        let command = Command::parse(command_line)
            .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;
        let escaped = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let (line, next) = split_line(rest).ok_or(FrameError::Truncated("headers"))?;
            rest = next;
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(line).map_err(|_| FrameError::NotUtf8)?;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escaped {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let frame = Self {
            command,
            headers,
            body: Vec::new(),
        };
        let body = match frame.get_header("content-length") {
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(raw.to_string()))?;
                if rest.len() <= len {
                    return Err(FrameError::InvalidContentLength(raw.to_string()));
                }
                if rest[len] != 0 {
                    return Err(FrameError::MissingNul);
                }
                &rest[..len]
            }
            None => {
                let nul = rest
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or(FrameError::MissingNul)?;
                &rest[..nul]
            }
        };

        Ok(Some(Self {
            body: body.to_vec(),
            ..frame
        }))
    }
}

/// Splits off one line terminated by `\n` (a preceding `\r` is dropped).
fn split_line(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let nl = bytes.iter().position(|b| *b == b'\n')?;
    let line = &bytes[..nl];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, &bytes[nl + 1..]))
}

fn push_header_part(out: &mut Vec<u8>, s: &str, escape: bool) {
    if !escape {
        out.extend_from_slice(s.as_bytes());
        return;
    }
    for ch in s.chars() {
        match ch {
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            ':' => out.extend_from_slice(b"\\c"),
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}

/// Builds the `CONNECT` frame that opens a session.
///
/// Heart-beating is disabled; the transport relies on socket close to
/// notice a dead broker.
#[must_use]
pub fn connect_frame(host: &str, authorization: Option<&str>) -> Frame {
    let frame = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", "0,0");
    match authorization {
        Some(token) => frame.header("Authorization", format!("Bearer {token}")),
        None => frame,
    }
}

/// Builds a `SUBSCRIBE` frame with automatic acknowledgment.
#[must_use]
pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

/// Builds a `SEND` frame carrying a JSON body.
#[must_use]
pub fn send_frame(destination: &str, json_body: Vec<u8>) -> Frame {
    Frame::new(Command::Send)
        .header("destination", destination)
        .header("content-type", "application/json")
        .with_body(json_body)
}

/// Builds a `DISCONNECT` frame.
#[must_use]
pub fn disconnect_frame() -> Frame {
    Frame::new(Command::Disconnect)
}
