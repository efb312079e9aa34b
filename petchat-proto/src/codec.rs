//! JSON body codec for chat messages.
//!
//! STOMP `MESSAGE`/`SEND` bodies and REST history responses both carry
//! messages as JSON. Decoding goes through the identifier normalization in
//! [`crate::message`], so a body that passes here has canonical ids.

use crate::message::ChatMessage;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Encodes a [`ChatMessage`] into its JSON wire form.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode(message: &ChatMessage) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decodes a [`ChatMessage`] from a JSON body.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid message.
pub fn decode(bytes: &[u8]) -> Result<ChatMessage, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decodes a JSON array of messages, as returned by the history endpoint.
///
/// Each entry is decoded on its own, so one bad row does not hide the
/// others; the result keeps the array order.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the body is not a JSON array.
pub fn decode_list(bytes: &[u8]) -> Result<Vec<Result<ChatMessage, CodecError>>, CodecError> {
    let entries: Vec<serde_json::Value> = serde_json::from_slice(bytes)?;
    Ok(entries
        .into_iter()
        .map(|entry| Ok(serde_json::from_value(entry)?))
        .collect())
}
