//! Identity of the signed-in user.
//!
//! The backend issues a JWT at login. The client never verifies the
//! signature (the broker and REST API do that); it only reads the payload
//! to learn its own user id.

use base64::prelude::*;
use petchat_proto::message::UserId;

/// Payload claims checked for the user id, in order.
const ID_CLAIMS: [&str; 3] = ["id", "userId", "sub"];

/// Errors decoding a session token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token does not have three dot-separated segments.
    #[error("token is not a JWT")]
    Malformed,

    /// The payload segment is not valid base64url.
    #[error("token payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The payload is not a JSON object.
    #[error("token payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// None of the known claims holds a numeric user id.
    #[error("token carries no numeric user id")]
    MissingUserId,
}

/// The signed-in user and the bearer token to present to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Who we are.
    pub user_id: UserId,
    /// Raw JWT, sent as `Authorization: Bearer <token>`.
    pub token: String,
}

impl Identity {
    /// Read the user id out of a JWT.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the token cannot be decoded or carries no
    /// usable id claim.
    pub fn from_token(token: &str) -> Result<Self, AuthError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        let mut segments = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuthError::Malformed);
        };

        let bytes = BASE64_URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        let claims: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)?;

        let user_id = ID_CLAIMS
            .iter()
            .filter_map(|name| claims.get(*name))
            .find_map(|value| serde_json::from_value::<UserId>(value.clone()).ok())
            .ok_or(AuthError::MissingUserId)?;

        Ok(Self {
            user_id,
            token: token.to_string(),
        })
    }
}
