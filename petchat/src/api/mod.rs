//! REST calls the chat core makes against the marketplace backend.
//!
//! [`ChatApi`] is the seam: [`http::HttpChatApi`] talks to the real
//! backend, [`memory::MemoryApi`] keeps everything in process for tests.

pub mod http;
pub mod memory;

use petchat_proto::message::{ChatMessage, PetId, UserId};
use serde::{Deserialize, Serialize};

/// A marketplace user as returned by the users endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: UserId,
    /// First name.
    #[serde(default)]
    pub firstname: Option<String>,
    /// Last name.
    #[serde(default)]
    pub lastname: Option<String>,
    /// Avatar URL.
    #[serde(default)]
    pub image: Option<String>,
}

impl User {
    /// A user with just an id and names.
    pub fn named(id: UserId, firstname: impl Into<String>, lastname: impl Into<String>) -> Self {
        Self {
            id,
            firstname: Some(firstname.into()),
            lastname: Some(lastname.into()),
            image: None,
        }
    }

    /// `"first last"`, whichever parts are present, or `User <id>`.
    #[must_use]
    pub fn display_name(&self) -> String {
        let name = [self.firstname.as_deref(), self.lastname.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            format!("User {}", self.id)
        } else {
            name
        }
    }
}

/// An image to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Original file name.
    pub file_name: String,
    /// Raw file bytes.
    pub bytes: Vec<u8>,
}

/// Errors from REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the response not read.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The response body was not what the endpoint promises.
    #[error("unexpected response body: {0}")]
    Decode(String),

    /// The upload response had no `imageUrl`.
    #[error("upload response carried no image URL")]
    MissingImageUrl,

    /// The configured base URL cannot be used.
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Backend operations used by the chat room and conversation list.
pub trait ChatApi: Send + Sync {
    /// Full history between `a` and `b`, oldest first.
    fn history(
        &self,
        a: UserId,
        b: UserId,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, ApiError>> + Send;

    /// Delete a persisted message.
    fn delete_message(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// Upload an image and return the URL it is served from.
    fn upload_image(
        &self,
        upload: Upload,
    ) -> impl std::future::Future<Output = Result<String, ApiError>> + Send;

    /// Fetch a user profile.
    fn user(&self, id: UserId)
    -> impl std::future::Future<Output = Result<User, ApiError>> + Send;

    /// Accept an adoption request: `adopter` gets `pet`.
    fn confirm_adoption(
        &self,
        adopter: UserId,
        pet: PetId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// Withdraw the adoption offer for `pet`.
    fn cancel_adoption(
        &self,
        pet: PetId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// Everyone `me` has exchanged messages with.
    fn chat_users(
        &self,
        me: UserId,
    ) -> impl std::future::Future<Output = Result<Vec<User>, ApiError>> + Send;
}
