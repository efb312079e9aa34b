//! [`ChatApi`] over HTTP with `reqwest`.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use url::Url;

use petchat_proto::codec;
use petchat_proto::message::{ChatMessage, PetId, UserId};

use super::{ApiError, ChatApi, Upload, User};

/// Default REST base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    #[serde(default)]
    image_url: Option<String>,
}

/// REST client for the marketplace backend.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpChatApi {
    /// Build a client for `base_url`, authenticating with `token` if given.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] for an unparseable base URL and
    /// [`ApiError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// The normalized base URL (always ends with `/`).
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))?;
        let builder = self.client.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    /// Send and turn non-2xx responses into [`ApiError::Status`].
    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), body = %body, "backend returned an error");
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl ChatApi for HttpChatApi {
    async fn history(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>, ApiError> {
        let request = self.request(Method::GET, &format!("api/messages/history/{a}/{b}"))?;
        let bytes = self.send(request).await?.bytes().await?;
        let messages = decode_history(&bytes)?;
        tracing::debug!(%a, %b, count = messages.len(), "history loaded");
        Ok(messages)
    }

    async fn delete_message(&self, id: i64) -> Result<(), ApiError> {
        let request = self.request(Method::DELETE, &format!("api/messages/{id}"))?;
        self.send(request).await?;
        tracing::debug!(id, "message deleted");
        Ok(())
    }

    async fn upload_image(&self, upload: Upload) -> Result<String, ApiError> {
        let Upload { file_name, bytes } = upload;
        let size = bytes.len();
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);
        let request = self
            .request(Method::POST, "api/messages/upload")?
            .multipart(form);
        let response: UploadResponse = self.send(request).await?.json().await?;
        let url = response
            .image_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(ApiError::MissingImageUrl)?;
        tracing::debug!(file_name = %file_name, size, url = %url, "image uploaded");
        Ok(url)
    }

    async fn user(&self, id: UserId) -> Result<User, ApiError> {
        let request = self.request(Method::GET, &format!("api/users/{id}"))?;
        Ok(self.send(request).await?.json().await?)
    }

    async fn confirm_adoption(&self, adopter: UserId, pet: PetId) -> Result<(), ApiError> {
        let request = self
            .request(Method::POST, "api/adoptions/confirm")?
            .query(&[("adopterId", adopter.get()), ("petId", pet.get())]);
        self.send(request).await?;
        tracing::info!(%adopter, %pet, "adoption confirmed");
        Ok(())
    }

    async fn cancel_adoption(&self, pet: PetId) -> Result<(), ApiError> {
        let request = self
            .request(Method::POST, "api/adoptions/cancel")?
            .query(&[("petId", pet.get())]);
        self.send(request).await?;
        tracing::info!(%pet, "adoption cancelled");
        Ok(())
    }

    async fn chat_users(&self, me: UserId) -> Result<Vec<User>, ApiError> {
        let request = self.request(Method::GET, &format!("api/messages/chat-users/{me}"))?;
        Ok(self.send(request).await?.json().await?)
    }
}

/// Decode a history body, skipping rows that are not valid messages.
fn decode_history(bytes: &[u8]) -> Result<Vec<ChatMessage>, ApiError> {
    let entries = codec::decode_list(bytes).map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match entry {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(index, err = %e, "skipping malformed history entry");
                None
            }
        })
        .collect())
}
