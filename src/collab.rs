//! Upload and fetch collaborators
//!
//! The pipeline hands finished clips to an [`UploadCollaborator`] and gets
//! playable URLs back from a [`FetchCollaborator`]. [`HttpCollaborator`]
//! implements both against the REST backend with reqwest.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::Clip;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("there is no recording to send")]
    NothingToSend,
}

/// Where an uploaded clip ends up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Post,
    Comment { post_id: String },
}

impl UploadTarget {
    pub fn path(&self) -> String {
        match self {
            UploadTarget::Post => "/posts".to_string(),
            UploadTarget::Comment { post_id } => format!("/posts/{}/comment", post_id),
        }
    }

    fn file_prefix(&self) -> &'static str {
        match self {
            UploadTarget::Post => "post-audio",
            UploadTarget::Comment { .. } => "comment-audio",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub clip: Clip,
    pub description: Option<String>,
}

impl UploadRequest {
    /// Non-file multipart fields, in the order they are sent
    pub fn text_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(description) = self.description.as_ref().filter(|d| !d.trim().is_empty()) {
            fields.push(("description", description.clone()));
        }
        fields.push((
            "audioDuration",
            format!("{:.2}", self.clip.duration_seconds as f64),
        ));
        fields
    }
}

/// A persisted post or comment carrying a clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipRecord {
    pub id: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_duration: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Response envelope used by every backend endpoint
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    success: Option<bool>,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_data(self) -> Result<T, CollabError> {
        if self.success == Some(false) {
            return Err(CollabError::MalformedResponse(
                self.message.unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        self.data
            .ok_or_else(|| CollabError::MalformedResponse("response has no data".to_string()))
    }
}

#[async_trait]
pub trait UploadCollaborator: Send + Sync {
    async fn upload(&self, target: &UploadTarget, request: UploadRequest)
        -> Result<ClipRecord, CollabError>;
}

#[async_trait]
pub trait FetchCollaborator: Send + Sync {
    async fn fetch_post(&self, id: &str) -> Result<ClipRecord, CollabError>;
}

pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCollaborator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => {
                warn!("No auth token provided, making unauthenticated request");
                request
            }
        }
    }

    async fn read_record(response: reqwest::Response) -> Result<ClipRecord, CollabError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or(body);
            error!("Request failed with status {}: {}", status, message);
            return Err(CollabError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str::<ApiResponse<ClipRecord>>(&body)
            .map_err(|e| CollabError::MalformedResponse(e.to_string()))?
            .into_data()
    }
}

#[async_trait]
impl UploadCollaborator for HttpCollaborator {
    async fn upload(
        &self,
        target: &UploadTarget,
        request: UploadRequest,
    ) -> Result<ClipRecord, CollabError> {
        let url = self.url(&target.path());
        info!(
            "Uploading {} bytes ({}s) to {}",
            request.clip.len(),
            request.clip.duration_seconds,
            url
        );

        let mut form = Form::new();
        for (name, value) in request.text_fields() {
            form = form.text(name, value);
        }
        let audio = Part::bytes(request.clip.data.to_vec())
            .file_name(request.clip.file_name(target.file_prefix()))
            .mime_str(&request.clip.mime_type)?;
        form = form.part("audio", audio);

        let response = self
            .authorize(self.client.post(&url))
            .multipart(form)
            .send()
            .await?;
        let record = Self::read_record(response).await?;
        debug!("Upload stored as {}", record.id);
        Ok(record)
    }
}

#[async_trait]
impl FetchCollaborator for HttpCollaborator {
    async fn fetch_post(&self, id: &str) -> Result<ClipRecord, CollabError> {
        let url = self.url(&format!("/posts/{}", id));
        debug!("Fetching {}", url);
        let response = self.authorize(self.client.get(&url)).send().await?;
        Self::read_record(response).await
    }
}
