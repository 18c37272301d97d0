//! Attachment upload coordinator.
//!
//! One multipart `POST /file/upload` per attachment, bearer-token
//! authenticated. No retry: a failure is returned immediately with the
//! most specific human-readable reason the response offered, and the
//! caller decides what to do. The coordinator mutates no message or
//! session state.

use crate::error::UploadError;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, info};
use reqwest::multipart;
use serde::Deserialize;

/// A binary attachment ready to ship.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

impl UploadPayload {
    pub fn wav(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: "audio/wav".to_string(),
            file_name: "voice.wav".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    pub url: String,
}

/// Seam between upload callers (capture machine, image send path) and the
/// wire. Callers must not issue two uploads concurrently for the same
/// logical attachment slot; the originating control stays disabled for
/// the duration.
pub trait AttachmentUploader: Send + Sync + 'static {
    fn upload(&self, payload: UploadPayload) -> BoxFuture<'static, Result<UploadResult, UploadError>>;
}

#[derive(Deserialize)]
struct UploadResponse {
    success: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Extract a human-readable reason from a non-success response body, if
/// the server included one.
pub(crate) fn error_detail_from_body(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.detail.or(parsed.error).filter(|d| !d.is_empty())
}

/// HTTP implementation of [`AttachmentUploader`].
#[derive(Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpUploader {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    async fn upload_impl(
        client: reqwest::Client,
        url: String,
        auth_token: Option<String>,
        payload: UploadPayload,
    ) -> Result<UploadResult, UploadError> {
        debug!(
            "uploading {} ({} bytes) to {url}",
            payload.file_name,
            payload.bytes.len()
        );

        let part = multipart::Part::bytes(payload.bytes)
            .file_name(payload.file_name)
            .mime_str(&payload.content_type)
            .map_err(|e| UploadError::Network(format!("invalid content type: {e}")))?;
        let form = multipart::Form::new().part("file", part);

        let mut request = client.post(&url).multipart(form);
        if let Some(token) = &auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = error_detail_from_body(&body)
                .unwrap_or_else(|| format!("upload failed with status {status}"));
            return Err(UploadError::Server(reason));
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| UploadError::Network(format!("malformed upload response: {e}")))?;

        if !parsed.success {
            let reason = parsed
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "upload rejected by server".to_string());
            return Err(UploadError::Server(reason));
        }

        let url = parsed
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| UploadError::Network("upload response missing url".to_string()))?;

        info!("upload complete: {url}");
        Ok(UploadResult { url })
    }
}

impl AttachmentUploader for HttpUploader {
    fn upload(&self, payload: UploadPayload) -> BoxFuture<'static, Result<UploadResult, UploadError>> {
        let client = self.client.clone();
        let url = format!("{}/file/upload", self.base_url);
        let token = self.auth_token.clone();
        Self::upload_impl(client, url, token, payload).boxed()
    }
}
