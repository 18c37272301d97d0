//! HTTP implementation of the generation stream transport.
//!
//! `POST {base}/chat/stream` with a JSON body; the response body is a
//! line-framed event stream consumed chunk by chunk. Cancelling the
//! owning session aborts the read task, which drops the body stream and
//! releases the connection.

use crate::error::TransportError;
use crate::streaming::session::{ByteStream, ChatTransport, StreamRequest};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

/// Build the default header set for stream requests.
fn build_headers(auth_token: Option<&str>) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(token) = auth_token {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Request(format!("invalid auth token: {e}")))?,
        );
    }
    Ok(headers)
}

#[derive(Clone)]
pub struct HttpChatTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatTransport {
    pub fn new(base_url: &str, auth_token: Option<&str>) -> Result<Self, TransportError> {
        let headers = build_headers(auth_token)?;
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ChatTransport for HttpChatTransport {
    fn open_stream(
        &self,
        request: StreamRequest,
    ) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
        let client = self.client.clone();
        let url = format!("{}/chat/stream", self.base_url);
        async move {
            debug!("opening generation stream at {url}");
            let response = client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| TransportError::Request(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = crate::upload_client::error_detail_from_body(&body)
                    .unwrap_or_else(|| status.to_string());
                return Err(TransportError::Status {
                    code: status.as_u16(),
                    message,
                });
            }

            let stream: ByteStream = response
                .bytes_stream()
                .map_ok(|chunk| chunk.to_vec())
                .map_err(|e| TransportError::Read(e.to_string()))
                .boxed();
            Ok(stream)
        }
        .boxed()
    }
}
