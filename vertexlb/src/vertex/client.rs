//! HTTP client for the Vertex AI generative-content API.
//!
//! A client is bound to one target's (project, location) coordinates and one
//! model, and lives for a single dispatch attempt. Authentication runs
//! through [`crate::vertex::auth`] on every call.

use std::time::Duration;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::{debug, instrument, trace};
use url::Url;

use crate::errors::{Error, Result, UpstreamFailure};
use crate::vertex::auth::{self, ServiceAccountKey};
use crate::vertex::types::{GenerateContentRequest, GenerateContentResponse, GoogleErrorBody};

pub struct VertexClient {
    http: reqwest::Client,
    key: ServiceAccountKey,
    project_id: String,
    location: String,
    model: String,
    base_url: String,
}

impl VertexClient {
    /// Bind a client to a target's routing coordinates and the requested
    /// model. `base_url_override` replaces the regional endpoint (used to
    /// point at mocks and self-hosted gateways).
    pub fn new(
        http: reqwest::Client,
        key: ServiceAccountKey,
        project_id: &str,
        location: &str,
        model: &str,
        base_url_override: Option<&Url>,
    ) -> Self {
        let base_url = match base_url_override {
            Some(url) => url.as_str().trim_end_matches('/').to_string(),
            None => format!("https://{location}-aiplatform.googleapis.com"),
        };
        Self {
            http,
            key,
            project_id: project_id.to_string(),
            location: location.to_string(),
            model: model.to_string(),
            base_url,
        }
    }

    fn generate_content_url(&self, stream: bool) -> String {
        let method = if stream { "streamGenerateContent" } else { "generateContent" };
        let mut url = format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:{}",
            self.base_url, self.project_id, self.location, self.model, method,
        );
        if stream {
            // SSE framing instead of the default JSON-array chunking.
            url.push_str("?alt=sse");
        }
        url
    }

    #[instrument(skip(self, request), fields(model = %self.model, project = %self.project_id))]
    async fn send_request(&self, request: &GenerateContentRequest, stream: bool) -> Result<reqwest::Response> {
        let url = self.generate_content_url(stream);
        debug!(url = %url, stream, "Sending request to Vertex AI");
        trace!(request = ?request, "Request payload");

        let token = auth::fetch_access_token(&self.http, &self.key).await?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::UpstreamUnavailable {
                        message: format!("Vertex request failed: {e}"),
                    }
                } else {
                    Error::UnknownUpstream {
                        message: format!("Vertex request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        debug!(status = %status, "Received upstream response");

        if !status.is_success() {
            return Err(extract_error(response).await);
        }
        Ok(response)
    }

    /// Unary generation call.
    pub async fn generate(&self, request: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        let response = self.send_request(request, false).await?;
        let body = response.text().await.map_err(|e| Error::UpstreamResponse {
            message: format!("Failed to read Vertex response body: {e}"),
        })?;
        trace!(body = %body, "Response body");

        serde_json::from_str(&body).map_err(|e| Error::UpstreamResponse {
            message: format!("Failed to parse Vertex response: {e}"),
        })
    }

    /// Streaming generation call. Any failure observed here precedes the
    /// first client byte and stays eligible for failover; errors after this
    /// returns are delivered through the stream items instead.
    pub async fn stream_generate(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<BoxStream<'static, Result<GenerateContentResponse>>> {
        let response = self.send_request(request, true).await?;
        debug!("Vertex stream connection established");
        Ok(parse_sse_chunks(response.bytes_stream()).boxed())
    }
}

/// Decode a Vertex `alt=sse` byte stream into typed chunks. Frames are
/// buffered only up to the next newline; nothing is held back beyond that.
fn parse_sse_chunks<S>(bytes: S) -> impl Stream<Item = Result<GenerateContentResponse>> + Send
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
{
    try_stream! {
        futures::pin_mut!(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| Error::UpstreamResponse {
                message: format!("Vertex stream read failed: {e}"),
            })?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\n', '\r']);

                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim_start();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }

                let parsed: GenerateContentResponse =
                    serde_json::from_str(payload).map_err(|e| Error::UpstreamResponse {
                        message: format!("Failed to parse Vertex stream chunk: {e}"),
                    })?;
                yield parsed;
            }
        }
    }
}

/// Turn a non-2xx upstream response into a classified error. The reset hint
/// for rate limits is taken from the `Retry-After` header when present, else
/// from a `google.rpc.RetryInfo` detail in the error body.
async fn extract_error(response: reqwest::Response) -> Error {
    let http_status = response.status().as_u16();
    let retry_after_header = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.unwrap_or_default();

    let mut failure = UpstreamFailure {
        http_status: Some(http_status),
        code: None,
        message: body.clone(),
        retry_after: retry_after_header,
    };

    if let Ok(parsed) = serde_json::from_str::<GoogleErrorBody>(&body) {
        failure.code = parsed.error.code;
        if let Some(message) = parsed.error.message {
            failure.message = message;
        }
        if failure.retry_after.is_none() {
            failure.retry_after = parsed.error.details.as_deref().and_then(retry_info_delay);
        }
    }

    Error::from(failure)
}

/// Find a `google.rpc.RetryInfo` detail and parse its `retryDelay`
/// (`"30s"` / `"1.5s"` protobuf duration rendering).
fn retry_info_delay(details: &[serde_json::Value]) -> Option<Duration> {
    details.iter().find_map(|detail| {
        let kind = detail.get("@type")?.as_str()?;
        if !kind.ends_with("google.rpc.RetryInfo") {
            return None;
        }
        let delay = detail.get("retryDelay")?.as_str()?;
        let seconds: f64 = delay.strip_suffix('s')?.parse().ok()?;
        Some(Duration::from_secs_f64(seconds))
    })
}
