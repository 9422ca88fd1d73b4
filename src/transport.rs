//! Remote call boundary and outcome classification
//!
//! A [`Dispatcher`] sends one payload and reports either a raw [`Response`] or
//! a [`TransportError`]. Turning that into an [`Outcome`] is the job of a
//! [`Classifier`], so services with their own status conventions can plug in
//! without touching the retry logic.

use crate::config::EndpointConfig;
use crate::error::TransportError;
use crate::types::Outcome;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Content type of every dispatched body
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Longest response body kept in an outcome detail
const MAX_DETAIL_LEN: usize = 200;

/// Raw response of one remote call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response body, as text
    pub body: String,
}

impl Response {
    /// Create a response
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// `"<status> <body>"`, with the body cut to a readable length
    pub fn detail(&self) -> String {
        let body = self.body.trim();
        if body.is_empty() {
            return self.status.to_string();
        }
        let mut cut: String = body.chars().take(MAX_DETAIL_LEN).collect();
        if cut.len() < body.len() {
            cut.push_str("...");
        }
        format!("{} {}", self.status, cut)
    }
}

/// Sends one request payload to the remote service
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send `payload` with the given `Authorization` header value
    ///
    /// Any status code is a successful call here; only failures to complete
    /// the exchange are errors.
    async fn send(
        &self,
        payload: &serde_json::Value,
        authorization: &str,
    ) -> std::result::Result<Response, TransportError>;
}

/// POSTs JSON bodies to a fixed endpoint
pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpDispatcher {
    /// Create a dispatcher for the configured endpoint
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn send(
        &self,
        payload: &serde_json::Value,
        authorization: &str,
    ) -> std::result::Result<Response, TransportError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| TransportError::Protocol(format!("unserializable payload: {}", e)))?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(Response { status, body })
    }
}

/// Maps a response to an [`Outcome`]
pub type Classifier = Arc<dyn Fn(&Response) -> Outcome + Send + Sync>;

/// Default classifier for HTTP services
///
/// | Status              | Outcome               |
/// |---------------------|-----------------------|
/// | 2xx                 | `Succeeded`           |
/// | 401                 | `AuthExpired`         |
/// | 403                 | `AuthorizationDenied` |
/// | 408, 502, 503, 504  | `RetryableFailure`    |
/// | anything else       | `PermanentFailure`    |
pub fn http_status_classifier() -> Classifier {
    Arc::new(classify_http_status)
}

fn classify_http_status(response: &Response) -> Outcome {
    match response.status {
        200..=299 => Outcome::Succeeded,
        401 => Outcome::AuthExpired,
        403 => Outcome::AuthorizationDenied(response.detail()),
        408 | 502 | 503 | 504 => Outcome::RetryableFailure(response.detail()),
        _ => Outcome::PermanentFailure(response.detail()),
    }
}

/// Outcome of a call that never produced a response
pub fn classify_transport_error(error: &TransportError) -> Outcome {
    if error.is_retryable() {
        Outcome::RetryableFailure(error.to_string())
    } else {
        Outcome::Fatal(error.to_string())
    }
}
