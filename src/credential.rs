//! Bearer token management with single-flight refresh
//!
//! All workers read the token through [`CredentialManager::current_token`].
//! When a response says the token expired, the worker calls
//! [`CredentialManager::refresh`] with the generation it used. Only the first
//! caller for a given generation performs the remote exchange; everyone else
//! queued behind the refresh lock sees the advanced generation and reuses the
//! fresh token.

use crate::config::CredentialConfig;
use crate::error::{Error, Result};
use crate::types::Event;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};

/// Remote client-id/secret exchange that yields an `Authorization` header value
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a new header value (e.g. `"Bearer abc"`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialExchange`] if no token could be obtained.
    async fn exchange(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth2 client-credentials grant against a token endpoint
pub struct OAuthTokenSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
}

impl OAuthTokenSource {
    /// Create a token source from credential settings
    pub fn new(config: &CredentialConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn exchange(&self) -> Result<String> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::CredentialExchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::CredentialExchange(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::CredentialExchange(format!("unreadable token response: {}", e)))?;
        if token.access_token.is_empty() {
            return Err(Error::CredentialExchange(
                "token endpoint returned an empty access_token".to_string(),
            ));
        }

        Ok(format!("Bearer {}", token.access_token))
    }
}

/// A header value together with the generation that produced it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    /// `Authorization` header value
    pub value: String,
    /// Incremented on every successful exchange; 0 means no token yet
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Credential {
    value: String,
    generation: u64,
    valid: bool,
}

/// Holds the current bearer token and coordinates refreshes
pub struct CredentialManager {
    source: Arc<dyn TokenSource>,
    credential: RwLock<Credential>,
    refresh_lock: Mutex<()>,
    exchanges: AtomicU64,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl CredentialManager {
    /// Create a manager without a token; call [`initialize`](Self::initialize) first
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            credential: RwLock::new(Credential::default()),
            refresh_lock: Mutex::new(()),
            exchanges: AtomicU64::new(0),
            event_tx: None,
        }
    }

    /// Emit [`Event::TokenRefreshed`] on `event_tx` after every exchange
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Obtain the first token before any work starts
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialExchange`] if the exchange fails.
    pub async fn initialize(&self) -> Result<Token> {
        let current = self.credential.read().await.generation;
        self.refresh(current).await
    }

    /// The presently valid token, or `None` before initialization or while invalidated
    pub async fn current_token(&self) -> Option<Token> {
        let credential = self.credential.read().await;
        if credential.valid {
            Some(Token {
                value: credential.value.clone(),
                generation: credential.generation,
            })
        } else {
            None
        }
    }

    /// The valid token, waiting for an in-flight refresh to finish if needed
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialExchange`] if the last refresh failed and no
    /// valid token exists.
    pub async fn token(&self) -> Result<Token> {
        if let Some(token) = self.current_token().await {
            return Ok(token);
        }
        let _guard = self.refresh_lock.lock().await;
        self.current_token().await.ok_or_else(|| {
            Error::CredentialExchange("no valid access token available".to_string())
        })
    }

    /// Replace the token that `seen_generation` refers to
    ///
    /// If another caller already replaced it, the newer token is returned
    /// without a second exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialExchange`] if the exchange fails. The
    /// credential stays invalid in that case.
    pub async fn refresh(&self, seen_generation: u64) -> Result<Token> {
        let _guard = self.refresh_lock.lock().await;

        {
            let mut credential = self.credential.write().await;
            if credential.valid && credential.generation != seen_generation {
                tracing::debug!(
                    seen_generation,
                    current_generation = credential.generation,
                    "Token already refreshed by another worker"
                );
                return Ok(Token {
                    value: credential.value.clone(),
                    generation: credential.generation,
                });
            }
            credential.valid = false;
        }

        tracing::info!(seen_generation, "Requesting new access token");
        let value = self.source.exchange().await.inspect_err(|e| {
            tracing::error!(error = %e, "Can not obtain access token");
        })?;
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        let token = {
            let mut credential = self.credential.write().await;
            credential.value = value;
            credential.generation += 1;
            credential.valid = true;
            Token {
                value: credential.value.clone(),
                generation: credential.generation,
            }
        };

        if let Some(tx) = &self.event_tx {
            tx.send(Event::TokenRefreshed {
                generation: token.generation,
            })
            .ok();
        }
        Ok(token)
    }

    /// Number of successful exchanges (including the initial one)
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }
}
