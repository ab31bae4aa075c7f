//! Auth issuer clients
//!
//! Two flows are supported against `{api_base}/auth/agents/{agent_id}/token`:
//!
//! - **Direct**: `POST` with the agent key returns an access token.
//! - **Refresh**: `POST` returns a refresh token, then
//!   `PUT ?refresh_token=...` exchanges it for an access token. The refresh
//!   token lives in its own [`TokenCache`] stage with its own expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cache::TokenCache;
use super::credential::{ExpiryPolicy, IssuedToken};
use crate::error::truncate_body;

/// Failure to obtain a token from the auth issuer.
///
/// `Clone` so a single outcome can be handed to every coalesced waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Issuer answered with a non-2xx status
    #[error("Auth issuer returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Issuer unreachable
    #[error("Auth issuer unreachable: {0}")]
    Transport(String),

    /// Issuer answered 2xx without a usable token
    #[error("Invalid auth issuer response: {0}")]
    InvalidResponse(String),

    /// Issuer did not answer within the fetch timeout
    #[error("Auth issuer timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Issuer rejected the presented credential
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }
}

/// Source of fresh tokens for a [`TokenCache`]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Obtain a new token. Called at most once per coalescing window.
    async fn issue(&self) -> Result<IssuedToken, FetchError>;
}

/// Wire shape shared by every issuer response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Token endpoint of one agent
#[derive(Clone)]
pub struct AuthEndpoint {
    http: Client,
    token_url: String,
    api_key: String,
}

impl AuthEndpoint {
    /// Create the endpoint for `agent_id` under `api_base`
    pub fn new(http: Client, api_base: &str, agent_id: &str, api_key: impl Into<String>) -> Self {
        Self {
            http,
            token_url: format!("{}/auth/agents/{agent_id}/token", api_base.trim_end_matches('/')),
            api_key: api_key.into(),
        }
    }

    /// Token URL (no secrets in it)
    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// `POST` the agent key, returning either an access or a refresh token
    async fn post(&self) -> Result<TokenResponse, FetchError> {
        let response = self
            .http
            .post(&self.token_url)
            .header("X-Api-Key", &self.api_key)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        read_token_response(response).await
    }

    /// `PUT` a refresh token, returning an access token
    async fn put(&self, refresh_token: &str) -> Result<TokenResponse, FetchError> {
        let response = self
            .http
            .put(&self.token_url)
            .query(&[("refresh_token", refresh_token)])
            .header("X-Api-Key", &self.api_key)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        read_token_response(response).await
    }
}

async fn read_token_response(response: Response) -> Result<TokenResponse, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            status: status.as_u16(),
            body: truncate_body(body),
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| FetchError::InvalidResponse(e.to_string()))
}

fn require(field: Option<String>, name: &str) -> Result<String, FetchError> {
    field
        .filter(|value| !value.is_empty())
        .ok_or_else(|| FetchError::InvalidResponse(format!("missing {name}")))
}

/// Single-step flow: the agent key is exchanged directly for an access token
pub struct AgentTokenIssuer {
    endpoint: AuthEndpoint,
}

impl AgentTokenIssuer {
    /// Create a direct issuer
    pub fn new(endpoint: AuthEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl TokenIssuer for AgentTokenIssuer {
    async fn issue(&self) -> Result<IssuedToken, FetchError> {
        debug!(url = %self.endpoint.token_url(), "Requesting access token");
        let response = self.endpoint.post().await?;
        let token = require(response.access_token, "access_token")?;
        info!(expires_in = ?response.expires_in, "Issued access token");
        Ok(IssuedToken::new(token, response.expires_in.map(Duration::from_secs)))
    }
}

/// First stage of the refresh flow: obtains refresh tokens
pub struct RefreshTokenIssuer {
    endpoint: AuthEndpoint,
}

impl RefreshTokenIssuer {
    /// Create a refresh-token issuer
    pub fn new(endpoint: AuthEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl TokenIssuer for RefreshTokenIssuer {
    async fn issue(&self) -> Result<IssuedToken, FetchError> {
        debug!(url = %self.endpoint.token_url(), "Requesting refresh token");
        let response = self.endpoint.post().await?;
        let token = require(response.refresh_token, "refresh_token")?;
        info!(expires_in = ?response.expires_in, "Issued refresh token");
        Ok(IssuedToken::new(token, response.expires_in.map(Duration::from_secs)))
    }
}

/// Second stage of the refresh flow: derives access tokens from the cached
/// refresh token
pub struct RefreshingTokenIssuer {
    endpoint: AuthEndpoint,
    refresh: TokenCache,
}

impl RefreshingTokenIssuer {
    /// Create the two-stage issuer; the refresh stage caches with
    /// `refresh_policy`, independent of the access-token policy
    pub fn new(endpoint: AuthEndpoint, refresh_policy: ExpiryPolicy) -> Self {
        let refresh = TokenCache::new(
            "refresh",
            Arc::new(RefreshTokenIssuer::new(endpoint.clone())),
            refresh_policy,
        );
        Self { endpoint, refresh }
    }

    /// The refresh-token stage
    pub fn refresh_stage(&self) -> &TokenCache {
        &self.refresh
    }

    async fn exchange(&self, refresh_token: &str) -> Result<IssuedToken, FetchError> {
        let response = self.endpoint.put(refresh_token).await?;
        let token = require(response.access_token, "access_token")?;
        Ok(IssuedToken::new(token, response.expires_in.map(Duration::from_secs)))
    }
}

#[async_trait]
impl TokenIssuer for RefreshingTokenIssuer {
    async fn issue(&self) -> Result<IssuedToken, FetchError> {
        let refresh_token = self.refresh.acquire_token().await?;

        match self.exchange(&refresh_token).await {
            Err(e) if e.is_unauthorized() => {
                // The refresh token was revoked early: re-derive from a new one
                warn!("Refresh token rejected, re-issuing");
                self.refresh.invalidate(&refresh_token);
                let refresh_token = self.refresh.acquire_token().await?;
                self.exchange(&refresh_token).await
            }
            outcome => {
                if outcome.is_ok() {
                    info!("Refreshed access token");
                }
                outcome
            }
        }
    }
}
