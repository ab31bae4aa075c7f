//! Access-token lifecycle
//!
//! A [`TokenCache`] owns the single credential slot for the agent API:
//!
//! - Fast path returns the cached token while `now < expires_at`
//! - Expired or missing tokens are fetched from a [`TokenIssuer`]
//! - Concurrent callers coalesce onto one in-flight fetch
//! - `expires_at = issued_at + ttl - safety_margin`
//!
//! Multi-stage chains (refresh token -> access token) nest caches: the
//! [`RefreshingTokenIssuer`] owns the refresh-token stage.

mod cache;
mod credential;
mod issuer;

use std::sync::Arc;

use reqwest::Client;

pub use cache::{TokenCache, TokenCacheSnapshot, TokenState};
pub use credential::{Credential, ExpiryPolicy, IssuedToken, jwt_lifetime};
pub use issuer::{
    AgentTokenIssuer, AuthEndpoint, FetchError, RefreshTokenIssuer, RefreshingTokenIssuer,
    TokenIssuer,
};

use crate::config::{AgentConfig, TokenFlow};

/// Build the agent token cache for the configured flow
pub fn agent_token_cache(http: Client, config: &AgentConfig) -> TokenCache {
    let endpoint = AuthEndpoint::new(http, &config.api_base, &config.agent_id, config.agent_key.clone());
    let policy = config.expiry_policy();

    let issuer: Arc<dyn TokenIssuer> = match config.token_flow {
        TokenFlow::Direct => Arc::new(AgentTokenIssuer::new(endpoint)),
        TokenFlow::Refresh => Arc::new(RefreshingTokenIssuer::new(endpoint, config.refresh_policy())),
    };

    TokenCache::new("agent", issuer, policy)
}
