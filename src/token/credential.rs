//! Cached credential and lifetime math

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use tokio::time::Instant;

/// A token as handed back by an issuer, before any caching decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Opaque bearer secret
    pub token: String,
    /// Issuer-provided time-to-live, if the response carried one
    pub expires_in: Option<Duration>,
}

impl IssuedToken {
    /// Create an issued token
    pub fn new(token: impl Into<String>, expires_in: Option<Duration>) -> Self {
        Self {
            token: token.into(),
            expires_in,
        }
    }

    /// Advertised lifetime: `expires_in`, else the JWT `exp` claim, else `default_ttl`
    #[must_use]
    pub fn lifetime(&self, default_ttl: Duration) -> Duration {
        self.expires_in
            .or_else(|| jwt_lifetime(&self.token))
            .unwrap_or(default_ttl)
    }
}

/// Timing policy applied to every credential a cache stores
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    /// Subtracted from the advertised lifetime to force early refresh
    pub safety_margin: Duration,
    /// Lifetime assumed when neither the issuer nor the token says
    pub default_ttl: Duration,
    /// Upper bound on a single issuer call
    pub fetch_timeout: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(5),
            default_ttl: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// The single process-wide credential slot value
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    /// Build a credential from an issuer response received at `now`
    #[must_use]
    pub fn from_issued(issued: IssuedToken, policy: &ExpiryPolicy, now: Instant) -> Self {
        let lifetime = issued.lifetime(policy.default_ttl);
        Self {
            token: issued.token,
            expires_at: now + lifetime.saturating_sub(policy.safety_margin),
        }
    }

    /// Bearer secret
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Instant after which the token must not be used
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Usable without re-fetching
    pub fn is_valid_at(&self, now: Instant) -> bool {
        !self.token.is_empty() && now < self.expires_at
    }

    /// Time left before the credential expires, zero when already expired
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

// Tokens are secrets: never let them reach logs through Debug.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<u64>,
}

/// Remaining lifetime of a JWT according to its `exp` claim.
///
/// The signature is not verified: the issuer is trusted, we only want to know
/// when it stops accepting the token. Returns `None` for non-JWT tokens.
pub fn jwt_lifetime(token: &str) -> Option<Duration> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let exp = serde_json::from_slice::<ExpiryClaim>(&bytes).ok()?.exp?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Some(Duration::from_secs(exp.saturating_sub(now)))
}
