//! Token Cache Manager
//!
//! Holds one credential slot and hands out a currently-valid bearer token.
//!
//! Slot lifecycle:
//!
//! ```text
//! EMPTY -> FETCHING -> VALID -> EXPIRED -> FETCHING ...
//!             |
//!             +-> (failure) -> EMPTY
//! ```
//!
//! The validity check and the decision to start a fetch happen under one
//! synchronous lock that is never held across an `.await`. While a fetch is
//! outstanding every caller awaits the same [`Shared`] future, so concurrent
//! callers observe exactly one issuer call and one outcome. The fetch itself
//! runs on a spawned task and settles whether or not anyone is still waiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::credential::{Credential, ExpiryPolicy, IssuedToken};
use super::issuer::{FetchError, TokenIssuer};

type PendingFetch = Shared<BoxFuture<'static, Result<String, FetchError>>>;

/// Observable state of the credential slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// No credential has been stored (or the last fetch failed)
    Empty,
    /// A fetch is in flight
    Fetching,
    /// A credential is usable
    Valid,
    /// The stored credential is past its expiry
    Expired,
}

#[derive(Default)]
struct Slot {
    credential: Option<Credential>,
    pending: Option<PendingFetch>,
}

/// Counters kept by a [`TokenCache`]
#[derive(Debug, Default)]
struct TokenCacheStats {
    hits: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenCacheSnapshot {
    /// Calls answered from the cached credential
    pub hits: u64,
    /// Issuer calls started
    pub fetches: u64,
    /// Calls that joined an in-flight fetch
    pub coalesced: u64,
    /// Issuer calls that failed
    pub failures: u64,
}

/// Process-wide bearer token cache with single-flight refresh.
///
/// Cloning is cheap and clones share the same slot.
#[derive(Clone)]
pub struct TokenCache {
    name: Arc<str>,
    issuer: Arc<dyn TokenIssuer>,
    policy: ExpiryPolicy,
    slot: Arc<Mutex<Slot>>,
    stats: Arc<TokenCacheStats>,
}

impl TokenCache {
    /// Create an empty cache backed by `issuer`
    pub fn new(name: impl Into<Arc<str>>, issuer: Arc<dyn TokenIssuer>, policy: ExpiryPolicy) -> Self {
        Self {
            name: name.into(),
            issuer,
            policy,
            slot: Arc::new(Mutex::new(Slot::default())),
            stats: Arc::new(TokenCacheStats::default()),
        }
    }

    /// Return a currently-valid token, fetching one if needed.
    ///
    /// Concurrent callers during a fetch share its outcome. A failed fetch is
    /// not cached: the next call starts a new one.
    pub async fn acquire_token(&self) -> Result<String, FetchError> {
        let pending = {
            let mut slot = self.slot.lock();

            if let Some(credential) = slot.credential.as_ref() {
                if credential.is_valid_at(Instant::now()) {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(credential.token().to_string());
                }
            }

            if let Some(pending) = slot.pending.as_ref() {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                pending.clone()
            } else {
                let pending = self.start_fetch();
                slot.pending = Some(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Drop the cached credential if it still holds `rejected`.
    ///
    /// Returns whether anything was invalidated. A newer token stored since
    /// `rejected` was handed out is left alone.
    pub fn invalidate(&self, rejected: &str) -> bool {
        let mut slot = self.slot.lock();
        let matches = slot
            .credential
            .as_ref()
            .is_some_and(|credential| credential.token() == rejected);
        if matches {
            slot.credential = None;
            info!(cache = %self.name, "Invalidated cached token");
        }
        matches
    }

    /// Current slot state
    pub fn state(&self) -> TokenState {
        let slot = self.slot.lock();
        if slot.pending.is_some() {
            return TokenState::Fetching;
        }
        match slot.credential.as_ref() {
            None => TokenState::Empty,
            Some(credential) if credential.is_valid_at(Instant::now()) => TokenState::Valid,
            Some(_) => TokenState::Expired,
        }
    }

    /// Time left before the stored credential must be refreshed
    pub fn remaining(&self) -> Option<Duration> {
        self.slot
            .lock()
            .credential
            .as_ref()
            .map(|credential| credential.remaining(Instant::now()))
    }

    /// Counter snapshot
    pub fn stats(&self) -> TokenCacheSnapshot {
        TokenCacheSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn the fetch and return a shared handle to its outcome. Must be
    /// called with the slot locked.
    ///
    /// The fetch runs on its own task, so it settles at issue time even when
    /// every waiter has been dropped.
    fn start_fetch(&self) -> PendingFetch {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);

        let name = Arc::clone(&self.name);
        let issuer = Arc::clone(&self.issuer);
        let slot = Arc::clone(&self.slot);
        let stats = Arc::clone(&self.stats);
        let policy = self.policy;

        let task = tokio::spawn(async move {
            debug!(cache = %name, "Fetching token");
            let outcome = match tokio::time::timeout(policy.fetch_timeout, issuer.issue()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Timeout(policy.fetch_timeout)),
            };
            settle(&name, &slot, &stats, &policy, outcome)
        });

        let name = Arc::clone(&self.name);
        let slot = Arc::clone(&self.slot);
        let stats = Arc::clone(&self.stats);

        async move {
            match task.await {
                Ok(outcome) => outcome,
                // The task died before settling: release the slot ourselves
                Err(e) => settle(
                    &name,
                    &slot,
                    &stats,
                    &policy,
                    Err(FetchError::Transport(format!("token fetch task failed: {e}"))),
                ),
            }
        }
        .boxed()
        .shared()
    }
}

/// Store the outcome of a fetch and clear the in-flight marker
fn settle(
    name: &str,
    slot: &Mutex<Slot>,
    stats: &TokenCacheStats,
    policy: &ExpiryPolicy,
    outcome: Result<IssuedToken, FetchError>,
) -> Result<String, FetchError> {
    let mut slot = slot.lock();
    slot.pending = None;

    match outcome {
        Ok(issued) => {
            let now = Instant::now();
            let credential = Credential::from_issued(issued, policy, now);
            let valid_for = credential.remaining(now);
            if valid_for.is_zero() {
                warn!(cache = %name, "Issued token lifetime is within the safety margin");
            } else {
                debug!(cache = %name, valid_for = ?valid_for, "Cached token");
            }
            let token = credential.token().to_string();
            slot.credential = Some(credential);
            Ok(token)
        }
        Err(e) => {
            slot.credential = None;
            stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!(cache = %name, error = %e, "Token fetch failed");
            Err(e)
        }
    }
}
