//! Error types for the support gateway

use std::io;

use thiserror::Error;

use crate::token::FetchError;

/// Result type alias for the support gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Support gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The auth issuer could not produce a token
    #[error("Auth fetch failed: {0}")]
    AuthFetch(#[from] FetchError),

    /// Agent API rejected a token we considered valid
    #[error("Agent API rejected the access token")]
    UpstreamUnauthorized,

    /// Agent API answered with a non-2xx status other than 401
    #[error("Agent API error: HTTP {status} - {body}")]
    Upstream {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Network-level failure talking to an upstream
    #[error("Transport error: {0}")]
    Transport(String),

    /// Ticket search backend failure
    #[error("Search error: {0}")]
    Search(String),

    /// Inbound request rejected before any upstream call
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Truncate an upstream body so error messages and logs stay bounded
pub(crate) fn truncate_body(mut body: String) -> String {
    const MAX_BODY: usize = 512;
    if body.len() > MAX_BODY {
        let mut cut = MAX_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    body
}
