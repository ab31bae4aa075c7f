//! Support Gateway Library
//!
//! HTTP proxy between a support chat front end and a GenAI agent API.
//!
//! # Features
//!
//! - **Token cache**: one shared agent access token, refreshed before expiry
//! - **Coalescing**: concurrent requests share a single in-flight token fetch
//! - **Self-healing**: a 401 from the agent drops the rejected token
//! - **Ticket counts**: open, resolved and total tickets from a search index

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod chat;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod tickets;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
