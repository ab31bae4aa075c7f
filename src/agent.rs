//! Agent API client
//!
//! Thin wrapper around `POST {endpoint}/chat/completions`. Status mapping:
//!
//! - 2xx: status and JSON body relayed verbatim
//! - 401: [`Error::UpstreamUnauthorized`]
//! - other non-2xx: [`Error::Upstream`]
//! - network failure or unreadable body: [`Error::Transport`]

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::truncate_body;
use crate::{Error, Result};

/// One chat turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role (`user`, `assistant`, `system`, ...)
    pub role: String,
    /// Message content, relayed unchanged
    pub content: Value,
}

impl ChatMessage {
    /// Plain-text message
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

/// Successful agent response
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    /// Upstream 2xx status
    pub status: u16,
    /// Upstream JSON body
    pub body: Value,
}

/// Build a pooled HTTP client with an explicit overall timeout
pub(crate) fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| Error::Transport(e.to_string()))
}

/// Agent chat-completions client
#[derive(Clone)]
pub struct AgentClient {
    http: Client,
    completions_url: String,
    model: String,
}

impl AgentClient {
    /// Create a client for `endpoint` (with or without trailing slash)
    pub fn new(http: Client, endpoint: &str, model: impl Into<String>) -> Self {
        Self {
            http,
            completions_url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            model: model.into(),
        }
    }

    /// Completions URL
    pub fn completions_url(&self) -> &str {
        &self.completions_url
    }

    /// Send `messages` with `token` as bearer credential
    pub async fn chat_completion(&self, token: &str, messages: &[ChatMessage]) -> Result<AgentReply> {
        debug!(url = %self.completions_url, messages = messages.len(), "Calling agent API");

        let response = self
            .http
            .post(&self.completions_url)
            .bearer_auth(token)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    warn!(url = %self.completions_url, "Agent API timed out");
                }
                Error::Transport(format!("Agent request failed: {e}"))
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::UpstreamUnauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse agent response: {e}")))?;

        Ok(AgentReply {
            status: status.as_u16(),
            body,
        })
    }
}
