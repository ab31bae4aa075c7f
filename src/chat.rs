//! Chat request handling: token acquisition, agent call, 401 self-healing

use tracing::{info, warn};

use crate::agent::{AgentClient, AgentReply, ChatMessage, build_http_client};
use crate::config::AgentConfig;
use crate::token::{TokenCache, agent_token_cache};
use crate::{Error, Result};

/// Relays chat completions to the agent API using the shared token cache
pub struct ChatService {
    tokens: TokenCache,
    agent: AgentClient,
    invalidate_on_unauthorized: bool,
}

impl ChatService {
    /// Assemble a service from its parts
    pub fn new(tokens: TokenCache, agent: AgentClient, invalidate_on_unauthorized: bool) -> Self {
        Self {
            tokens,
            agent,
            invalidate_on_unauthorized,
        }
    }

    /// Build the service, its HTTP clients and its token cache from config
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        config.validate()?;

        let auth_http = build_http_client(config.auth_timeout)?;
        let agent_http = build_http_client(config.request_timeout)?;

        info!(
            flow = ?config.token_flow,
            safety_margin = ?config.safety_margin,
            "Agent token cache ready"
        );

        Ok(Self::new(
            agent_token_cache(auth_http, config),
            AgentClient::new(agent_http, &config.endpoint, config.model.clone()),
            config.invalidate_on_unauthorized,
        ))
    }

    /// The agent token cache
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Acquire a token and forward `messages` to the agent
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<AgentReply> {
        if messages.is_empty() {
            return Err(Error::InvalidRequest("messages must not be empty".to_string()));
        }

        let token = self.tokens.acquire_token().await?;

        match self.agent.chat_completion(&token, messages).await {
            Err(Error::UpstreamUnauthorized) => {
                let invalidated = self.invalidate_on_unauthorized && self.tokens.invalidate(&token);
                warn!(invalidated, "Agent API rejected a locally valid token");
                Err(Error::UpstreamUnauthorized)
            }
            outcome => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Client;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::token::{ExpiryPolicy, FetchError, IssuedToken, TokenIssuer, TokenState};

    /// Issuer that hands out `token-1`, `token-2`, ...
    #[derive(Default)]
    struct CountingIssuer {
        calls: AtomicU64,
    }

    #[async_trait]
    impl TokenIssuer for CountingIssuer {
        async fn issue(&self) -> std::result::Result<IssuedToken, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(IssuedToken::new(format!("token-{n}"), Some(Duration::from_secs(60))))
        }
    }

    struct FailingIssuer;

    #[async_trait]
    impl TokenIssuer for FailingIssuer {
        async fn issue(&self) -> std::result::Result<IssuedToken, FetchError> {
            Err(FetchError::Transport("connection refused".to_string()))
        }
    }

    fn service(server: &MockServer, issuer: Arc<dyn TokenIssuer>, invalidate: bool) -> ChatService {
        ChatService::new(
            TokenCache::new("agent", issuer, ExpiryPolicy::default()),
            AgentClient::new(Client::new(), &server.uri(), "gpt-3.5-turbo"),
            invalidate,
        )
    }

    fn hello() -> Vec<ChatMessage> {
        vec![ChatMessage::text("user", "hello")]
    }

    #[tokio::test]
    async fn empty_messages_rejected_without_fetching() {
        let server = MockServer::start().await;
        let issuer = Arc::new(CountingIssuer::default());
        let chat = service(&server, issuer.clone(), true);

        let err = chat.complete(&[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unauthorized_invalidates_token_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let issuer = Arc::new(CountingIssuer::default());
        let chat = service(&server, issuer.clone(), true);

        assert!(matches!(chat.complete(&hello()).await, Err(Error::UpstreamUnauthorized)));
        assert_eq!(chat.tokens().state(), TokenState::Empty);

        // Next request fetches a fresh token
        assert!(matches!(chat.complete(&hello()).await, Err(Error::UpstreamUnauthorized)));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_keeps_token_when_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let issuer = Arc::new(CountingIssuer::default());
        let chat = service(&server, issuer.clone(), false);

        assert!(chat.complete(&hello()).await.is_err());
        assert!(chat.complete(&hello()).await.is_err());
        assert_eq!(chat.tokens().state(), TokenState::Valid);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_skips_agent_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;
        let chat = service(&server, Arc::new(FailingIssuer), true);

        let err = chat.complete(&hello()).await.unwrap_err();
        assert!(matches!(err, Error::AuthFetch(FetchError::Transport(_))));
    }

    #[tokio::test]
    async fn success_reuses_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cmpl-1"})))
            .expect(3)
            .mount(&server)
            .await;
        let issuer = Arc::new(CountingIssuer::default());
        let chat = service(&server, issuer.clone(), true);

        for _ in 0..3 {
            let reply = chat.complete(&hello()).await.unwrap();
            assert_eq!(reply.body["id"], "cmpl-1");
        }
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_config_rejects_incomplete_agent_config() {
        let err = ChatService::from_config(&AgentConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
