//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, warn};

use crate::agent::ChatMessage;
use crate::chat::ChatService;
use crate::config::Config;
use crate::tickets::TicketSearch;
use crate::{Error, Result};

const AGENT_FAILURE: &str = "Failed to communicate with GenAI agent.";
const TOKEN_FAILURE: &str = "Failed to obtain agent access token.";
const TICKETS_FAILURE: &str = "Failed to fetch ticket data.";

/// Shared application state
pub struct AppState {
    /// Chat relay with the agent token cache
    pub chat: Arc<ChatService>,
    /// Ticket search client, absent when no search node is configured
    pub tickets: Option<Arc<TicketSearch>>,
    /// Maximum inbound request body size (bytes)
    pub max_body_size: usize,
}

impl AppState {
    /// Build state from validated config
    pub fn from_config(config: &Config) -> Result<Self> {
        let chat = Arc::new(ChatService::from_config(&config.agent)?);
        let tickets = if config.search.is_configured() {
            Some(Arc::new(TicketSearch::from_config(&config.search)?))
        } else {
            warn!("No search node configured, /api/tickets will fail");
            None
        };

        Ok(Self {
            chat,
            tickets,
            max_body_size: config.server.max_body_size,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let max_body_size = state.max_body_size;

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/tickets", get(tickets_handler))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Map a chat failure to the client-facing status and message
fn chat_error_response(err: &Error) -> Response {
    match err {
        Error::InvalidRequest(message) => error_response(StatusCode::BAD_REQUEST, message),
        Error::UpstreamUnauthorized => error_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
        Error::AuthFetch(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, TOKEN_FAILURE),
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, AGENT_FAILURE),
    }
}

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
}

/// GET /health - liveness plus token cache state; never fetches a token
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tokens = state.chat.tokens();
    let stats = tokens.stats();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "token": {
            "state": tokens.state(),
            "hits": stats.hits,
            "fetches": stats.fetches,
            "coalesced": stats.coalesced,
            "failures": stats.failures,
        },
        "tickets_configured": state.tickets.is_some(),
    }))
}

/// POST /api/chat
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            debug!(error = %rejection, "Rejected chat request body");
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };

    match state.chat.complete(&request.messages).await {
        Ok(reply) => {
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
            (status, Json(reply.body)).into_response()
        }
        Err(e) => {
            match &e {
                Error::InvalidRequest(_) | Error::UpstreamUnauthorized => {
                    debug!(error = %e, "Chat request failed");
                }
                _ => error!(error = %e, "Chat request failed"),
            }
            chat_error_response(&e)
        }
    }
}

/// GET /api/tickets
async fn tickets_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(search) = state.tickets.as_ref() else {
        error!("Ticket counts requested but no search node is configured");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, TICKETS_FAILURE);
    };

    match search.counts().await {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => {
            error!(error = %e, "Ticket count query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, TICKETS_FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::FetchError;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn body_of(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unauthorized_maps_to_401() {
        let (status, body) = body_of(chat_error_response(&Error::UpstreamUnauthorized)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"error": "Unauthorized"}));
    }

    #[tokio::test]
    async fn auth_fetch_maps_to_token_failure() {
        let err = Error::AuthFetch(FetchError::Transport("refused".to_string()));
        let (status, body) = body_of(chat_error_response(&err)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], TOKEN_FAILURE);
    }

    #[tokio::test]
    async fn upstream_details_are_not_leaked() {
        let err = Error::Upstream {
            status: 502,
            body: "internal stack trace".to_string(),
        };
        let (status, body) = body_of(chat_error_response(&err)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": AGENT_FAILURE}));
    }

    #[tokio::test]
    async fn invalid_request_maps_to_400() {
        let err = Error::InvalidRequest("messages must not be empty".to_string());
        let (status, body) = body_of(chat_error_response(&err)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "messages must not be empty");
    }
}
