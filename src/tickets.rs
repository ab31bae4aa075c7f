//! Ticket counts from the search index
//!
//! Three independent `_search` queries (open/in-progress, resolved, all)
//! run concurrently and their totals are returned together.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::SearchConfig;
use crate::error::truncate_body;
use crate::{Error, Result};

/// Ticket totals as served by `GET /api/tickets`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCounts {
    /// Tickets in `Open` or `In Progress`
    pub open_tickets: u64,
    /// Tickets in `Resolved`
    pub resolved_tickets: u64,
    /// All tickets
    pub total_tickets: u64,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    total: Total,
}

/// `hits.total` is an object on current backends and a bare number on old ones
#[derive(Deserialize)]
#[serde(untagged)]
enum Total {
    Object { value: u64 },
    Count(u64),
}

impl Total {
    fn value(&self) -> u64 {
        match self {
            Self::Object { value } | Self::Count(value) => *value,
        }
    }
}

fn status_match(status: &str) -> Value {
    json!({
        "match": {
            "status": { "query": status, "operator": "AND", "fuzziness": "AUTO" }
        }
    })
}

/// Search-index client for ticket statistics
pub struct TicketSearch {
    http: Client,
    search_url: String,
    username: String,
    password: String,
    result_window: u32,
}

impl TicketSearch {
    /// Build a client from config
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        config.validate()?;

        let http = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Search(e.to_string()))?;

        if config.accept_invalid_certs {
            info!(node = %config.node, "TLS certificate verification disabled for search node");
        }

        Ok(Self {
            http,
            search_url: format!("{}/{}/_search", config.node.trim_end_matches('/'), config.index),
            username: config.username.clone(),
            password: config.password.clone(),
            result_window: config.result_window,
        })
    }

    /// Open, resolved and total ticket counts
    pub async fn counts(&self) -> Result<TicketCounts> {
        debug!(url = %self.search_url, "Querying ticket counts");

        let open = json!({
            "bool": {
                "should": [status_match("Open"), status_match("In Progress")],
                "minimum_should_match": 1
            }
        });
        let resolved = status_match("Resolved");
        let all = json!({ "match_all": {} });

        let (open_tickets, resolved_tickets, total_tickets) =
            tokio::try_join!(self.total(open), self.total(resolved), self.total(all))?;

        info!(
            open = open_tickets,
            resolved = resolved_tickets,
            total = total_tickets,
            "Ticket counts"
        );

        Ok(TicketCounts {
            open_tickets,
            resolved_tickets,
            total_tickets,
        })
    }

    /// Run one query and return its hit total
    async fn total(&self, query: Value) -> Result<u64> {
        let mut request = self.http.post(&self.search_url).json(&json!({
            "query": query,
            "size": self.result_window,
            "track_total_hits": true
        }));
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Search(format!("Search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Search(format!("HTTP {status}: {}", truncate_body(body))));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::Search(format!("Failed to parse search response: {e}")))?;

        Ok(parsed.hits.total.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> SearchConfig {
        SearchConfig {
            node: server.uri(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            ..SearchConfig::default()
        }
    }

    fn total(value: u64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "hits": { "total": { "value": value, "relation": "eq" }, "hits": [] }
        }))
    }

    async fn mount_counts(server: &MockServer, open: u64, resolved: u64, all: u64) {
        Mock::given(method("POST"))
            .and(path("/tickets/_search"))
            .and(body_partial_json(json!({"query": {"bool": {"minimum_should_match": 1}}})))
            .respond_with(total(open))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tickets/_search"))
            .and(body_partial_json(json!({"query": {"match": {"status": {"query": "Resolved"}}}})))
            .respond_with(total(resolved))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tickets/_search"))
            .and(body_partial_json(json!({"query": {"match_all": {}}, "size": 100})))
            .respond_with(total(all))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn counts_runs_three_queries() {
        let server = MockServer::start().await;
        mount_counts(&server, 7, 12, 25).await;

        let search = TicketSearch::from_config(&config(&server)).unwrap();
        let counts = search.counts().await.unwrap();
        assert_eq!(
            counts,
            TicketCounts {
                open_tickets: 7,
                resolved_tickets: 12,
                total_tickets: 25
            }
        );
    }

    #[tokio::test]
    async fn sends_basic_auth() {
        let server = MockServer::start().await;
        // base64("admin:admin")
        Mock::given(header("Authorization", "Basic YWRtaW46YWRtaW4="))
            .respond_with(total(1))
            .expect(3)
            .mount(&server)
            .await;

        let search = TicketSearch::from_config(&config(&server)).unwrap();
        assert!(search.counts().await.is_ok());
    }

    #[tokio::test]
    async fn legacy_numeric_total_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": {"total": 4}})))
            .mount(&server)
            .await;

        let search = TicketSearch::from_config(&config(&server)).unwrap();
        assert_eq!(search.counts().await.unwrap().total_tickets, 4);
    }

    #[tokio::test]
    async fn backend_failure_is_search_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("red cluster"))
            .mount(&server)
            .await;

        let search = TicketSearch::from_config(&config(&server)).unwrap();
        let err = search.counts().await.unwrap_err();
        assert!(matches!(err, Error::Search(ref msg) if msg.contains("503")));
    }

    #[test]
    fn counts_serialize_camel_case() {
        let counts = TicketCounts {
            open_tickets: 1,
            resolved_tickets: 2,
            total_tickets: 3,
        };
        assert_eq!(
            serde_json::to_value(counts).unwrap(),
            json!({"openTickets": 1, "resolvedTickets": 2, "totalTickets": 3})
        );
    }

    #[test]
    fn from_config_requires_node() {
        let config = SearchConfig {
            timeout: Duration::from_secs(1),
            ..SearchConfig::default()
        };
        assert!(matches!(TicketSearch::from_config(&config), Err(Error::Config(_))));
    }
}
