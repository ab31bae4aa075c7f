//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::token::ExpiryPolicy;
use crate::{Error, Result};

/// Bare environment names understood for compatibility with `.env.local` files
const ENV_ALIASES: &[(&str, &str)] = &[
    ("API_BASE", "agent.api_base"),
    ("AGENT_ID", "agent.agent_id"),
    ("AGENT_KEY", "agent.agent_key"),
    ("AGENT_ENDPOINT", "agent.endpoint"),
    ("OPENSEARCH_NODE", "search.node"),
    ("OPENSEARCH_USERNAME", "search.username"),
    ("OPENSEARCH_PASSWORD", "search.password"),
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order; variables already set win.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Agent API and auth issuer configuration
    pub agent: AgentConfig,
    /// Ticket search backend configuration
    pub search: SearchConfig,
}

fn default_env_files() -> Vec<String> {
    vec![".env.local".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: default_env_files(),
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Precedence (lowest first): defaults, YAML file, `SUPPORT_GATEWAY_*`
    /// variables, bare aliases (`API_BASE`, `AGENT_ID`, ...).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
        }

        // Env files must land in the process environment before extraction
        let env_files: Vec<String> = Self::figment(path)
            .extract_inner("env_files")
            .unwrap_or_else(|_| default_env_files());
        load_env_files(&env_files);

        let mut config: Self = Self::figment(path)
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();

        Ok(config)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();

        if let Some(p) = path {
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("SUPPORT_GATEWAY_").split("__"));

        // Serialized keeps values as strings: agent ids and keys can look numeric
        for (name, key) in ENV_ALIASES {
            if let Ok(value) = env::var(name) {
                if !value.is_empty() {
                    figment = figment.merge(Serialized::default(key, value));
                }
            }
        }

        figment
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in credential and URL fields
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            &mut self.agent.api_base,
            &mut self.agent.agent_id,
            &mut self.agent.agent_key,
            &mut self.agent.endpoint,
            &mut self.search.node,
            &mut self.search.username,
            &mut self.search.password,
        ] {
            *value = expand_string(&re, value);
        }
    }

    /// Validate everything the server needs
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first missing or malformed setting.
    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        if self.search.is_configured() {
            self.search.validate()?;
        }
        Ok(())
    }
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let expanded = if path_str.starts_with('~') {
            if let Some(home) = dirs::home_dir() {
                path_str.replacen('~', &home.display().to_string(), 1)
            } else {
                path_str.clone()
            }
        } else {
            path_str.clone()
        };

        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => {
                    tracing::info!("Loaded env file: {expanded}");
                }
                Err(e) => {
                    tracing::warn!("Failed to load env file {expanded}: {e}");
                }
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

fn require_url(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("{name} is not set")));
    }
    Url::parse(value).map_err(|e| Error::Config(format!("{name} is not a valid URL: {e}")))?;
    Ok(())
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} is not set")));
    }
    Ok(())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// How access tokens are obtained from the auth issuer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenFlow {
    /// `POST` the agent key, receive an access token
    #[default]
    Direct,
    /// `POST` for a refresh token, then `PUT` it for an access token
    Refresh,
}

/// Agent API and auth issuer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Auth issuer base URL (`API_BASE`)
    pub api_base: String,
    /// Agent identifier (`AGENT_ID`)
    #[serde(deserialize_with = "stringish::deserialize")]
    pub agent_id: String,
    /// Agent API key sent as `X-Api-Key` (`AGENT_KEY`)
    #[serde(deserialize_with = "stringish::deserialize")]
    pub agent_key: String,
    /// Agent API base URL; `chat/completions` is appended (`AGENT_ENDPOINT`)
    pub endpoint: String,
    /// Model name sent with every completion
    pub model: String,
    /// Token acquisition flow
    pub token_flow: TokenFlow,
    /// Subtracted from the issuer TTL to refresh early
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
    /// Assumed TTL when the issuer gives none and the token is not a JWT
    #[serde(with = "humantime_serde")]
    pub default_token_ttl: Duration,
    /// Safety margin for the refresh token in the `refresh` flow
    #[serde(with = "humantime_serde")]
    pub refresh_safety_margin: Duration,
    /// Assumed refresh-token TTL when the issuer gives none and it is not a JWT
    #[serde(with = "humantime_serde")]
    pub default_refresh_ttl: Duration,
    /// Timeout for auth issuer calls
    #[serde(with = "humantime_serde")]
    pub auth_timeout: Duration,
    /// Timeout for agent completion calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Drop the cached token when the agent API answers 401
    pub invalidate_on_unauthorized: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            agent_id: String::new(),
            agent_key: String::new(),
            endpoint: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            token_flow: TokenFlow::Direct,
            safety_margin: Duration::from_secs(5),
            default_token_ttl: Duration::from_secs(300),
            refresh_safety_margin: Duration::ZERO,
            default_refresh_ttl: Duration::from_secs(3600),
            auth_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            invalidate_on_unauthorized: true,
        }
    }
}

impl AgentConfig {
    /// Token timing policy derived from this config
    #[must_use]
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            safety_margin: self.safety_margin,
            default_ttl: self.default_token_ttl,
            fetch_timeout: self.auth_timeout,
        }
    }

    /// Timing policy for the refresh-token stage of the `refresh` flow.
    ///
    /// Refresh tokens are long-lived and a rejected one is re-issued on the
    /// spot, so they are not cut short by the access-token margin.
    #[must_use]
    pub fn refresh_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            safety_margin: self.refresh_safety_margin,
            default_ttl: self.default_refresh_ttl,
            fetch_timeout: self.auth_timeout,
        }
    }

    /// Check that every agent setting is present and well-formed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first missing or malformed setting.
    pub fn validate(&self) -> Result<()> {
        require_url("agent.api_base (API_BASE)", &self.api_base)?;
        require_url("agent.endpoint (AGENT_ENDPOINT)", &self.endpoint)?;
        require("agent.agent_id (AGENT_ID)", &self.agent_id)?;
        require("agent.agent_key (AGENT_KEY)", &self.agent_key)?;
        require("agent.model", &self.model)?;
        if self.auth_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(Error::Config("agent timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Ticket search backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Search node URL (`OPENSEARCH_NODE`); empty disables ticket counts
    pub node: String,
    /// Basic-auth user (`OPENSEARCH_USERNAME`)
    #[serde(deserialize_with = "stringish::deserialize")]
    pub username: String,
    /// Basic-auth password (`OPENSEARCH_PASSWORD`)
    #[serde(deserialize_with = "stringish::deserialize")]
    pub password: String,
    /// Index holding ticket documents
    pub index: String,
    /// Result window requested per query
    pub result_window: u32,
    /// Skip TLS certificate verification (self-signed clusters)
    pub accept_invalid_certs: bool,
    /// Timeout for each search request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            node: String::new(),
            username: String::new(),
            password: String::new(),
            index: "tickets".to_string(),
            result_window: 100,
            accept_invalid_certs: false,
            timeout: Duration::from_secs(10),
        }
    }
}

impl SearchConfig {
    /// Whether a search node was configured at all
    pub fn is_configured(&self) -> bool {
        !self.node.is_empty()
    }

    /// Check the search settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first missing or malformed setting.
    pub fn validate(&self) -> Result<()> {
        require_url("search.node (OPENSEARCH_NODE)", &self.node)?;
        require("search.index", &self.index)?;
        if self.timeout.is_zero() {
            return Err(Error::Config("search.timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Accept strings, numbers and booleans for string fields
mod stringish {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stringish {
        Str(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
        Bool(bool),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Stringish::deserialize(deserializer)? {
            Stringish::Str(s) => s,
            Stringish::Unsigned(n) => n.to_string(),
            Stringish::Signed(n) => n.to_string(),
            Stringish::Float(n) => n.to_string(),
            Stringish::Bool(b) => b.to_string(),
        })
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Text(String),
        Seconds(u64),
    }

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    /// or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => return Ok(Duration::from_secs(secs)),
            RawDuration::Text(s) => s,
        };
        let s = s.trim();

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled::<D::Error>(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled::<D::Error>(hours, 3600)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }

    /// `value` units of `unit_secs` seconds, rejecting overflow
    fn scaled<E: serde::de::Error>(value: &str, unit_secs: u64) -> Result<Duration, E> {
        let value = value.parse::<u64>().map_err(E::custom)?;
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| E::custom(format!("duration out of range: {value} x {unit_secs}s")))
    }
}
