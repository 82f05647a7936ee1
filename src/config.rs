use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::nodes::NodeDescriptor;
use crate::sources::SearchSource;

/// Configuración del manager.
///
/// Everything the manager needs is supplied here; nothing is persisted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // Nodos
    pub nodes: Vec<NodeDescriptor>,
    pub client_name: String,

    // Reconexión
    pub reconnect_timeout_ms: u64,
    pub reconnect_tries: u32,

    // Resume
    pub resume: bool,
    pub resume_key: Option<String>,
    pub resume_timeout_secs: u64,

    // Comandos REST
    pub request_timeout_ms: u64,

    // Búsqueda
    pub default_search_source: SearchSource,

    // Canales internos
    pub event_capacity: usize,
    pub inbound_capacity: usize,
}

impl Config {
    /// Loads the configuration.
    ///
    /// Sources, later ones win:
    ///
    /// - `.env` (via `dotenvy`), only to populate the environment
    /// - optional `nodes.toml` / `nodes.json` (or the file named by
    ///   `OPEN_MUSIC_CONFIG`)
    /// - `OPEN_MUSIC__*` environment variables, e.g.
    ///   `OPEN_MUSIC__RECONNECT_TRIES=10`
    ///
    /// When no node is configured a single `main` node is built from
    /// `LAVALINK_HOST`, `LAVALINK_PORT` and `LAVALINK_PASSWORD`.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = std::env::var("OPEN_MUSIC_CONFIG").unwrap_or_else(|_| "nodes".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("OPEN_MUSIC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;

        if config.nodes.is_empty() {
            config.nodes.push(Self::node_from_env()?);
        }

        config.validate()?;
        debug!("{}", config.summary());

        Ok(config)
    }

    fn node_from_env() -> Result<NodeDescriptor> {
        let host = std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("LAVALINK_PORT")
            .unwrap_or_else(|_| "2333".to_string())
            .parse::<u16>()
            .map_err(|e| Error::Configuration(format!("LAVALINK_PORT: {}", e)))?;
        let password =
            std::env::var("LAVALINK_PASSWORD").unwrap_or_else(|_| "youshallnotpass".to_string());
        let secure = std::env::var("LAVALINK_SECURE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(NodeDescriptor {
            secure,
            ..NodeDescriptor::new("main", host, port, password)
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Every node must be valid on its own and node names must be unique
    /// - Reconnect timeout and request timeout must be greater than 0
    /// - Channel capacities must be greater than 0
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !names.insert(node.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "node name `{}` is used more than once",
                    node.name
                )));
            }
        }

        if self.reconnect_timeout_ms == 0 {
            return Err(Error::Configuration(
                "reconnect timeout must be greater than 0".into(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::Configuration(
                "request timeout must be greater than 0".into(),
            ));
        }

        if self.event_capacity == 0 || self.inbound_capacity == 0 {
            return Err(Error::Configuration(
                "channel capacities must be greater than 0".into(),
            ));
        }

        if self.client_name.trim().is_empty() {
            return Err(Error::Configuration("client name cannot be empty".into()));
        }

        Ok(())
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Passwords and resume keys are left out.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Reconnect: every {}ms, {} tries\n  \
            Resume: {} ({}s)\n  \
            Requests: {}ms timeout, search via {}",
            self.nodes
                .iter()
                .map(|n| format!("{}@{}:{}", n.name, n.host, n.port))
                .collect::<Vec<_>>()
                .join(", "),
            self.reconnect_timeout_ms,
            self.reconnect_tries,
            self.resume,
            self.resume_timeout_secs,
            self.request_timeout_ms,
            self.default_search_source.prefix(),
        )
    }
}

/// Default configuration values.
impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            client_name: format!("open-music-nodes/{}", env!("CARGO_PKG_VERSION")),

            reconnect_timeout_ms: 5_000,
            reconnect_tries: 5,

            resume: false,
            resume_key: None,
            resume_timeout_secs: 60,

            request_timeout_ms: 10_000,

            default_search_source: SearchSource::Deezer,

            event_capacity: 256,
            inbound_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect_tries, 5);
    }

    #[test]
    fn test_duplicate_node_names_are_rejected() {
        let config = Config {
            nodes: vec![
                NodeDescriptor::new("a", "10.0.0.1", 2333, "pw"),
                NodeDescriptor::new("a", "10.0.0.2", 2333, "pw"),
            ],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let config = Config {
            reconnect_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            request_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_partial_fields() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "reconnect_tries": 9,
            "nodes": [{ "name": "eu", "host": "eu.example.org", "port": 443, "secure": true, "regions": ["Rotterdam"] }]
        }))
        .unwrap();

        assert_eq!(config.reconnect_tries, 9);
        assert_eq!(config.reconnect_timeout_ms, 5_000);
        assert_eq!(config.nodes[0].password, "youshallnotpass");
        assert!(config.nodes[0].secure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_summary_hides_passwords() {
        let config = Config {
            nodes: vec![NodeDescriptor::new("a", "10.0.0.1", 2333, "super-secret")],
            ..Config::default()
        };
        let summary = config.summary();
        assert!(summary.contains("a@10.0.0.1:2333"));
        assert!(!summary.contains("super-secret"));
    }
}
