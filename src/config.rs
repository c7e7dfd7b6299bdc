//! Relay Server Configuration
//!
//! Configuration loaded from `SAFECHAT_*` environment variables. Values that
//! fail to parse keep their defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::key_vault::DEFAULT_KEY_BITS;
use crate::message_store::StorageBackend;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// HTTP API and metrics listen address.
    pub http_addr: SocketAddr,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Chat frames per minute per user.
    pub rate_limit_per_min: u32,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Directory holding the SQLite databases.
    pub data_dir: PathBuf,
    /// Seconds without inbound traffic before a connection is closed.
    pub idle_timeout_secs: u64,
    /// RSA modulus size for newly provisioned users.
    pub key_bits: usize,
    /// Bearer token required by `/metrics`, if set.
    pub metrics_token: Option<String>,
    /// Operator confirmation that TLS is terminated in front of the relay.
    pub tls_verified: bool,
    /// Browser origins allowed to call the HTTP API. `None` allows any.
    pub cors_origins: Option<Vec<String>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            max_connections: 1000,
            max_message_size: 64 * 1024,
            rate_limit_per_min: 60,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            idle_timeout_secs: 300,
            key_bits: DEFAULT_KEY_BITS,
            metrics_token: None,
            tls_verified: false,
            cors_origins: None,
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: Option<String>, target: &mut T) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}

/// Comma-separated origins; `*` or an empty list allows any origin.
fn parse_origins(value: &str) -> Option<Vec<String>> {
    let origins: Vec<String> = value
        .split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        None
    } else {
        Some(origins)
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        parse_into(lookup("SAFECHAT_LISTEN_ADDR"), &mut config.listen_addr);
        parse_into(lookup("SAFECHAT_HTTP_ADDR"), &mut config.http_addr);
        parse_into(lookup("SAFECHAT_MAX_CONNECTIONS"), &mut config.max_connections);
        parse_into(
            lookup("SAFECHAT_MAX_MESSAGE_SIZE"),
            &mut config.max_message_size,
        );
        parse_into(lookup("SAFECHAT_RATE_LIMIT"), &mut config.rate_limit_per_min);
        parse_into(lookup("SAFECHAT_IDLE_TIMEOUT"), &mut config.idle_timeout_secs);
        parse_into(lookup("SAFECHAT_KEY_BITS"), &mut config.key_bits);

        if let Some(val) = lookup("SAFECHAT_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Some(val) = lookup("SAFECHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config.metrics_token = lookup("SAFECHAT_METRICS_TOKEN").filter(|t| !t.is_empty());
        config.tls_verified = lookup("SAFECHAT_TLS_VERIFIED").is_some();

        if let Some(val) = lookup("SAFECHAT_CORS_ORIGINS") {
            config.cors_origins = parse_origins(&val);
        }

        config
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Whether the WebSocket listener only accepts local connections.
    pub fn is_loopback(&self) -> bool {
        self.listen_addr.ip().is_loopback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> RelayConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.http_addr.to_string(), "127.0.0.1:8001");
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.max_message_size, 65_536);
        assert_eq!(config.rate_limit_per_min, 60);
        assert_eq!(config.storage_backend, StorageBackend::Sqlite);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.key_bits, 2048);
        assert!(config.metrics_token.is_none());
        assert!(!config.tls_verified);
        assert!(!config.is_loopback());
        assert!(config.cors_origins.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("SAFECHAT_LISTEN_ADDR", "127.0.0.1:9000"),
            ("SAFECHAT_MAX_CONNECTIONS", "10"),
            ("SAFECHAT_RATE_LIMIT", "5"),
            ("SAFECHAT_STORAGE_BACKEND", "Memory"),
            ("SAFECHAT_DATA_DIR", "/var/lib/safechat"),
            ("SAFECHAT_IDLE_TIMEOUT", "30"),
            ("SAFECHAT_KEY_BITS", "3072"),
            ("SAFECHAT_METRICS_TOKEN", "secret"),
            ("SAFECHAT_TLS_VERIFIED", "1"),
        ]);

        assert_eq!(config.listen_addr.port(), 9000);
        assert!(config.is_loopback());
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.rate_limit_per_min, 5);
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/safechat"));
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.key_bits, 3072);
        assert_eq!(config.metrics_token.as_deref(), Some("secret"));
        assert!(config.tls_verified);
    }

    #[test]
    fn test_cors_origins() {
        let config = from_pairs(&[(
            "SAFECHAT_CORS_ORIGINS",
            "https://chat.example.com/, http://localhost:3000",
        )]);
        assert_eq!(
            config.cors_origins,
            Some(vec![
                "https://chat.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ])
        );

        let any = from_pairs(&[("SAFECHAT_CORS_ORIGINS", "*")]);
        assert!(any.cors_origins.is_none());
        let blank = from_pairs(&[("SAFECHAT_CORS_ORIGINS", " , ")]);
        assert!(blank.cors_origins.is_none());
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = from_pairs(&[
            ("SAFECHAT_LISTEN_ADDR", "not an address"),
            ("SAFECHAT_MAX_MESSAGE_SIZE", "-1"),
            ("SAFECHAT_METRICS_TOKEN", ""),
        ]);

        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.max_message_size, 65_536);
        assert!(config.metrics_token.is_none());
    }
}
