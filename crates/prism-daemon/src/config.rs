//! Daemon configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for the HTTP daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "DaemonConfig::default_listen_addr")]
    pub listen_addr: String,

    /// Directory holding the RocksDB store.
    #[serde(default = "DaemonConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the provider adapter. The mock provider is used when this
    /// is unset and the daemon was built with `dev-mode`.
    #[serde(default)]
    pub provider_url: Option<String>,

    /// Allowed CORS origins.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    #[serde(default = "DaemonConfig::default_max_body")]
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    #[serde(default = "DaemonConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Largest page the journal endpoint returns.
    #[serde(default = "DaemonConfig::default_journal_page")]
    pub journal_page_limit: usize,
}

impl DaemonConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    const fn default_max_body() -> usize {
        1024 * 1024 // 1 MB
    }

    const fn default_request_timeout() -> u64 {
        30
    }

    const fn default_journal_page() -> usize {
        500
    }

    /// Load configuration from environment variables.
    ///
    /// Reads `LISTEN_ADDR`, `DATA_DIR`, `PROVIDER_URL`, `CORS_ORIGINS`
    /// (comma separated), `MAX_BODY_BYTES` and `REQUEST_TIMEOUT_SECS`; anything
    /// unset or unparseable keeps its default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }
        config.provider_url = std::env::var("PROVIDER_URL").ok().filter(|v| !v.is_empty());
        if let Ok(val) = std::env::var("CORS_ORIGINS") {
            config.cors_origins = val
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("MAX_BODY_BYTES") {
            if let Ok(n) = val.parse() {
                config.max_body_bytes = n;
            }
        }
        if let Ok(val) = std::env::var("REQUEST_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.request_timeout_seconds = n;
            }
        }

        config
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            data_dir: Self::default_data_dir(),
            provider_url: None,
            cors_origins: vec!["*".to_string()],
            max_body_bytes: Self::default_max_body(),
            request_timeout_seconds: Self::default_request_timeout(),
            journal_page_limit: Self::default_journal_page(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(config.provider_url.is_none());
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: DaemonConfig = serde_json::from_value(serde_json::json!({
            "listen_addr": "127.0.0.1:9000",
            "provider_url": "http://provider:7000",
        }))
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.provider_url.as_deref(), Some("http://provider:7000"));
        assert_eq!(config.journal_page_limit, 500);
        assert!(config.cors_origins.is_empty());
    }
}
