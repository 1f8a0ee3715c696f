//! Types for the provider crate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use prism_store::ProviderState;
use serde::{Deserialize, Serialize};

/// What the provider reports about one instance or volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Current provider-side state.
    pub state: ProviderState,
    /// When the provider last changed this state, if it says.
    #[serde(default)]
    pub changed_at: Option<DateTime<Utc>>,
    /// Human-readable message about the status.
    #[serde(default)]
    pub message: Option<String>,
}

impl ProviderStatus {
    /// A status with no timestamp or message.
    #[must_use]
    pub const fn new(state: ProviderState) -> Self {
        Self {
            state,
            changed_at: None,
            message: None,
        }
    }

    /// Whether the provider is billing for the resource in this state.
    #[must_use]
    pub const fn is_billing(&self) -> bool {
        matches!(self.state, ProviderState::Pending | ProviderState::Running)
    }
}

/// Configuration for the HTTP provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider adapter service.
    pub base_url: String,
    /// Per-request timeout.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// TCP connect timeout.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9400".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `PROVIDER_URL`: Base URL of the provider adapter
    /// - `PROVIDER_TIMEOUT_SECS`: Per-request timeout
    /// - `PROVIDER_CONNECT_TIMEOUT_SECS`: Connect timeout
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PROVIDER_URL") {
            config.base_url = val;
        }
        if let Ok(val) = std::env::var("PROVIDER_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.request_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("PROVIDER_CONNECT_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.connect_timeout = Duration::from_secs(n);
            }
        }

        config
    }
}

/// Serde helper for whole-second durations.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as seconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    /// Deserialize from seconds.
    ///
    /// # Errors
    ///
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_states() {
        assert!(ProviderStatus::new(ProviderState::Running).is_billing());
        assert!(ProviderStatus::new(ProviderState::Pending).is_billing());
        assert!(!ProviderStatus::new(ProviderState::Hibernated).is_billing());
        assert!(!ProviderStatus::new(ProviderState::NotFound).is_billing());
    }

    #[test]
    fn status_json_shape() {
        let status: ProviderStatus =
            serde_json::from_str(r#"{"state":"hibernated"}"#).unwrap();
        assert_eq!(status.state, ProviderState::Hibernated);
        assert!(status.changed_at.is_none());
    }

    #[test]
    fn config_serde_uses_seconds() {
        let config = ProviderConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], 30);
        let parsed: ProviderConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.connect_timeout, Duration::from_secs(5));
    }
}
