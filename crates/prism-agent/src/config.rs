//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use prism_core::{ResourceId, ScoringProfile};
use serde::Deserialize;

use crate::agent::AgentSettings;
use crate::error::{AgentError, Result};

/// Configuration for the idle detection agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the prism daemon.
    pub daemon_url: String,

    /// Resource this agent reports for.
    pub resource_id: ResourceId,

    /// Interval between heartbeats in seconds.
    #[serde(default = "AgentConfig::default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// Fraction of the interval used as random jitter, 0.0-1.0.
    #[serde(default = "AgentConfig::default_jitter")]
    pub jitter_fraction: f64,

    /// Score below which a sample counts as idle.
    #[serde(default = "AgentConfig::default_idle_score")]
    pub idle_score_threshold: f64,

    /// Weights and saturation points for the local idle score.
    #[serde(default)]
    pub scoring: ScoringProfile,

    /// Directory for the sequence checkpoint and staged updates.
    #[serde(default = "AgentConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Root of the proc filesystem.
    #[serde(default = "AgentConfig::default_proc_root")]
    pub proc_root: PathBuf,

    /// Directory of pseudo-terminals; an open one means an interactive session.
    #[serde(default = "AgentConfig::default_pts_dir")]
    pub pts_dir: PathBuf,

    /// URL of the update manifest. Self-update is off when unset.
    #[serde(default)]
    pub update_manifest_url: Option<String>,

    /// Hex-encoded 32-byte key for verifying update artifacts.
    #[serde(default)]
    pub update_key: Option<String>,

    /// Interval between update checks in seconds.
    #[serde(default = "AgentConfig::default_update_interval")]
    pub update_interval_seconds: u64,

    /// HTTP request timeout in seconds.
    #[serde(default = "AgentConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl AgentConfig {
    const fn default_heartbeat_interval() -> u64 {
        60
    }

    const fn default_jitter() -> f64 {
        0.1
    }

    const fn default_idle_score() -> f64 {
        0.1
    }

    fn default_state_dir() -> PathBuf {
        PathBuf::from("/var/lib/prism-agent")
    }

    fn default_proc_root() -> PathBuf {
        PathBuf::from("/proc")
    }

    fn default_pts_dir() -> PathBuf {
        PathBuf::from("/dev/pts")
    }

    const fn default_update_interval() -> u64 {
        3600 // 1 hour
    }

    const fn default_request_timeout() -> u64 {
        10
    }

    /// A configuration with defaults for everything but the daemon and resource.
    #[must_use]
    pub fn new(daemon_url: impl Into<String>, resource_id: ResourceId) -> Self {
        Self {
            daemon_url: daemon_url.into(),
            resource_id,
            heartbeat_interval_seconds: Self::default_heartbeat_interval(),
            jitter_fraction: Self::default_jitter(),
            idle_score_threshold: Self::default_idle_score(),
            scoring: ScoringProfile::default(),
            state_dir: Self::default_state_dir(),
            proc_root: Self::default_proc_root(),
            pts_dir: Self::default_pts_dir(),
            update_manifest_url: None,
            update_key: None,
            update_interval_seconds: Self::default_update_interval(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required: `PRISM_DAEMON_URL`, `PRISM_RESOURCE_ID`. Optional:
    /// `PRISM_HEARTBEAT_INTERVAL_SECS`, `PRISM_JITTER_FRACTION`,
    /// `PRISM_STATE_DIR`, `PRISM_UPDATE_MANIFEST_URL`, `PRISM_UPDATE_KEY`,
    /// `PRISM_UPDATE_INTERVAL_SECS`.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` when a required variable is missing or a
    /// value does not parse.
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| {
            std::env::var(name).map_err(|_| AgentError::Config(format!("{name} is not set")))
        };
        let daemon_url = required("PRISM_DAEMON_URL")?;
        let resource_id = required("PRISM_RESOURCE_ID")?
            .parse::<ResourceId>()
            .map_err(|e| AgentError::Config(format!("PRISM_RESOURCE_ID: {e}")))?;

        let mut config = Self::new(daemon_url, resource_id);

        if let Some(v) = parsed::<u64>("PRISM_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval_seconds = v;
        }
        if let Some(v) = parsed::<f64>("PRISM_JITTER_FRACTION")? {
            config.jitter_fraction = v;
        }
        if let Ok(v) = std::env::var("PRISM_STATE_DIR") {
            config.state_dir = PathBuf::from(v);
        }
        config.update_manifest_url = std::env::var("PRISM_UPDATE_MANIFEST_URL").ok();
        config.update_key = std::env::var("PRISM_UPDATE_KEY").ok();
        if let Some(v) = parsed::<u64>("PRISM_UPDATE_INTERVAL_SECS")? {
            config.update_interval_seconds = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(AgentError::Config("heartbeat interval must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(AgentError::Config("jitter fraction must be within 0-1".into()));
        }
        if !(0.0..=1.0).contains(&self.idle_score_threshold) {
            return Err(AgentError::Config("idle score threshold must be within 0-1".into()));
        }
        self.scoring
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;
        if self.update_manifest_url.is_some() && self.update_key.is_none() {
            return Err(AgentError::Config(
                "an update manifest needs PRISM_UPDATE_KEY".into(),
            ));
        }
        Ok(())
    }

    /// Heartbeat interval as a `Duration`.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Update check interval as a `Duration`.
    #[must_use]
    pub const fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds)
    }

    /// Loop settings derived from this configuration.
    #[must_use]
    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            resource_id: self.resource_id,
            interval: self.heartbeat_interval(),
            jitter_fraction: self.jitter_fraction,
            update_interval: self.update_interval(),
            scoring: self.scoring,
            idle_score_threshold: self.idle_score_threshold,
        }
    }

    /// Request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AgentError::Config(format!("{name}: cannot parse `{raw}`"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::ProjectId;

    fn config() -> AgentConfig {
        AgentConfig::new(
            "http://localhost:8080",
            ResourceId::generate(&ProjectId::generate(), "ws"),
        )
    }

    #[test]
    fn defaults() {
        let config = config();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert!((config.jitter_fraction - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut bad = config();
        bad.jitter_fraction = 1.5;
        assert!(bad.validate().is_err());

        let mut unsigned = config();
        unsigned.update_manifest_url = Some("https://updates.example/manifest.json".into());
        assert!(unsigned.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let id = ResourceId::generate(&ProjectId::generate(), "ws");
        let json = serde_json::json!({
            "daemon_url": "http://daemon:8080",
            "resource_id": id.to_hex(),
            "heartbeat_interval_seconds": 30,
        });
        let config: AgentConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.resource_id, id);
        assert_eq!(config.heartbeat_interval_seconds, 30);
        assert_eq!(config.update_interval_seconds, 3600);
    }
}
