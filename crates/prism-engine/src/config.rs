//! Engine configuration.

use chrono::Duration;
use prism_provider::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Configuration for the governance engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expected interval between agent heartbeats (seconds).
    pub heartbeat_interval_seconds: u64,
    /// Missed-interval multiple after which an agent counts as unreachable.
    pub unreachable_multiplier: u32,
    /// How long an agent may stay unreachable before operators are flagged (seconds).
    pub escalation_after_seconds: u64,
    /// Interval between full reconciliation passes (seconds).
    pub reconcile_interval_seconds: u64,
    /// Grace window after a local transition during which provider drift is ignored (seconds).
    pub reconcile_grace_seconds: u64,
    /// Concurrent describe calls during a reconciliation pass.
    pub reconcile_concurrency: usize,
    /// Interval of the evaluation tick: grace timers, agent health, approvals (seconds).
    pub evaluation_tick_seconds: u64,
    /// Interval of the accrual task (seconds).
    pub accrual_interval_seconds: u64,
    /// How long a pending approval waits before it is auto-denied (seconds).
    pub approval_timeout_seconds: u64,
    /// Running time debited in advance each time billing is extended (seconds).
    pub billing_block_seconds: u64,
    /// A billing window is extended once it has less than this left (seconds).
    pub billing_refresh_seconds: u64,
    /// Policy used when neither the resource nor its project names one.
    pub default_policy: String,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 60,
            unreachable_multiplier: 3,
            escalation_after_seconds: 1800, // 30 minutes
            reconcile_interval_seconds: 300,
            reconcile_grace_seconds: 90,
            reconcile_concurrency: 8,
            evaluation_tick_seconds: 30,
            accrual_interval_seconds: 300,
            approval_timeout_seconds: 86_400, // 24 hours
            billing_block_seconds: 3_600,
            billing_refresh_seconds: 600,
            default_policy: "standard".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported environment variables:
    /// - `PRISM_HEARTBEAT_INTERVAL_SECS`
    /// - `PRISM_RECONCILE_INTERVAL_SECS`
    /// - `PRISM_RECONCILE_GRACE_SECS`
    /// - `PRISM_APPROVAL_TIMEOUT_SECS`
    /// - `PRISM_BILLING_BLOCK_SECS`
    /// - `PRISM_PROVIDER_MAX_ATTEMPTS`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let read = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = read("PRISM_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval_seconds = v;
        }
        if let Some(v) = read("PRISM_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval_seconds = v;
        }
        if let Some(v) = read("PRISM_RECONCILE_GRACE_SECS") {
            config.reconcile_grace_seconds = v;
        }
        if let Some(v) = read("PRISM_APPROVAL_TIMEOUT_SECS") {
            config.approval_timeout_seconds = v;
        }
        if let Some(v) = read("PRISM_BILLING_BLOCK_SECS") {
            config.billing_block_seconds = v;
        }
        if let Some(v) = read("PRISM_PROVIDER_MAX_ATTEMPTS").and_then(|v| u32::try_from(v).ok()) {
            config.retry.max_attempts = v;
        }

        config
    }

    /// Heartbeat silence after which an agent counts as unreachable.
    #[must_use]
    pub fn unreachable_after(&self) -> Duration {
        secs(self.heartbeat_interval_seconds.saturating_mul(u64::from(self.unreachable_multiplier)))
    }

    /// Heartbeat silence after which operators are flagged.
    #[must_use]
    pub fn escalation_after(&self) -> Duration {
        secs(self.escalation_after_seconds)
    }

    /// Reconciliation grace window.
    #[must_use]
    pub fn reconcile_grace(&self) -> Duration {
        secs(self.reconcile_grace_seconds)
    }

    /// Approval timeout.
    #[must_use]
    pub fn approval_timeout(&self) -> Duration {
        secs(self.approval_timeout_seconds)
    }

    /// Length of one prepaid billing block.
    #[must_use]
    pub fn billing_block(&self) -> Duration {
        secs(self.billing_block_seconds)
    }

    /// Remaining prepaid time below which a window is extended.
    #[must_use]
    pub fn billing_refresh(&self) -> Duration {
        secs(self.billing_refresh_seconds)
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.unreachable_after(), Duration::minutes(3));
        assert_eq!(config.reconcile_grace(), Duration::seconds(90));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.default_policy, "standard");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"billing_block_seconds": 900}"#).unwrap();
        assert_eq!(config.billing_block(), Duration::minutes(15));
        assert_eq!(config.heartbeat_interval_seconds, 60);
    }
}
