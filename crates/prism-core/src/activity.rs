//! Activity metric vector and the idle-score function.
//!
//! The agent computes a score for its own logs and for the heartbeat payload;
//! the daemon recomputes it with the resource's effective policy, which is the
//! value decisions are made on. Both sides share this code.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// One sample of resource activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetrics {
    /// CPU utilisation across all cores, 0-100.
    pub cpu_percent: f64,
    /// Memory pressure, 0-100.
    pub memory_pressure_percent: f64,
    /// Combined disk read+write throughput in KB/s.
    pub disk_io_kbps: f64,
    /// Combined network rx+tx throughput in KB/s.
    pub network_io_kbps: f64,
    /// GPU utilisation, 0-100, when the resource has a GPU.
    #[serde(default)]
    pub gpu_percent: Option<f64>,
    /// Whether an interactive login session is open.
    pub interactive_session: bool,
}

impl ActivityMetrics {
    /// A fully quiet sample.
    #[must_use]
    pub const fn quiet() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_pressure_percent: 0.0,
            disk_io_kbps: 0.0,
            network_io_kbps: 0.0,
            gpu_percent: None,
            interactive_session: false,
        }
    }
}

/// Relative weight of each metric in the idle score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricWeights {
    /// CPU weight.
    pub cpu: f64,
    /// Memory pressure weight.
    pub memory: f64,
    /// Disk I/O weight.
    pub disk: f64,
    /// Network I/O weight.
    pub network: f64,
    /// GPU weight, ignored when the sample carries no GPU reading.
    pub gpu: f64,
    /// Interactive session weight.
    pub interactive: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            cpu: 0.35,
            memory: 0.10,
            disk: 0.15,
            network: 0.15,
            gpu: 0.10,
            interactive: 0.15,
        }
    }
}

/// Metric values treated as full activity; readings are divided by these and
/// clamped to `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSaturation {
    /// CPU percent that counts as fully busy.
    pub cpu_percent: f64,
    /// Memory pressure percent that counts as fully busy.
    pub memory_pressure_percent: f64,
    /// Disk KB/s that counts as fully busy.
    pub disk_io_kbps: f64,
    /// Network KB/s that counts as fully busy.
    pub network_io_kbps: f64,
    /// GPU percent that counts as fully busy.
    pub gpu_percent: f64,
}

impl Default for MetricSaturation {
    fn default() -> Self {
        Self {
            cpu_percent: 100.0,
            memory_pressure_percent: 100.0,
            disk_io_kbps: 1_000.0,
            network_io_kbps: 1_000.0,
            gpu_percent: 100.0,
        }
    }
}

/// Weights plus saturation points: everything needed to score a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringProfile {
    /// Metric weights.
    #[serde(default)]
    pub weights: MetricWeights,
    /// Saturation points.
    #[serde(default)]
    pub saturation: MetricSaturation,
}

impl ScoringProfile {
    /// Check that weights are non-negative with a positive total and that all
    /// saturation points are positive.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidScoring` describing the first problem found.
    pub fn validate(&self) -> Result<(), CoreError> {
        let w = &self.weights;
        let weights = [
            ("cpu", w.cpu),
            ("memory", w.memory),
            ("disk", w.disk),
            ("network", w.network),
            ("gpu", w.gpu),
            ("interactive", w.interactive),
        ];
        if let Some((name, _)) = weights.iter().find(|(_, v)| !v.is_finite() || *v < 0.0) {
            return Err(CoreError::InvalidScoring(format!(
                "weight `{name}` must be a non-negative number"
            )));
        }
        if weights.iter().map(|(_, v)| v).sum::<f64>() <= 0.0 {
            return Err(CoreError::InvalidScoring(
                "at least one weight must be positive".into(),
            ));
        }
        let s = &self.saturation;
        let points = [
            s.cpu_percent,
            s.memory_pressure_percent,
            s.disk_io_kbps,
            s.network_io_kbps,
            s.gpu_percent,
        ];
        if points.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(CoreError::InvalidScoring(
                "saturation points must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Score a sample: `0.0` is completely idle, `1.0` is saturated.
    ///
    /// The GPU term only participates when the sample has a GPU reading.
    #[must_use]
    pub fn score(&self, metrics: &ActivityMetrics) -> f64 {
        let w = &self.weights;
        let s = &self.saturation;
        let mut weighted = w.cpu * normalise(metrics.cpu_percent, s.cpu_percent)
            + w.memory * normalise(metrics.memory_pressure_percent, s.memory_pressure_percent)
            + w.disk * normalise(metrics.disk_io_kbps, s.disk_io_kbps)
            + w.network * normalise(metrics.network_io_kbps, s.network_io_kbps);
        let mut total = w.cpu + w.memory + w.disk + w.network + w.interactive;

        if metrics.interactive_session {
            weighted += w.interactive;
        }
        if let Some(gpu) = metrics.gpu_percent {
            weighted += w.gpu * normalise(gpu, s.gpu_percent);
            total += w.gpu;
        }

        if total <= 0.0 {
            return 0.0;
        }
        (weighted / total).clamp(0.0, 1.0)
    }
}

fn normalise(value: f64, saturation: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 || saturation <= 0.0 {
        return 0.0;
    }
    (value / saturation).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_sample_scores_zero() {
        let profile = ScoringProfile::default();
        assert!(profile.score(&ActivityMetrics::quiet()).abs() < f64::EPSILON);
    }

    #[test]
    fn saturated_sample_scores_one() {
        let profile = ScoringProfile::default();
        let busy = ActivityMetrics {
            cpu_percent: 100.0,
            memory_pressure_percent: 100.0,
            disk_io_kbps: 5_000.0,
            network_io_kbps: 5_000.0,
            gpu_percent: Some(100.0),
            interactive_session: true,
        };
        assert!((profile.score(&busy) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn interactive_session_alone_lifts_score() {
        let profile = ScoringProfile::default();
        let sample = ActivityMetrics {
            interactive_session: true,
            ..ActivityMetrics::quiet()
        };
        // 0.15 / (0.35 + 0.10 + 0.15 + 0.15 + 0.15)
        let expected = 0.15 / 0.90;
        assert!((profile.score(&sample) - expected).abs() < 1e-9);
    }

    #[test]
    fn gpu_weight_only_counts_with_reading() {
        let profile = ScoringProfile {
            weights: MetricWeights {
                cpu: 1.0,
                memory: 0.0,
                disk: 0.0,
                network: 0.0,
                gpu: 1.0,
                interactive: 0.0,
            },
            saturation: MetricSaturation::default(),
        };
        let cpu_only = ActivityMetrics {
            cpu_percent: 50.0,
            ..ActivityMetrics::quiet()
        };
        assert!((profile.score(&cpu_only) - 0.5).abs() < 1e-9);

        let with_idle_gpu = ActivityMetrics {
            gpu_percent: Some(0.0),
            ..cpu_only
        };
        assert!((profile.score(&with_idle_gpu) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_negative_and_zero_weights() {
        let mut profile = ScoringProfile::default();
        profile.weights.cpu = -1.0;
        assert!(profile.validate().is_err());

        let zero = ScoringProfile {
            weights: MetricWeights {
                cpu: 0.0,
                memory: 0.0,
                disk: 0.0,
                network: 0.0,
                gpu: 0.0,
                interactive: 0.0,
            },
            saturation: MetricSaturation::default(),
        };
        assert!(zero.validate().is_err());
        assert!(ScoringProfile::default().validate().is_ok());
    }
}
