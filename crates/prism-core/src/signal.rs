//! The heartbeat message sent by the idle detection agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityMetrics;
use crate::ids::ResourceId;

/// One heartbeat from the agent running on a managed resource.
///
/// `seq` increases monotonically within one `boot_id`. A new `boot_id` means
/// the resource restarted and the agent's idle history was discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleSignal {
    /// Resource the agent runs on.
    pub resource_id: ResourceId,
    /// Sequence number within the current boot.
    pub seq: u64,
    /// Identifier of the current boot of the resource.
    pub boot_id: u64,
    /// When the agent took the sample.
    pub sent_at: DateTime<Utc>,
    /// The sampled activity.
    pub metrics: ActivityMetrics,
    /// Score the agent computed with its local profile.
    pub idle_score: f64,
    /// Seconds the agent has seen the resource continuously idle.
    #[serde(default)]
    pub idle_for_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProjectId;

    #[test]
    fn json_shape() {
        let signal = IdleSignal {
            resource_id: ResourceId::generate(&ProjectId::generate(), "ws"),
            seq: 7,
            boot_id: 42,
            sent_at: Utc::now(),
            metrics: ActivityMetrics::quiet(),
            idle_score: 0.0,
            idle_for_secs: 0,
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["resource_id"], signal.resource_id.to_hex());

        let parsed: IdleSignal = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, signal);
    }
}
