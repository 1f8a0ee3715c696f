//! Fire-and-forget notifications for the external delivery subsystem.
//!
//! The engine never waits for delivery: a [`Notifier`] must return
//! immediately, dropping the notification if it cannot queue it.

use chrono::{DateTime, Utc};
use prism_core::{AccountId, ApprovalId, Money, ResourceId};
use prism_store::{ApprovalStatus, IdleAction, RequestedAction};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Something a human may want to hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A resource entered its idle grace period.
    IdleWarning {
        /// The resource.
        resource_id: ResourceId,
        /// What will happen at the deadline.
        action: IdleAction,
        /// When it will happen.
        deadline: DateTime<Utc>,
    },
    /// An idle action was taken (or, for `notify`, is the whole action).
    IdleAction {
        /// The resource.
        resource_id: ResourceId,
        /// What was done.
        action: IdleAction,
    },
    /// An account crossed an alert threshold.
    BudgetThreshold {
        /// The account.
        account_id: AccountId,
        /// Threshold crossed, as a fraction.
        threshold: f64,
        /// Rollup spend at the time.
        spend: Money,
        /// The account's limit.
        limit: Money,
    },
    /// A launch needs an approver.
    ApprovalNeeded {
        /// The request.
        approval_id: ApprovalId,
        /// Account charged.
        account_id: AccountId,
        /// Which limit was exceeded.
        reason: String,
    },
    /// An approval was decided or expired.
    ApprovalDecided {
        /// The request.
        approval_id: ApprovalId,
        /// Outcome.
        status: ApprovalStatus,
    },
    /// An agent has been silent past the escalation threshold.
    AgentEscalated {
        /// The resource.
        resource_id: ResourceId,
        /// Last heartbeat, if any was ever received.
        last_heartbeat_at: Option<DateTime<Utc>>,
    },
    /// A resource entered `Failed`.
    ResourceFailed {
        /// The resource.
        resource_id: ResourceId,
        /// Provider error.
        error: String,
    },
    /// A hibernation schedule put a resource to sleep or woke it.
    ScheduleApplied {
        /// The resource.
        resource_id: ResourceId,
        /// Schedule name.
        schedule: String,
        /// What was requested.
        action: RequestedAction,
    },
    /// Reconciliation found drift it would not resolve on its own.
    DriftEscalated {
        /// The resource.
        resource_id: ResourceId,
        /// What disagrees.
        detail: String,
    },
    /// An account was frozen by a ledger inconsistency.
    AccountFrozen {
        /// The account.
        account_id: AccountId,
        /// What disagreed.
        detail: String,
    },
}

/// Sink for notifications.
pub trait Notifier: Send + Sync {
    /// Hand a notification off without blocking.
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::ResourceFailed { .. }
            | Notification::DriftEscalated { .. }
            | Notification::AccountFrozen { .. }
            | Notification::AgentEscalated { .. } => {
                tracing::warn!(?notification, "Notification");
            }
            _ => tracing::info!(?notification, "Notification"),
        }
    }
}

/// Publishes notifications on a broadcast channel.
///
/// Slow subscribers lose the oldest notifications rather than holding up the
/// engine.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier with room for `capacity` unread notifications per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        tracing::debug!(?notification, "Publishing notification");
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_notifier_delivers_to_subscribers() {
        let notifier = ChannelNotifier::new(8);
        let mut rx = notifier.subscribe();

        let approval_id = ApprovalId::generate();
        notifier.notify(Notification::ApprovalDecided {
            approval_id,
            status: ApprovalStatus::Expired,
        });

        match rx.recv().await.unwrap() {
            Notification::ApprovalDecided { status, .. } => {
                assert_eq!(status, ApprovalStatus::Expired);
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn channel_notifier_without_subscribers_does_not_block() {
        let notifier = ChannelNotifier::new(1);
        for _ in 0..10 {
            notifier.notify(Notification::AccountFrozen {
                account_id: AccountId::generate(),
                detail: "test".into(),
            });
        }
    }
}
