//! Request and response types for governance operations.

use chrono::{DateTime, Utc};
use prism_core::{AccountId, BudgetPeriod, Money, ResourceId};
use prism_store::{
    AgentStatus, ApprovalRequest, AutoAction, LifecycleState, ManagedResource, PendingIdle,
    ReconciliationRecord, RevertAction, RoleQuota,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Budget authorization
// =============================================================================

/// The limit a launch or resume ran into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "limit", rename_all = "snake_case")]
pub enum QuotaLimit {
    /// Monthly budget of this account or an ancestor.
    MonthlyBudget {
        /// Account whose budget is exhausted.
        account_id: AccountId,
        /// That account's monthly limit.
        monthly_limit: Money,
    },
    /// The instance class is not on the role's allow list.
    InstanceClass {
        /// Class that was requested.
        requested: String,
        /// Patterns the role allows.
        allowed: Vec<String>,
    },
    /// Too many resources already billing.
    Concurrency {
        /// Allowed maximum.
        max: u32,
        /// Currently billing or starting.
        current: u32,
    },
    /// Today's spend cap.
    DailyCap {
        /// Allowed per UTC day.
        cap: Money,
        /// Already spent today.
        spent_today: Money,
    },
    /// A `prevent_launch` auto-action is in force.
    LaunchBlocked {
        /// Account whose auto-action fired.
        account_id: AccountId,
    },
}

/// Why a launch or resume was not allowed outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetDenial {
    /// Account the request was charged to.
    pub account_id: AccountId,
    /// The specific limit hit.
    pub limit: QuotaLimit,
    /// Whether the limit is hard (deny) rather than routed to approval.
    pub hard_cap: bool,
    /// Budget remaining on the charged account.
    pub remaining: Money,
    /// Cost of the first billing block the request needed.
    pub requested: Money,
    /// What the requester can do about it.
    pub remediation: String,
}

impl BudgetDenial {
    /// One-line description of the limit hit.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.limit {
            QuotaLimit::MonthlyBudget {
                account_id,
                monthly_limit,
            } => format!(
                "monthly budget of account {account_id} ({monthly_limit}) cannot cover {}; {} remaining",
                self.requested, self.remaining
            ),
            QuotaLimit::InstanceClass { requested, allowed } => format!(
                "instance class {requested} is not allowed; allowed classes: {}",
                allowed.join(", ")
            ),
            QuotaLimit::Concurrency { max, current } => {
                format!("{current} resources already running; limit is {max}")
            }
            QuotaLimit::DailyCap { cap, spent_today } => {
                format!("daily cap {cap} reached ({spent_today} spent today)")
            }
            QuotaLimit::LaunchBlocked { account_id } => {
                format!("new launches are blocked on account {account_id} for this period")
            }
        }
    }
}

/// Outcome of a budget authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Within budget and quota.
    Allow,
    /// Over a soft limit: needs an approver.
    RouteToApproval(BudgetDenial),
    /// Over a hard limit.
    Deny(BudgetDenial),
}

// =============================================================================
// Operation results
// =============================================================================

/// Result of a launch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    /// The resource was created and started.
    Launched {
        /// The new resource.
        resource: Box<ManagedResource>,
    },
    /// The request was routed to the approval workflow.
    PendingApproval {
        /// The approval request awaiting a decision.
        approval: Box<ApprovalRequest>,
    },
}

/// Daemon response to a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Whether the signal was accepted.
    pub accepted: bool,
    /// Why it was ignored, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Lifecycle state after processing.
    pub state: LifecycleState,
    /// Score computed with the resource's effective policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_score: Option<f64>,
    /// Seconds of continuous idleness the daemon has accumulated.
    pub idle_for_secs: u64,
}

/// A budget account's balances for the current period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStatus {
    /// The account.
    pub account_id: AccountId,
    /// Account name.
    pub name: String,
    /// Parent account, if any.
    pub parent_id: Option<AccountId>,
    /// Period reported.
    pub period: BudgetPeriod,
    /// Monthly limit.
    pub monthly_limit: Money,
    /// Sum of this account's own events in the period.
    pub current_spend: Money,
    /// Own spend plus every descendant's spend.
    pub rollup_spend: Money,
    /// Rollover credited at the start of the period.
    pub rollover_credit: Money,
    /// Credits from early hibernation or stop this period.
    pub banked_headroom: Money,
    /// Limit minus rollup spend.
    pub remaining: Money,
    /// Rollup spend as a percentage of the limit.
    pub spent_percent: f64,
    /// Average daily spend of the last seven days, times thirty.
    pub projected_monthly_spend: Money,
    /// Days until `remaining` runs out at the recent daily rate.
    pub days_until_exhausted: Option<f64>,
    /// Resources currently billing on this account.
    pub billing_resources: usize,
    /// Set while the account is frozen by a ledger inconsistency.
    pub frozen: Option<String>,
    /// Whether new launches are blocked for the rest of the period.
    pub launch_blocked: bool,
}

/// What idle handling saved an account in one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingsReport {
    /// The account.
    pub account_id: AccountId,
    /// Period reported.
    pub period: BudgetPeriod,
    /// Total `credit-hibernate` amounts.
    pub hibernate_credits: Money,
    /// Total `credit-stop` amounts.
    pub stop_credits: Money,
    /// Idle-policy actions executed in the period.
    pub idle_actions: u32,
    /// Hours the account's resources spent hibernated or stopped in the period.
    pub hours_not_running: f64,
    /// What those hours would have cost at full rate.
    pub avoided_cost: Money,
    /// `avoided_cost` extrapolated over the whole period.
    pub projected_monthly_savings: Money,
}

/// What the idle detection pipeline currently knows about a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleReport {
    /// The resource.
    pub resource_id: ResourceId,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Agent reachability.
    pub agent_status: AgentStatus,
    /// Last accepted heartbeat.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Score of the last accepted heartbeat.
    pub idle_score: Option<f64>,
    /// Seconds of continuous idleness.
    pub idle_for_secs: u64,
    /// Pending idle action, if one is scheduled.
    pub pending: Option<PendingIdle>,
    /// Effective policy name.
    pub policy: String,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Resources checked.
    pub checked: usize,
    /// Resources found in sync or inside the grace window.
    pub in_sync: usize,
    /// Resources whose local record was corrected.
    pub corrected: usize,
    /// Resources marked failed because the provider could not be queried.
    pub failed: usize,
    /// Conflicts escalated to operators.
    pub escalated: usize,
}

/// Resources and accounts that need an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorFlags {
    /// Resources in `Failed`.
    pub failed: Vec<ManagedResource>,
    /// Resources whose agent has been unreachable past the escalation threshold.
    pub escalated_agents: Vec<ManagedResource>,
    /// Resources waiting for a ledger post to be retried.
    pub needs_reconciliation: Vec<ManagedResource>,
    /// Unresolved drift conflicts.
    pub drift_conflicts: Vec<ReconciliationRecord>,
    /// Frozen accounts with the reason.
    pub frozen_accounts: Vec<(AccountId, String)>,
}

// =============================================================================
// Requests
// =============================================================================

/// Request to create a budget account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    /// Identifier from the identity subsystem; generated when absent.
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// Parent account; `None` for a root.
    #[serde(default)]
    pub parent_id: Option<AccountId>,
    /// Name.
    pub name: String,
    /// Monthly limit.
    pub monthly_limit: Money,
    /// Rollover cap.
    #[serde(default)]
    pub rollover_cap: Money,
    /// Hard cap flag.
    #[serde(default)]
    pub hard_cap: bool,
    /// Role quota.
    #[serde(default)]
    pub role_quota: RoleQuota,
    /// Alert thresholds in (0, 1].
    #[serde(default)]
    pub alert_thresholds: Vec<f64>,
    /// Auto-actions.
    #[serde(default)]
    pub auto_actions: Vec<AutoAction>,
}

/// Administrative request to force a resource into a state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceRequest {
    /// State to force.
    pub target: LifecycleState,
    /// Record the state without calling the provider.
    #[serde(default)]
    pub skip_provider: bool,
    /// Why; kept in the audit log.
    pub reason: String,
}

/// An approver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
    /// Approve the launch.
    Approve,
    /// Deny it.
    Deny,
}

/// An approver's decision on a pending request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Approve or deny.
    pub verdict: ApprovalVerdict,
    /// Note kept with the decision.
    #[serde(default)]
    pub note: Option<String>,
    /// Lifetime granted to the launched resource, in minutes.
    #[serde(default)]
    pub time_limit_minutes: Option<u32>,
    /// What happens when the lifetime runs out.
    #[serde(default)]
    pub revert_action: RevertAction,
}

/// A budget auto-action that fired and must be carried out on resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggeredAction {
    /// Account whose threshold was crossed.
    pub account_id: AccountId,
    /// What to do to its billing resources.
    pub action: prism_store::BudgetActionKind,
}

/// Filter for resource listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceFilter {
    /// Only resources in this state.
    #[serde(default)]
    pub state: Option<LifecycleState>,
    /// Only resources charged to this account.
    #[serde(default)]
    pub account_id: Option<AccountId>,
}

impl ResourceFilter {
    /// Whether a resource passes the filter.
    #[must_use]
    pub fn matches(&self, resource: &ManagedResource) -> bool {
        self.state.is_none_or(|s| s == resource.state)
            && self.account_id.is_none_or(|a| a == resource.account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_denial_lists_allowed_classes() {
        let denial = BudgetDenial {
            account_id: AccountId::generate(),
            limit: QuotaLimit::InstanceClass {
                requested: "p3.2xlarge".into(),
                allowed: vec!["t3.*".into()],
            },
            hard_cap: true,
            remaining: Money::from_dollars(50.0),
            requested: Money::from_dollars(1.03),
            remediation: "choose an allowed class".into(),
        };
        assert!(denial.summary().contains("t3.*"));
        assert!(denial.summary().contains("p3.2xlarge"));
    }

    #[test]
    fn quota_limit_json_is_tagged() {
        let limit = QuotaLimit::Concurrency { max: 2, current: 2 };
        let json = serde_json::to_value(&limit).unwrap();
        assert_eq!(json["limit"], "concurrency");
    }
}
