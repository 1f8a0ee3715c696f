//! Domain types stored in the database.
//!
//! These types represent the persisted state of managed resources, idle
//! policies, budget accounts, cost events, approvals and the audit journal.

use chrono::{DateTime, Utc};
use prism_core::{
    AccountId, ApprovalId, BudgetPeriod, CostRate, Money, ProjectId, ResourceId, ScoringProfile,
    UserId,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Resources
// =============================================================================

/// A cloud compute or storage unit under lifecycle control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedResource {
    /// Unique identifier.
    pub resource_id: ResourceId,
    /// Identifier of the instance or volume at the cloud provider.
    pub provider_id: String,
    /// Human-readable name.
    pub name: String,
    /// Owning user.
    pub owner: UserId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Leaf budget account charged for this resource.
    pub account_id: AccountId,
    /// Class, kind and cost rate.
    pub spec: ResourceSpec,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Last stable state, restored by recovery out of `Failed` or `Unknown`.
    #[serde(default)]
    pub prior_stable_state: Option<LifecycleState>,
    /// Provider call currently outstanding for this resource.
    #[serde(default)]
    pub in_flight: Option<InFlight>,
    /// User request waiting for the in-flight call to finish.
    #[serde(default)]
    pub deferred: Option<DeferredRequest>,
    /// Name of the idle policy this resource follows.
    pub policy_ref: String,
    /// Per-resource adjustments on top of the named policy.
    #[serde(default)]
    pub policy_override: Option<PolicyOverride>,
    /// Highest accepted heartbeat sequence number.
    #[serde(default)]
    pub last_heartbeat_seq: Option<u64>,
    /// Wall-clock time of the last accepted heartbeat.
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Boot identifier reported by the agent with its last heartbeat.
    #[serde(default)]
    pub agent_boot_id: Option<u64>,
    /// Reachability classification of the idle agent.
    #[serde(default)]
    pub agent_status: AgentStatus,
    /// Idle debounce state.
    #[serde(default)]
    pub idle: IdleTracking,
    /// Open billing window while the resource is billed.
    #[serde(default)]
    pub billing: Option<BillingWindow>,
    /// Set when a transition could not post its ledger effect; the
    /// reconciler retries the post.
    #[serde(default)]
    pub needs_reconciliation: bool,
    /// Unresolved drift escalation, kept until the provider agrees again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<ReconciliationRecord>,
    /// Approval this resource was launched under, if any.
    #[serde(default)]
    pub approval_id: Option<ApprovalId>,
    /// Automatic reversion scheduled by a time-limited approval.
    #[serde(default)]
    pub revert: Option<ScheduledReversion>,
    /// Set while a hibernation schedule holds the resource asleep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<ScheduledSleep>,
    /// Last error message (set when entering `Failed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the last local transition was committed.
    pub last_transition_at: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ManagedResource {
    /// Whether the resource is currently accruing cost.
    #[must_use]
    pub const fn is_billing(&self) -> bool {
        self.billing.is_some()
    }
}

/// Resource specification supplied by the provisioning subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Compute instance or storage volume.
    pub kind: ResourceKind,
    /// Instance or volume class, e.g. `t3.medium`.
    pub instance_class: String,
    /// Billing rate while running.
    pub cost_rate: CostRate,
}

/// Kind of managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A compute instance.
    #[default]
    Compute,
    /// A storage volume.
    Volume,
}

/// Lifecycle states for a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    /// Launch accepted, waiting for the provider to report ready.
    Provisioning = 1,
    /// Running and billed.
    Running = 2,
    /// Idle policy fired; grace period running, still billed.
    PendingIdleAction = 3,
    /// Hibernate call issued.
    Hibernating = 4,
    /// Suspended with memory preserved; not billed.
    Hibernated = 5,
    /// Stop call issued.
    Stopping = 6,
    /// Stopped; not billed.
    Stopped = 7,
    /// Start or resume call issued.
    Resuming = 8,
    /// Terminate call issued.
    Terminating = 9,
    /// Gone for good.
    Terminated = 10,
    /// Provider failure after retries; needs operator or automated recovery.
    Failed = 11,
    /// Local belief suspended at daemon start until the provider is queried.
    Unknown = 12,
}

impl LifecycleState {
    /// Every state, in numeric order.
    pub const ALL: [Self; 12] = [
        Self::Provisioning,
        Self::Running,
        Self::PendingIdleAction,
        Self::Hibernating,
        Self::Hibernated,
        Self::Stopping,
        Self::Stopped,
        Self::Resuming,
        Self::Terminating,
        Self::Terminated,
        Self::Failed,
        Self::Unknown,
    ];

    /// Convert the state to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `LifecycleState`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Provisioning),
            2 => Some(Self::Running),
            3 => Some(Self::PendingIdleAction),
            4 => Some(Self::Hibernating),
            5 => Some(Self::Hibernated),
            6 => Some(Self::Stopping),
            7 => Some(Self::Stopped),
            8 => Some(Self::Resuming),
            9 => Some(Self::Terminating),
            10 => Some(Self::Terminated),
            11 => Some(Self::Failed),
            12 => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Reachability of the idle detection agent on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No heartbeat received yet.
    #[default]
    Unseen,
    /// Heartbeats arriving on schedule.
    Healthy,
    /// No heartbeat for more than the unreachable multiple of the interval.
    Unreachable,
    /// Unreachable for longer than the escalation threshold; operator-visible.
    Escalated,
}

/// A provider call that has been issued but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    /// State before the call.
    pub from: LifecycleState,
    /// State the call is driving towards.
    pub target: LifecycleState,
    /// Who asked for it.
    pub origin: Actor,
    /// When the call was issued.
    pub started_at: DateTime<Utc>,
}

/// A user request that arrived while a provider call was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRequest {
    /// Requested action.
    pub action: RequestedAction,
    /// Who asked for it.
    pub requested_by: Actor,
    /// When it was requested.
    pub requested_at: DateTime<Utc>,
}

/// An explicit lifecycle action requested through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedAction {
    /// Start a stopped resource.
    Start,
    /// Stop a running resource.
    Stop,
    /// Hibernate a running resource.
    Hibernate,
    /// Resume a hibernated resource.
    Resume,
    /// Terminate the resource.
    Terminate,
}

/// The party responsible for a transition or an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A user acting through the API.
    User(UserId),
    /// An operator using the administrative override API.
    Operator(String),
    /// The hibernation policy engine.
    Policy,
    /// The provider reconciler.
    Reconciler,
    /// A budget auto-action.
    Budget,
    /// A time-limited approval reverting its resource.
    Approval(ApprovalId),
    /// A hibernation schedule opening or closing its window.
    Schedule,
    /// Daemon housekeeping.
    System,
}

/// Debounce state for idle detection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IdleTracking {
    /// Start of the current uninterrupted idle stretch.
    pub idle_since: Option<DateTime<Utc>>,
    /// Length of that stretch as of the last accepted signal, in seconds.
    pub accumulator_secs: u64,
    /// Score computed for the last accepted signal.
    pub last_score: Option<f64>,
    /// Pending idle action, while in `PendingIdleAction`.
    pub pending: Option<PendingIdle>,
}

impl IdleTracking {
    /// Forget all idle history.
    pub fn reset(&mut self) {
        self.idle_since = None;
        self.accumulator_secs = 0;
        self.pending = None;
    }
}

/// A warned, not yet executed, idle action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIdle {
    /// When the warning was raised.
    pub entered_at: DateTime<Utc>,
    /// When the grace period ends.
    pub deadline: DateTime<Utc>,
    /// Action to take at the deadline.
    pub action: IdleAction,
}

/// The portion of the running baseline that has already been debited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingWindow {
    /// When billing started.
    pub opened_at: DateTime<Utc>,
    /// Debits cover running time up to this instant.
    pub billed_through: DateTime<Utc>,
}

/// Automatic stop or terminate at the end of a time-limited approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledReversion {
    /// When to revert.
    pub at: DateTime<Utc>,
    /// What to do.
    pub action: RevertAction,
}

/// Reversion action for a time-limited approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RevertAction {
    /// Stop the resource.
    #[default]
    Stop,
    /// Terminate the resource.
    Terminate,
}

// =============================================================================
// Idle policies
// =============================================================================

/// Action an idle policy takes once the grace period runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleAction {
    /// Hibernate, preserving memory.
    Hibernate,
    /// Stop.
    Stop,
    /// Only emit a notification.
    Notify,
}

/// A named idle policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdlePolicy {
    /// Unique policy name.
    pub name: String,
    /// Short description for operators.
    #[serde(default)]
    pub description: String,
    /// Minutes the score must stay below the threshold continuously.
    pub idle_threshold_minutes: u32,
    /// Minutes between the warning and the action.
    pub grace_period_minutes: u32,
    /// What to do once the grace period runs out.
    pub action: IdleAction,
    /// Scores strictly below this count as idle.
    pub idle_score_threshold: f64,
    /// Weights and saturation points for scoring.
    #[serde(default)]
    pub scoring: ScoringProfile,
    /// Recurring windows during which resources sleep regardless of load.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<HibernationSchedule>,
}

/// Shape of a schedule's sleep window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// From `start` to `end` every day.
    Daily,
    /// From `start` to `end` on the listed days.
    Weekly,
    /// Outside `start`..`end` on the listed days, and all day on the rest.
    WorkHours,
}

/// What happens when a schedule window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeAction {
    /// Bring the resource back to `Running`.
    #[default]
    Resume,
    /// Leave it asleep until someone starts it.
    None,
}

/// A recurring sleep window attached to an idle policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HibernationSchedule {
    /// Name, unique within the policy.
    pub name: String,
    /// Window shape.
    pub kind: ScheduleKind,
    /// Window start as `HH:MM`, local to `utc_offset_minutes`.
    pub start: String,
    /// Window end as `HH:MM`; before `start` means the window spans midnight.
    pub end: String,
    /// Days the window applies to. Empty means Monday to Friday for work
    /// hours and every day otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<chrono::Weekday>,
    /// Offset of the schedule's local time from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// `hibernate` or `stop`.
    pub action: IdleAction,
    /// What to do when the window closes.
    #[serde(default)]
    pub wake: WakeAction,
}

/// A resource put to sleep by a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSleep {
    /// Schedule that opened the window.
    pub schedule: String,
    /// Wake behaviour captured when the window opened.
    pub wake: WakeAction,
    /// When the sleep was requested.
    pub since: DateTime<Utc>,
    /// Someone started the resource inside the window; it is not put back
    /// to sleep or woken by this window again.
    #[serde(default)]
    pub overridden: bool,
}

/// Per-resource adjustments to a named policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Replacement idle threshold.
    #[serde(default)]
    pub idle_threshold_minutes: Option<u32>,
    /// Replacement grace period.
    #[serde(default)]
    pub grace_period_minutes: Option<u32>,
    /// Replacement action.
    #[serde(default)]
    pub action: Option<IdleAction>,
    /// Replacement score threshold.
    #[serde(default)]
    pub idle_score_threshold: Option<f64>,
    /// Turn idle handling off for this resource.
    #[serde(default)]
    pub disabled: bool,
}

// =============================================================================
// Budget ledger
// =============================================================================

/// A node in the hierarchical budget tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAccount {
    /// Unique identifier.
    pub account_id: AccountId,
    /// Parent account; `None` for roots.
    pub parent_id: Option<AccountId>,
    /// Human-readable name.
    pub name: String,
    /// Spend allowed per period.
    pub monthly_limit: Money,
    /// Most unused budget carried into the next period.
    pub rollover_cap: Money,
    /// Deny over-quota launches instead of routing them to approval.
    pub hard_cap: bool,
    /// Role restrictions.
    #[serde(default)]
    pub role_quota: RoleQuota,
    /// Spend fractions (0, 1] that raise a notification once per period.
    #[serde(default)]
    pub alert_thresholds: Vec<f64>,
    /// Actions executed when spend crosses a threshold.
    #[serde(default)]
    pub auto_actions: Vec<AutoAction>,
    /// Ledger-maintained state, written atomically with cost events.
    pub ledger: LedgerSnapshot,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Quota restrictions attached to an account's role.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleQuota {
    /// Allowed instance class patterns (`t3.*`, `m5.large`); empty allows all.
    #[serde(default)]
    pub allowed_classes: Vec<String>,
    /// Most resources billing at once.
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    /// Most spend within one UTC day.
    #[serde(default)]
    pub daily_cap: Option<Money>,
}

/// Threshold-triggered account-wide action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoAction {
    /// Spend fraction (0, 1] that triggers the action.
    pub threshold: f64,
    /// What to do.
    pub action: BudgetActionKind,
}

/// Account-wide budget action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetActionKind {
    /// Hibernate every billing resource in the subtree.
    HibernateAll,
    /// Stop every billing resource in the subtree.
    StopAll,
    /// Refuse new launches until the next period.
    PreventLaunch,
}

/// Per-account ledger state kept beside the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Period the snapshot describes.
    pub period: BudgetPeriod,
    /// Sum of this account's own events in `period`.
    pub current_spend: Money,
    /// Sum of credit events (as a positive amount) in `period`.
    pub banked_headroom: Money,
    /// Alert thresholds already fired in `period`, in basis points.
    #[serde(default)]
    pub fired_alerts: Vec<u32>,
    /// Auto-action thresholds already fired in `period`, in basis points.
    #[serde(default)]
    pub fired_actions: Vec<u32>,
    /// New launches blocked by a `prevent_launch` auto-action.
    #[serde(default)]
    pub launch_blocked: bool,
    /// Set when the snapshot disagreed with the log; blocks mutation.
    #[serde(default)]
    pub frozen: Option<String>,
}

impl LedgerSnapshot {
    /// A fresh snapshot for `period`.
    #[must_use]
    pub const fn new(period: BudgetPeriod) -> Self {
        Self {
            period,
            current_spend: Money::ZERO,
            banked_headroom: Money::ZERO,
            fired_alerts: Vec::new(),
            fired_actions: Vec::new(),
            launch_blocked: false,
            frozen: None,
        }
    }
}

/// Kinds of ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CostEventKind {
    /// Running time debited in advance, one billing block at a time.
    DebitRunning,
    /// Unused running baseline returned on hibernate.
    CreditHibernate,
    /// Unused running baseline returned on stop or terminate.
    CreditStop,
    /// Unused budget carried over from the previous period.
    Rollover,
    /// Adjustment recorded when an approval takes effect.
    ApprovalAdjustment,
}

impl CostEventKind {
    /// Whether this kind returns money to the account.
    #[must_use]
    pub const fn is_credit(self) -> bool {
        matches!(self, Self::CreditHibernate | Self::CreditStop)
    }
}

/// One entry in the append-only cost log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEvent {
    /// Journal sequence number, assigned on commit.
    pub seq: u64,
    /// Resource the event is about; `None` for rollovers.
    pub resource_id: Option<ResourceId>,
    /// Account charged or credited.
    pub account_id: AccountId,
    /// Entry kind.
    pub kind: CostEventKind,
    /// Signed amount; credits are negative.
    pub amount: Money,
    /// Budget period the event counts towards.
    pub period: BudgetPeriod,
    /// When the event was generated.
    pub timestamp: DateTime<Utc>,
    /// Free-form context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Everything that must land in one atomic write.
#[derive(Debug, Clone, Default)]
pub struct LedgerCommit {
    /// Resources to write.
    pub resources: Vec<ManagedResource>,
    /// Accounts to write (usually with refreshed snapshots).
    pub accounts: Vec<BudgetAccount>,
    /// Cost events to append; their `seq` is assigned by the store.
    pub events: Vec<CostEvent>,
    /// Audit entries to append.
    pub audit: Vec<AuditEntry>,
    /// Approval requests to write.
    pub approvals: Vec<ApprovalRequest>,
}

// =============================================================================
// Approvals
// =============================================================================

/// Decision status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ApprovalStatus {
    /// Waiting for a decision.
    Pending = 1,
    /// Approved.
    Approved = 2,
    /// Denied by an approver.
    Denied = 3,
    /// Auto-denied after timing out.
    Expired = 4,
}

impl ApprovalStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a decision has been reached.
    #[must_use]
    pub const fn is_decided(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Everything needed to create a resource once a launch is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Provider-side identifier of the provisioned instance or volume.
    pub provider_id: String,
    /// Human-readable name.
    pub name: String,
    /// Owning user.
    pub owner: UserId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Leaf account to charge.
    pub account_id: AccountId,
    /// Class, kind and cost rate.
    pub spec: ResourceSpec,
    /// Idle policy name; the project default applies when absent.
    #[serde(default)]
    pub policy_ref: Option<String>,
    /// Per-resource policy adjustments.
    #[serde(default)]
    pub policy_override: Option<PolicyOverride>,
}

/// An over-quota launch routed to an approver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique identifier.
    pub approval_id: ApprovalId,
    /// User who asked.
    pub requester: UserId,
    /// Account the launch would be charged to.
    pub account_id: AccountId,
    /// The launch that was gated.
    pub requested: LaunchSpec,
    /// Which limit the launch exceeded.
    pub reason: String,
    /// Decision status.
    pub status: ApprovalStatus,
    /// Optional lifetime of the launched resource, in minutes.
    #[serde(default)]
    pub time_limit_minutes: Option<u32>,
    /// What happens when the time limit runs out.
    #[serde(default)]
    pub revert_action: RevertAction,
    /// Who decided.
    #[serde(default)]
    pub approver: Option<UserId>,
    /// When it was decided.
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    /// Approver's note.
    #[serde(default)]
    pub decision_note: Option<String>,
    /// Resource launched after approval.
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Auto-deny deadline.
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// Reconciliation and audit journal
// =============================================================================

/// Instance or volume state as reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    /// Booting.
    Pending,
    /// Running.
    Running,
    /// Shutting down towards stopped.
    Stopping,
    /// Stopped.
    Stopped,
    /// Saving memory towards hibernated.
    Hibernating,
    /// Hibernated.
    Hibernated,
    /// Being terminated.
    ShuttingDown,
    /// Terminated.
    Terminated,
    /// The provider has no record of the id.
    NotFound,
}

/// How a reconciliation check was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    /// Local and provider state agree.
    InSync,
    /// Local state replaced with the provider's.
    AdoptedProviderState {
        /// New local state.
        to: LifecycleState,
    },
    /// Drift ignored because a local transition is still inside the grace window.
    WithinGraceWindow,
    /// A still-running resource had its accrual brought up to date.
    BackfilledAccrual {
        /// Amount debited.
        amount: Money,
    },
    /// A previously failed ledger post was retried successfully.
    LedgerPostRetried,
    /// Describe failed after retries; resource marked `Failed`.
    MarkedFailed {
        /// Provider error.
        error: String,
    },
    /// Ambiguous state escalated to an operator.
    Escalated {
        /// Why.
        reason: String,
    },
}

/// One reconciliation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    /// Resource checked.
    pub resource_id: ResourceId,
    /// Local state when the check started.
    pub local_state_at_check: LifecycleState,
    /// What the provider said, if it answered.
    pub provider_state_observed: Option<ProviderState>,
    /// When drift was detected, if any.
    pub drift_detected_at: Option<DateTime<Utc>>,
    /// What was done about it.
    pub resolution_applied: Resolution,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    /// Whether the check changed anything worth auditing.
    #[must_use]
    pub const fn is_correction(&self) -> bool {
        !matches!(
            self.resolution_applied,
            Resolution::InSync | Resolution::WithinGraceWindow
        )
    }
}

/// An audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Who did it.
    pub actor: Actor,
    /// Resource involved.
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
    /// Account involved.
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// Short machine-readable action name, e.g. `force_transition`.
    pub action: String,
    /// Human-readable detail.
    pub detail: String,
}

/// An entry of the append-only journal exposed to audit consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    /// A cost event.
    Cost(CostEvent),
    /// A reconciliation record.
    Reconciliation(ReconciliationRecord),
    /// An audited action.
    Audit(AuditEntry),
}

/// Daemon housekeeping persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaemonCheckpoint {
    /// Last time the accrual task ran to completion.
    pub last_accrual_at: Option<DateTime<Utc>>,
    /// Last period whose rollover has been posted.
    pub last_rollover_period: Option<BudgetPeriod>,
}
