//! `RocksDB` storage layer for prism.
//!
//! This crate persists everything the daemon needs to rebuild its view of the
//! world after a restart: managed resources, idle policies, the budget account
//! tree, the cost event log, approvals and the audit journal.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `resources`: Managed resources, keyed by `resource_id`
//! - `resources_by_state` / `resources_by_account`: resource indexes
//! - `accounts` / `accounts_by_parent`: the budget tree
//! - `journal`: append-only cost, reconciliation and audit entries by sequence
//! - `cost_by_account`: cost events by `account_id || period || seq`
//! - `approvals` / `approvals_by_status`: approval requests
//! - `policies`: named idle policies
//! - `meta`: project default policies and the daemon checkpoint
//!
//! Ledger mutations go through [`Store::commit`], which writes resources,
//! accounts, cost events and audit entries in a single `WriteBatch`, so a
//! resource never lands in a new billing posture without its cost event.
//!
//! # Example
//!
//! ```no_run
//! use prism_store::{LifecycleState, RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/prism-db").unwrap();
//! let running = store.list_resources_by_state(LifecycleState::Running).unwrap();
//! println!("{} running resources", running.len());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    Actor, AgentStatus, ApprovalRequest, ApprovalStatus, AuditEntry, AutoAction, BillingWindow,
    BudgetAccount, BudgetActionKind, CostEvent, CostEventKind, DaemonCheckpoint, DeferredRequest,
    HibernationSchedule, IdleAction, IdlePolicy, IdleTracking, InFlight, JournalEntry, LaunchSpec,
    LedgerCommit, LedgerSnapshot, LifecycleState, ManagedResource, PendingIdle, PolicyOverride,
    ProviderState, ReconciliationRecord, RequestedAction, Resolution, ResourceKind, ResourceSpec,
    RevertAction, RoleQuota, ScheduleKind, ScheduledReversion, ScheduledSleep, WakeAction,
};

use prism_core::{AccountId, ApprovalId, BudgetPeriod, ProjectId, ResourceId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer so that the engine can be exercised
/// against any implementation; [`RocksStore`] is the production one.
pub trait Store: Send + Sync {
    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Insert or update a resource record, maintaining the state and account
    /// indexes.
    ///
    /// Use [`Store::commit`] instead whenever the update changes billing posture.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_resource(&self, resource: &ManagedResource) -> Result<()>;

    /// Get a resource by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_resource(&self, resource_id: &ResourceId) -> Result<Option<ManagedResource>>;

    /// List resources in a given lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_resources_by_state(&self, state: LifecycleState) -> Result<Vec<ManagedResource>>;

    /// List resources charged to an account (not its descendants).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_resources_by_account(&self, account_id: &AccountId) -> Result<Vec<ManagedResource>>;

    /// List every resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_all_resources(&self) -> Result<Vec<ManagedResource>>;

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Insert or update an account, maintaining the parent index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_account(&self, account: &BudgetAccount) -> Result<()>;

    /// Get an account by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(&self, account_id: &AccountId) -> Result<Option<BudgetAccount>>;

    /// List every account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_accounts(&self) -> Result<Vec<BudgetAccount>>;

    /// List direct children of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_child_accounts(&self, parent_id: &AccountId) -> Result<Vec<BudgetAccount>>;

    // =========================================================================
    // Ledger and Journal
    // =========================================================================

    /// Atomically write resources, accounts, cost events and audit entries.
    ///
    /// Cost events and audit entries receive consecutive journal sequence
    /// numbers; the events are returned with their `seq` filled in.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails; nothing is written.
    fn commit(&self, commit: LedgerCommit) -> Result<Vec<CostEvent>>;

    /// List an account's own cost events within a period, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_cost_events(&self, account_id: &AccountId, period: BudgetPeriod)
        -> Result<Vec<CostEvent>>;

    /// Append a journal entry outside of a ledger commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn append_journal(&self, entry: &JournalEntry) -> Result<u64>;

    /// Journal entries with a sequence number greater than `after`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn journal_since(&self, after: u64, limit: usize) -> Result<Vec<(u64, JournalEntry)>>;

    // =========================================================================
    // Approval Operations
    // =========================================================================

    /// Insert or update an approval request, maintaining the status index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_approval(&self, approval: &ApprovalRequest) -> Result<()>;

    /// Get an approval request by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_approval(&self, approval_id: &ApprovalId) -> Result<Option<ApprovalRequest>>;

    /// List approval requests with a given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_approvals_by_status(&self, status: ApprovalStatus) -> Result<Vec<ApprovalRequest>>;

    // =========================================================================
    // Policy and Meta Operations
    // =========================================================================

    /// Insert or replace a named idle policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_policy(&self, policy: &IdlePolicy) -> Result<()>;

    /// Get a named idle policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_policy(&self, name: &str) -> Result<Option<IdlePolicy>>;

    /// List every idle policy, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_policies(&self) -> Result<Vec<IdlePolicy>>;

    /// Set the default policy name for a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_project_policy(&self, project_id: &ProjectId, policy: &str) -> Result<()>;

    /// Get the default policy name for a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_project_policy(&self, project_id: &ProjectId) -> Result<Option<String>>;

    /// Read the daemon checkpoint (default when never written).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_checkpoint(&self) -> Result<DaemonCheckpoint>;

    /// Persist the daemon checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_checkpoint(&self, checkpoint: &DaemonCheckpoint) -> Result<()>;
}
