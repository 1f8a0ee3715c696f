//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Managed resources, keyed by `resource_id`.
    pub const RESOURCES: &str = "resources";

    /// Index: resources by lifecycle state, keyed by `state || resource_id`.
    pub const RESOURCES_BY_STATE: &str = "resources_by_state";

    /// Index: resources by account, keyed by `account_id || resource_id`.
    pub const RESOURCES_BY_ACCOUNT: &str = "resources_by_account";

    /// Budget accounts, keyed by `account_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Index: child accounts, keyed by `parent_id || account_id`.
    pub const ACCOUNTS_BY_PARENT: &str = "accounts_by_parent";

    /// Append-only journal of cost, reconciliation and audit entries, keyed by
    /// big-endian sequence number.
    pub const JOURNAL: &str = "journal";

    /// Index: cost events by account and period, keyed by
    /// `account_id || period || seq`, value is the full event.
    pub const COST_BY_ACCOUNT: &str = "cost_by_account";

    /// Approval requests, keyed by `approval_id`.
    pub const APPROVALS: &str = "approvals";

    /// Index: approvals by status, keyed by `status || approval_id`.
    pub const APPROVALS_BY_STATUS: &str = "approvals_by_status";

    /// Idle policies, keyed by policy name.
    pub const POLICIES: &str = "policies";

    /// Small named records: project default policies and the daemon checkpoint.
    pub const META: &str = "meta";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::RESOURCES,
        cf::RESOURCES_BY_STATE,
        cf::RESOURCES_BY_ACCOUNT,
        cf::ACCOUNTS,
        cf::ACCOUNTS_BY_PARENT,
        cf::JOURNAL,
        cf::COST_BY_ACCOUNT,
        cf::APPROVALS,
        cf::APPROVALS_BY_STATUS,
        cf::POLICIES,
        cf::META,
    ]
}
