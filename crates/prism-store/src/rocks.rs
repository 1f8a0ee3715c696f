//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::{AccountId, ApprovalId, BudgetPeriod, ProjectId, ResourceId};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    ApprovalRequest, ApprovalStatus, BudgetAccount, CostEvent, DaemonCheckpoint, IdlePolicy,
    JournalEntry, LedgerCommit, LifecycleState, ManagedResource,
};
use crate::Store;

type KvPairs = Vec<(Box<[u8]>, Box<[u8]>)>;

/// RocksDB-backed storage implementation.
///
/// Writes are funnelled through one lock that also owns the next journal
/// sequence number, so index maintenance never races and journal order
/// matches commit order.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    next_seq: Mutex<u64>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let store = Self {
            db: Arc::new(db),
            next_seq: Mutex::new(1),
        };
        let last = store.last_journal_seq()?;
        *store.next_seq.lock() = last + 1;
        tracing::debug!(next_seq = last + 1, "Opened store");
        Ok(store)
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collect every key/value pair whose key starts with `prefix`.
    fn scan_prefix(&self, name: &str, prefix: &[u8]) -> Result<KvPairs> {
        let cf = self.cf(name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn scan_values<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let cf = self.cf(name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            out.push(Self::deserialize(&value)?);
        }
        Ok(out)
    }

    fn last_journal_seq(&self) -> Result<u64> {
        let cf = self.cf(cf::JOURNAL)?;
        match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
                keys::seq_from_journal_key(&key)
            }
            None => Ok(0),
        }
    }

    fn resources_from_index(&self, name: &'static str, prefix: &[u8]) -> Result<Vec<ManagedResource>> {
        let mut resources = Vec::new();
        for (key, _) in self.scan_prefix(name, prefix)? {
            let resource_id = keys::resource_id_suffix(name, &key)?;
            if let Some(resource) = self.get_resource(&resource_id)? {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    /// Add a resource write, with index maintenance, to `batch`.
    fn stage_resource(&self, batch: &mut WriteBatch, resource: &ManagedResource) -> Result<()> {
        let cf_resources = self.cf(cf::RESOURCES)?;
        let cf_by_state = self.cf(cf::RESOURCES_BY_STATE)?;
        let cf_by_account = self.cf(cf::RESOURCES_BY_ACCOUNT)?;

        let key = keys::resource_key(&resource.resource_id);
        let previous: Option<ManagedResource> = self.get_value(cf::RESOURCES, &key)?;

        if let Some(old) = previous {
            if old.state != resource.state {
                batch.delete_cf(
                    &cf_by_state,
                    keys::state_resource_key(old.state.as_u8(), &resource.resource_id),
                );
            }
            if old.account_id != resource.account_id {
                batch.delete_cf(
                    &cf_by_account,
                    keys::account_resource_key(&old.account_id, &resource.resource_id),
                );
            }
        }

        batch.put_cf(&cf_resources, &key, Self::serialize(resource)?);
        batch.put_cf(
            &cf_by_state,
            keys::state_resource_key(resource.state.as_u8(), &resource.resource_id),
            [],
        );
        batch.put_cf(
            &cf_by_account,
            keys::account_resource_key(&resource.account_id, &resource.resource_id),
            [],
        );
        Ok(())
    }

    /// Add an account write, with parent index maintenance, to `batch`.
    fn stage_account(&self, batch: &mut WriteBatch, account: &BudgetAccount) -> Result<()> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_by_parent = self.cf(cf::ACCOUNTS_BY_PARENT)?;

        batch.put_cf(
            &cf_accounts,
            keys::account_key(&account.account_id),
            Self::serialize(account)?,
        );
        if let Some(parent) = &account.parent_id {
            batch.put_cf(
                &cf_by_parent,
                keys::parent_child_key(parent, &account.account_id),
                [],
            );
        }
        Ok(())
    }

    /// Add an approval write, with status index maintenance, to `batch`.
    fn stage_approval(&self, batch: &mut WriteBatch, approval: &ApprovalRequest) -> Result<()> {
        let cf_approvals = self.cf(cf::APPROVALS)?;
        let cf_by_status = self.cf(cf::APPROVALS_BY_STATUS)?;

        let key = keys::approval_key(&approval.approval_id);
        let old_status = self
            .get_value::<ApprovalRequest>(cf::APPROVALS, &key)?
            .map(|a| a.status);

        batch.put_cf(&cf_approvals, &key, Self::serialize(approval)?);
        if let Some(old) = old_status {
            if old != approval.status {
                batch.delete_cf(
                    &cf_by_status,
                    keys::status_approval_key(old.as_u8(), &approval.approval_id),
                );
            }
        }
        batch.put_cf(
            &cf_by_status,
            keys::status_approval_key(approval.status.as_u8(), &approval.approval_id),
            [],
        );
        Ok(())
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Resource Operations
    // =========================================================================

    fn put_resource(&self, resource: &ManagedResource) -> Result<()> {
        let _guard = self.next_seq.lock();
        let mut batch = WriteBatch::default();
        self.stage_resource(&mut batch, resource)?;
        self.write(batch)
    }

    fn get_resource(&self, resource_id: &ResourceId) -> Result<Option<ManagedResource>> {
        self.get_value(cf::RESOURCES, &keys::resource_key(resource_id))
    }

    fn list_resources_by_state(&self, state: LifecycleState) -> Result<Vec<ManagedResource>> {
        self.resources_from_index(cf::RESOURCES_BY_STATE, &[state.as_u8()])
    }

    fn list_resources_by_account(&self, account_id: &AccountId) -> Result<Vec<ManagedResource>> {
        self.resources_from_index(cf::RESOURCES_BY_ACCOUNT, &keys::account_key(account_id))
    }

    fn list_all_resources(&self) -> Result<Vec<ManagedResource>> {
        self.scan_values(cf::RESOURCES)
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    fn put_account(&self, account: &BudgetAccount) -> Result<()> {
        let _guard = self.next_seq.lock();
        let mut batch = WriteBatch::default();
        self.stage_account(&mut batch, account)?;
        self.write(batch)
    }

    fn get_account(&self, account_id: &AccountId) -> Result<Option<BudgetAccount>> {
        self.get_value(cf::ACCOUNTS, &keys::account_key(account_id))
    }

    fn list_accounts(&self) -> Result<Vec<BudgetAccount>> {
        self.scan_values(cf::ACCOUNTS)
    }

    fn list_child_accounts(&self, parent_id: &AccountId) -> Result<Vec<BudgetAccount>> {
        let mut children = Vec::new();
        for (key, _) in self.scan_prefix(cf::ACCOUNTS_BY_PARENT, &keys::account_key(parent_id))? {
            let child_id = keys::child_from_parent_key(&key)?;
            if let Some(child) = self.get_account(&child_id)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    // =========================================================================
    // Ledger and Journal
    // =========================================================================

    fn commit(&self, commit: LedgerCommit) -> Result<Vec<CostEvent>> {
        let cf_journal = self.cf(cf::JOURNAL)?;
        let cf_cost = self.cf(cf::COST_BY_ACCOUNT)?;

        let mut next_seq = self.next_seq.lock();
        let mut seq = *next_seq;
        let mut batch = WriteBatch::default();

        for resource in &commit.resources {
            self.stage_resource(&mut batch, resource)?;
        }
        for account in &commit.accounts {
            self.stage_account(&mut batch, account)?;
        }
        for approval in &commit.approvals {
            self.stage_approval(&mut batch, approval)?;
        }

        let mut stored = Vec::with_capacity(commit.events.len());
        for mut event in commit.events {
            event.seq = seq;
            let value = Self::serialize(&event)?;
            batch.put_cf(
                &cf_cost,
                keys::cost_key(&event.account_id, event.period, seq),
                &value,
            );
            batch.put_cf(
                &cf_journal,
                keys::journal_key(seq),
                Self::serialize(&JournalEntry::Cost(event.clone()))?,
            );
            stored.push(event);
            seq += 1;
        }
        for entry in commit.audit {
            batch.put_cf(
                &cf_journal,
                keys::journal_key(seq),
                Self::serialize(&JournalEntry::Audit(entry))?,
            );
            seq += 1;
        }

        self.write(batch)?;
        *next_seq = seq;
        Ok(stored)
    }

    fn list_cost_events(
        &self,
        account_id: &AccountId,
        period: BudgetPeriod,
    ) -> Result<Vec<CostEvent>> {
        self.scan_prefix(cf::COST_BY_ACCOUNT, &keys::account_period_prefix(account_id, period))?
            .into_iter()
            .map(|(_, value)| Self::deserialize(&value))
            .collect()
    }

    fn append_journal(&self, entry: &JournalEntry) -> Result<u64> {
        let cf_journal = self.cf(cf::JOURNAL)?;
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        self.db
            .put_cf(&cf_journal, keys::journal_key(seq), Self::serialize(entry)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        *next_seq = seq + 1;
        Ok(seq)
    }

    fn journal_since(&self, after: u64, limit: usize) -> Result<Vec<(u64, JournalEntry)>> {
        let cf = self.cf(cf::JOURNAL)?;
        let start = keys::journal_key(after.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut out = Vec::new();
        for item in iter.take(limit) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            out.push((keys::seq_from_journal_key(&key)?, Self::deserialize(&value)?));
        }
        Ok(out)
    }

    // =========================================================================
    // Approval Operations
    // =========================================================================

    fn put_approval(&self, approval: &ApprovalRequest) -> Result<()> {
        let _guard = self.next_seq.lock();
        let mut batch = WriteBatch::default();
        self.stage_approval(&mut batch, approval)?;
        self.write(batch)
    }

    fn get_approval(&self, approval_id: &ApprovalId) -> Result<Option<ApprovalRequest>> {
        self.get_value(cf::APPROVALS, &keys::approval_key(approval_id))
    }

    fn list_approvals_by_status(&self, status: ApprovalStatus) -> Result<Vec<ApprovalRequest>> {
        let mut approvals = Vec::new();
        for (key, _) in self.scan_prefix(cf::APPROVALS_BY_STATUS, &[status.as_u8()])? {
            let approval_id = keys::approval_from_status_key(&key)?;
            if let Some(approval) = self.get_approval(&approval_id)? {
                approvals.push(approval);
            }
        }
        Ok(approvals)
    }

    // =========================================================================
    // Policy and Meta Operations
    // =========================================================================

    fn put_policy(&self, policy: &IdlePolicy) -> Result<()> {
        let cf = self.cf(cf::POLICIES)?;
        self.db
            .put_cf(&cf, keys::policy_key(&policy.name), Self::serialize(policy)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_policy(&self, name: &str) -> Result<Option<IdlePolicy>> {
        self.get_value(cf::POLICIES, &keys::policy_key(name))
    }

    fn list_policies(&self) -> Result<Vec<IdlePolicy>> {
        self.scan_values(cf::POLICIES)
    }

    fn put_project_policy(&self, project_id: &ProjectId, policy: &str) -> Result<()> {
        let cf = self.cf(cf::META)?;
        self.db
            .put_cf(
                &cf,
                keys::project_policy_key(project_id),
                Self::serialize(&policy)?,
            )
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_project_policy(&self, project_id: &ProjectId) -> Result<Option<String>> {
        self.get_value(cf::META, &keys::project_policy_key(project_id))
    }

    fn get_checkpoint(&self) -> Result<DaemonCheckpoint> {
        Ok(self
            .get_value(cf::META, keys::CHECKPOINT_KEY)?
            .unwrap_or_default())
    }

    fn put_checkpoint(&self, checkpoint: &DaemonCheckpoint) -> Result<()> {
        let cf = self.cf(cf::META)?;
        self.db
            .put_cf(&cf, keys::CHECKPOINT_KEY, Self::serialize(checkpoint)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Actor, AuditEntry, CostEventKind, IdleAction, LaunchSpec, LedgerSnapshot, ResourceKind,
        ResourceSpec, RevertAction, RoleQuota,
    };
    use chrono::Utc;
    use prism_core::{CostRate, Money, UserId};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn create_test_resource(account_id: AccountId, name: &str) -> ManagedResource {
        let project_id = ProjectId::from_uuid(uuid::Uuid::nil());
        let now = Utc::now();
        ManagedResource {
            resource_id: ResourceId::generate_deterministic(&project_id, name, 42),
            provider_id: format!("i-{name}"),
            name: name.to_string(),
            owner: UserId::generate(),
            project_id,
            account_id,
            spec: ResourceSpec {
                kind: ResourceKind::Compute,
                instance_class: "t3.medium".into(),
                cost_rate: CostRate::per_hour(Money::from_dollars(0.10)),
            },
            state: LifecycleState::Running,
            prior_stable_state: None,
            in_flight: None,
            deferred: None,
            policy_ref: "standard".into(),
            policy_override: None,
            last_heartbeat_seq: None,
            last_heartbeat_at: None,
            agent_boot_id: None,
            agent_status: crate::types::AgentStatus::Unseen,
            idle: crate::types::IdleTracking::default(),
            billing: None,
            needs_reconciliation: false,
            drift: None,
            approval_id: None,
            revert: None,
            scheduled: None,
            error_message: None,
            last_transition_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn create_test_account(parent_id: Option<AccountId>) -> BudgetAccount {
        let now = Utc::now();
        BudgetAccount {
            account_id: AccountId::generate(),
            parent_id,
            name: "lab".into(),
            monthly_limit: Money::from_dollars(500.0),
            rollover_cap: Money::from_dollars(50.0),
            hard_cap: false,
            role_quota: RoleQuota::default(),
            alert_thresholds: vec![0.5, 0.9],
            auto_actions: Vec::new(),
            ledger: LedgerSnapshot::new(BudgetPeriod::containing(now)),
            created_at: now,
            updated_at: now,
        }
    }

    fn cost_event(account_id: AccountId, amount: Money) -> CostEvent {
        let now = Utc::now();
        CostEvent {
            seq: 0,
            resource_id: None,
            account_id,
            kind: CostEventKind::DebitRunning,
            amount,
            period: BudgetPeriod::containing(now),
            timestamp: now,
            note: None,
        }
    }

    #[test]
    fn resource_crud_and_state_index() {
        let (store, _dir) = create_test_store();
        let account = AccountId::generate();
        let mut resource = create_test_resource(account, "ws-1");

        store.put_resource(&resource).unwrap();
        let loaded = store.get_resource(&resource.resource_id).unwrap().unwrap();
        assert_eq!(loaded.name, "ws-1");
        assert_eq!(
            store
                .list_resources_by_state(LifecycleState::Running)
                .unwrap()
                .len(),
            1
        );

        resource.state = LifecycleState::Hibernated;
        store.put_resource(&resource).unwrap();
        assert!(store
            .list_resources_by_state(LifecycleState::Running)
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_resources_by_state(LifecycleState::Hibernated)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn resources_by_account() {
        let (store, _dir) = create_test_store();
        let a = AccountId::generate();
        let b = AccountId::generate();

        store.put_resource(&create_test_resource(a, "one")).unwrap();
        store.put_resource(&create_test_resource(a, "two")).unwrap();
        store.put_resource(&create_test_resource(b, "three")).unwrap();

        assert_eq!(store.list_resources_by_account(&a).unwrap().len(), 2);
        assert_eq!(store.list_resources_by_account(&b).unwrap().len(), 1);
        assert_eq!(store.list_all_resources().unwrap().len(), 3);
    }

    #[test]
    fn account_tree_children() {
        let (store, _dir) = create_test_store();
        let root = create_test_account(None);
        let child_a = create_test_account(Some(root.account_id));
        let child_b = create_test_account(Some(root.account_id));
        store.put_account(&root).unwrap();
        store.put_account(&child_a).unwrap();
        store.put_account(&child_b).unwrap();

        let children = store.list_child_accounts(&root.account_id).unwrap();
        assert_eq!(children.len(), 2);
        assert!(store
            .list_child_accounts(&child_a.account_id)
            .unwrap()
            .is_empty());
        assert_eq!(store.list_accounts().unwrap().len(), 3);
    }

    #[test]
    fn commit_assigns_sequences_and_indexes_by_period() {
        let (store, _dir) = create_test_store();
        let mut account = create_test_account(None);
        let resource = create_test_resource(account.account_id, "ws");
        account.ledger.current_spend = Money::from_dollars(0.3);

        let stored = store
            .commit(LedgerCommit {
                resources: vec![resource.clone()],
                accounts: vec![account.clone()],
                events: vec![
                    cost_event(account.account_id, Money::from_dollars(0.1)),
                    cost_event(account.account_id, Money::from_dollars(0.2)),
                ],
                audit: vec![AuditEntry {
                    at: Utc::now(),
                    actor: Actor::System,
                    resource_id: Some(resource.resource_id),
                    account_id: None,
                    action: "test".into(),
                    detail: "commit".into(),
                }],
                ..LedgerCommit::default()
            })
            .unwrap();

        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].seq + 1, stored[1].seq);

        let period = stored[0].period;
        let events = store.list_cost_events(&account.account_id, period).unwrap();
        let total: Money = events.iter().map(|e| e.amount).sum();
        assert_eq!(total, Money::from_dollars(0.3));
        assert!(store
            .list_cost_events(&account.account_id, period.next())
            .unwrap()
            .is_empty());

        let journal = store.journal_since(0, 10).unwrap();
        assert_eq!(journal.len(), 3);
        assert!(matches!(journal[2].1, JournalEntry::Audit(_)));
        assert!(store.get_resource(&resource.resource_id).unwrap().is_some());
    }

    #[test]
    fn journal_sequence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let account = AccountId::generate();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store
                .commit(LedgerCommit {
                    events: vec![cost_event(account, Money::from_cents(5))],
                    ..LedgerCommit::default()
                })
                .unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        let stored = store
            .commit(LedgerCommit {
                events: vec![cost_event(account, Money::from_cents(7))],
                ..LedgerCommit::default()
            })
            .unwrap();
        assert_eq!(stored[0].seq, 2);
        assert_eq!(store.journal_since(1, 10).unwrap().len(), 1);
    }

    #[test]
    fn approval_status_index_moves() {
        let (store, _dir) = create_test_store();
        let now = Utc::now();
        let account = AccountId::generate();
        let resource = create_test_resource(account, "big");
        let mut approval = ApprovalRequest {
            approval_id: ApprovalId::generate(),
            requester: resource.owner,
            account_id: account,
            requested: LaunchSpec {
                provider_id: resource.provider_id.clone(),
                name: resource.name.clone(),
                owner: resource.owner,
                project_id: resource.project_id,
                account_id: account,
                spec: resource.spec.clone(),
                policy_ref: None,
                policy_override: None,
            },
            reason: "over budget".into(),
            status: ApprovalStatus::Pending,
            time_limit_minutes: None,
            revert_action: RevertAction::Stop,
            approver: None,
            decided_at: None,
            decision_note: None,
            resource_id: None,
            created_at: now,
            expires_at: now,
        };
        store.put_approval(&approval).unwrap();
        assert_eq!(
            store
                .list_approvals_by_status(ApprovalStatus::Pending)
                .unwrap()
                .len(),
            1
        );

        approval.status = ApprovalStatus::Denied;
        store.put_approval(&approval).unwrap();
        assert!(store
            .list_approvals_by_status(ApprovalStatus::Pending)
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_approvals_by_status(ApprovalStatus::Denied)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn commit_writes_approval_with_its_resource() {
        let (store, _dir) = create_test_store();
        let now = Utc::now();
        let account = AccountId::generate();
        let resource = create_test_resource(account, "approved");
        let mut approval = ApprovalRequest {
            approval_id: ApprovalId::generate(),
            requester: resource.owner,
            account_id: account,
            requested: LaunchSpec {
                provider_id: resource.provider_id.clone(),
                name: resource.name.clone(),
                owner: resource.owner,
                project_id: resource.project_id,
                account_id: account,
                spec: resource.spec.clone(),
                policy_ref: None,
                policy_override: None,
            },
            reason: "over budget".into(),
            status: ApprovalStatus::Pending,
            time_limit_minutes: None,
            revert_action: RevertAction::Stop,
            approver: None,
            decided_at: None,
            decision_note: None,
            resource_id: None,
            created_at: now,
            expires_at: now,
        };
        store.put_approval(&approval).unwrap();

        approval.status = ApprovalStatus::Approved;
        approval.resource_id = Some(resource.resource_id);
        store
            .commit(LedgerCommit {
                resources: vec![resource.clone()],
                approvals: vec![approval.clone()],
                ..LedgerCommit::default()
            })
            .unwrap();

        assert!(store
            .list_approvals_by_status(ApprovalStatus::Pending)
            .unwrap()
            .is_empty());
        let approved = store
            .list_approvals_by_status(ApprovalStatus::Approved)
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].resource_id, Some(resource.resource_id));
        assert!(store.get_resource(&resource.resource_id).unwrap().is_some());
    }

    #[test]
    fn policies_and_meta() {
        let (store, _dir) = create_test_store();
        let policy = IdlePolicy {
            name: "batch".into(),
            description: String::new(),
            idle_threshold_minutes: 60,
            grace_period_minutes: 0,
            action: IdleAction::Hibernate,
            idle_score_threshold: 0.05,
            scoring: prism_core::ScoringProfile::default(),
            schedules: Vec::new(),
        };
        store.put_policy(&policy).unwrap();
        assert_eq!(store.get_policy("batch").unwrap(), Some(policy));
        assert!(store.get_policy("missing").unwrap().is_none());
        assert_eq!(store.list_policies().unwrap().len(), 1);

        let project = ProjectId::generate();
        assert!(store.get_project_policy(&project).unwrap().is_none());
        store.put_project_policy(&project, "batch").unwrap();
        assert_eq!(
            store.get_project_policy(&project).unwrap().as_deref(),
            Some("batch")
        );

        assert_eq!(store.get_checkpoint().unwrap(), DaemonCheckpoint::default());
        let checkpoint = DaemonCheckpoint {
            last_accrual_at: Some(Utc::now()),
            last_rollover_period: None,
        };
        store.put_checkpoint(&checkpoint).unwrap();
        assert_eq!(store.get_checkpoint().unwrap(), checkpoint);
    }
}
