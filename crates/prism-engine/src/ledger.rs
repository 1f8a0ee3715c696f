//! Hierarchical budget ledger.
//!
//! Every change to an account's spend is a [`CostEvent`] appended to the log
//! in the same atomic write as the account snapshot and any resource record
//! it belongs to. Before each mutation the snapshot is checked against the
//! sum of the log; a mismatch freezes that account (and only that account)
//! until an operator repairs it.
//!
//! Mutations serialise per budget tree: a launch's authorisation and its
//! first debit, or a child's posting and its parent's threshold check, hold
//! the lock of the tree's root account.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::Mutex;
use prism_core::{AccountId, BudgetPeriod, Money};
use prism_store::{
    Actor, ApprovalRequest, AuditEntry, BudgetAccount, BudgetActionKind, CostEvent, CostEventKind,
    JournalEntry, LedgerCommit, LedgerSnapshot, LifecycleState, ManagedResource, ResourceSpec,
    Store,
};

use crate::billing::Posting;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::lifecycle::is_billing_state;
use crate::notify::{Notification, Notifier};
use crate::types::{
    AccountStatus, Authorization, BudgetDenial, NewAccount, QuotaLimit, SavingsReport,
    TriggeredAction,
};

/// Longest parent chain followed before the tree is declared corrupt.
const MAX_DEPTH: usize = 32;

/// Everything one ledger commit writes.
#[derive(Debug, Clone, Default)]
pub struct LedgerUpdate {
    /// Resource records to write.
    pub resources: Vec<ManagedResource>,
    /// Postings to turn into cost events.
    pub postings: Vec<Posting>,
    /// Audit entries to append.
    pub audit: Vec<AuditEntry>,
    /// Approval requests decided together with this update.
    pub approvals: Vec<ApprovalRequest>,
}

impl LedgerUpdate {
    /// An update writing one resource.
    #[must_use]
    pub fn resource(resource: ManagedResource) -> Self {
        Self {
            resources: vec![resource],
            ..Self::default()
        }
    }

    /// Add postings.
    #[must_use]
    pub fn with_postings(mut self, postings: impl IntoIterator<Item = Posting>) -> Self {
        self.postings.extend(postings);
        self
    }

    /// Add an audit entry.
    #[must_use]
    pub fn with_audit(mut self, entry: AuditEntry) -> Self {
        self.audit.push(entry);
        self
    }

    /// Write an approval request in the same batch.
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalRequest) -> Self {
        self.approvals.push(approval);
        self
    }
}

/// What a commit produced.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// Stored events with their sequence numbers.
    pub events: Vec<CostEvent>,
    /// Budget auto-actions that fired and must be applied to resources.
    pub triggered: Vec<TriggeredAction>,
}

/// The budget ledger.
pub struct Ledger<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    block: Duration,
    trees: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl<S: Store> Ledger<S> {
    /// Create a ledger over `store`. `block` is the billing block a launch or
    /// resume must be able to pay for up front.
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        block: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            block,
            trees: Mutex::new(HashMap::new()),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // Tree structure and locking
    // =========================================================================

    /// Load an account.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AccountNotFound` if it does not exist.
    pub fn account(&self, account_id: &AccountId) -> Result<BudgetAccount> {
        self.store
            .get_account(account_id)?
            .ok_or(EngineError::AccountNotFound(*account_id))
    }

    /// Parent chain of an account, nearest first.
    ///
    /// # Errors
    ///
    /// Returns an error if an ancestor is missing or the chain loops.
    pub fn ancestors(&self, account: &BudgetAccount) -> Result<Vec<BudgetAccount>> {
        let mut chain = Vec::new();
        let mut next = account.parent_id;
        while let Some(parent_id) = next {
            if chain.len() >= MAX_DEPTH {
                return Err(EngineError::Internal(format!(
                    "account {} has a parent chain deeper than {MAX_DEPTH}",
                    account.account_id
                )));
            }
            let parent = self.account(&parent_id)?;
            next = parent.parent_id;
            chain.push(parent);
        }
        Ok(chain)
    }

    fn root_of(&self, account_id: &AccountId) -> Result<AccountId> {
        let account = self.account(account_id)?;
        Ok(self
            .ancestors(&account)?
            .last()
            .map_or(account.account_id, |root| root.account_id))
    }

    /// The account and every descendant.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn subtree(&self, account_id: &AccountId) -> Result<Vec<AccountId>> {
        let mut out = vec![*account_id];
        let mut i = 0;
        while i < out.len() {
            for child in self.store.list_child_accounts(&out[i])? {
                if !out.contains(&child.account_id) {
                    out.push(child.account_id);
                }
            }
            i += 1;
        }
        Ok(out)
    }

    fn tree_lock(&self, root: AccountId) -> Arc<Mutex<()>> {
        Arc::clone(self.trees.lock().entry(root).or_default())
    }

    /// Run `f` while holding the lock of the tree `account_id` belongs to.
    ///
    /// `f` must only use the `_locked` ledger operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the account does not exist, or whatever `f` returns.
    pub fn with_tree<T>(&self, account_id: &AccountId, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.tree_lock(self.root_of(account_id)?);
        let _guard = lock.lock();
        f()
    }

    // =========================================================================
    // Spend queries
    // =========================================================================

    fn events(&self, account_id: &AccountId, period: BudgetPeriod) -> Result<Vec<CostEvent>> {
        Ok(self.store.list_cost_events(account_id, period)?)
    }

    /// Net sum of an account's own events in `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn own_spend(&self, account_id: &AccountId, period: BudgetPeriod) -> Result<Money> {
        Ok(self.events(account_id, period)?.iter().map(|e| e.amount).sum())
    }

    /// Net sum of the account's and all its descendants' events in `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn rollup_spend(&self, account_id: &AccountId, period: BudgetPeriod) -> Result<Money> {
        let mut total = Money::ZERO;
        for id in self.subtree(account_id)? {
            total += self.own_spend(&id, period)?;
        }
        Ok(total)
    }

    /// First-block cost reserved by launches and resumes not yet billing.
    fn reserved(&self, account_id: &AccountId) -> Result<Money> {
        let mut total = Money::ZERO;
        for id in self.subtree(account_id)? {
            for resource in self.store.list_resources_by_account(&id)? {
                if is_starting(&resource) {
                    total += resource.spec.cost_rate.cost_for(self.block);
                }
            }
        }
        Ok(total)
    }

    // =========================================================================
    // Account management
    // =========================================================================

    /// Create a budget account.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidRequest` for bad limits or thresholds or a
    /// duplicate id, and `EngineError::AccountNotFound` for a missing parent.
    pub fn create_account(&self, request: NewAccount) -> Result<BudgetAccount> {
        validate_account(&request)?;
        if let Some(parent_id) = &request.parent_id {
            self.account(parent_id)?;
        }
        let account_id = request.account_id.unwrap_or_else(AccountId::generate);
        if self.store.get_account(&account_id)?.is_some() {
            return Err(EngineError::InvalidRequest(format!(
                "account {account_id} already exists"
            )));
        }

        let now = self.now();
        let account = BudgetAccount {
            account_id,
            parent_id: request.parent_id,
            name: request.name,
            monthly_limit: request.monthly_limit,
            rollover_cap: request.rollover_cap,
            hard_cap: request.hard_cap,
            role_quota: request.role_quota,
            alert_thresholds: request.alert_thresholds,
            auto_actions: request.auto_actions,
            ledger: LedgerSnapshot::new(BudgetPeriod::containing(now)),
            created_at: now,
            updated_at: now,
        };
        self.store.put_account(&account)?;

        tracing::info!(
            account_id = %account.account_id,
            parent_id = ?account.parent_id,
            limit = %account.monthly_limit,
            "Budget account created"
        );
        Ok(account)
    }

    /// Fail if the account is frozen.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LedgerInconsistency` for a frozen account.
    pub fn ensure_mutable(&self, account_id: &AccountId) -> Result<()> {
        ensure_not_frozen(&self.account(account_id)?)
    }

    // =========================================================================
    // Authorisation
    // =========================================================================

    /// Decide whether `spec` may start billing on `account_id`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LedgerInconsistency` for a frozen account, or a
    /// store error.
    pub fn authorize(&self, account_id: &AccountId, spec: &ResourceSpec) -> Result<Authorization> {
        self.with_tree(account_id, || self.authorize_locked(account_id, spec))
    }

    /// [`authorize`](Self::authorize) for callers already holding the tree lock.
    ///
    /// Checks run in order: launch blocks, instance classes, concurrency, the
    /// daily cap, then the monthly budget of the account and each ancestor.
    /// The first limit hit decides the outcome.
    ///
    /// # Errors
    ///
    /// See [`authorize`](Self::authorize).
    pub fn authorize_locked(&self, account_id: &AccountId, spec: &ResourceSpec) -> Result<Authorization> {
        let now = self.now();
        let period = BudgetPeriod::containing(now);
        let account = self.account(account_id)?;
        ensure_not_frozen(&account)?;

        let ancestors = self.ancestors(&account)?;
        let requested = spec.cost_rate.cost_for(self.block);
        let remaining = account.monthly_limit
            - self.rollup_spend(account_id, period)?
            - self.reserved(account_id)?;

        let deny = |limit: QuotaLimit, hard: bool, remediation: &str| {
            let denial = BudgetDenial {
                account_id: *account_id,
                limit,
                hard_cap: hard,
                remaining,
                requested,
                remediation: remediation.to_string(),
            };
            tracing::warn!(
                account_id = %account_id,
                hard_cap = hard,
                reason = %denial.summary(),
                "Launch not authorized"
            );
            if hard {
                Authorization::Deny(denial)
            } else {
                Authorization::RouteToApproval(denial)
            }
        };

        let chain = || std::iter::once(&account).chain(ancestors.iter());

        // Launch blocks are hard regardless of the cap flag.
        if let Some(blocked) = chain().find(|a| a.ledger.period == period && a.ledger.launch_blocked) {
            return Ok(deny(
                QuotaLimit::LaunchBlocked {
                    account_id: blocked.account_id,
                },
                true,
                "launches resume at the start of the next budget period",
            ));
        }

        for holder in chain() {
            let allowed = &holder.role_quota.allowed_classes;
            if !allowed.is_empty() && !allowed.iter().any(|p| class_matches(p, &spec.instance_class)) {
                return Ok(deny(
                    QuotaLimit::InstanceClass {
                        requested: spec.instance_class.clone(),
                        allowed: allowed.clone(),
                    },
                    account.hard_cap || holder.hard_cap,
                    "choose one of the allowed instance classes",
                ));
            }
        }

        if let Some(max) = account.role_quota.max_concurrent {
            let current = self
                .store
                .list_resources_by_account(account_id)?
                .iter()
                .filter(|r| r.is_billing() || is_billing_state(r.state) || is_starting(r))
                .count();
            let current = u32::try_from(current).unwrap_or(u32::MAX);
            if current >= max {
                return Ok(deny(
                    QuotaLimit::Concurrency { max, current },
                    account.hard_cap,
                    "stop or hibernate a running resource first",
                ));
            }
        }

        if let Some(cap) = account.role_quota.daily_cap {
            let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
            let spent_today: Money = self
                .events(account_id, period)?
                .iter()
                .filter(|e| e.timestamp >= day_start)
                .map(|e| e.amount)
                .sum();
            if spent_today + requested > cap {
                return Ok(deny(
                    QuotaLimit::DailyCap { cap, spent_today },
                    account.hard_cap,
                    "wait until tomorrow (UTC) or ask for approval",
                ));
            }
        }

        for holder in chain() {
            let left = holder.monthly_limit
                - self.rollup_spend(&holder.account_id, period)?
                - self.reserved(&holder.account_id)?;
            if left < requested {
                return Ok(deny(
                    QuotaLimit::MonthlyBudget {
                        account_id: holder.account_id,
                        monthly_limit: holder.monthly_limit,
                    },
                    account.hard_cap || holder.hard_cap,
                    "hibernate idle resources to bank headroom, or ask for approval",
                ));
            }
        }

        Ok(Authorization::Allow)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Write resources, cost events and audit entries in one atomic commit.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LedgerInconsistency` if an affected account is
    /// frozen or fails verification, or a store error. Nothing is written on
    /// error.
    pub fn commit(&self, update: LedgerUpdate) -> Result<CommitOutcome> {
        let mut roots = BTreeSet::new();
        for posting in &update.postings {
            roots.insert(self.root_of(&posting.account_id)?);
        }
        let locks: Vec<_> = roots.into_iter().map(|root| self.tree_lock(root)).collect();
        let _guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();
        self.commit_locked(update)
    }

    /// [`commit`](Self::commit) for callers already holding the tree lock.
    ///
    /// # Errors
    ///
    /// See [`commit`](Self::commit).
    pub fn commit_locked(&self, update: LedgerUpdate) -> Result<CommitOutcome> {
        if update.postings.is_empty() {
            self.store.commit(LedgerCommit {
                resources: update.resources,
                accounts: Vec::new(),
                events: Vec::new(),
                audit: update.audit,
                approvals: update.approvals,
            })?;
            return Ok(CommitOutcome::default());
        }

        let now = self.now();
        let period = BudgetPeriod::containing(now);

        let mut accounts: HashMap<AccountId, BudgetAccount> = HashMap::new();
        for posting in &update.postings {
            if !accounts.contains_key(&posting.account_id) {
                let account = self.load_verified(&posting.account_id, period)?;
                accounts.insert(posting.account_id, account);
            }
        }

        let mut events = Vec::with_capacity(update.postings.len());
        for posting in update.postings {
            if let Some(account) = accounts.get_mut(&posting.account_id) {
                account.ledger.current_spend += posting.amount;
                if posting.kind.is_credit() {
                    account.ledger.banked_headroom -= posting.amount;
                }
                account.updated_at = now;
            }
            events.push(CostEvent {
                seq: 0,
                resource_id: posting.resource_id,
                account_id: posting.account_id,
                kind: posting.kind,
                amount: posting.amount,
                period,
                timestamp: now,
                note: posting.note,
            });
        }

        let touched: Vec<AccountId> = accounts.keys().copied().collect();
        let stored = self.store.commit(LedgerCommit {
            resources: update.resources,
            accounts: accounts.into_values().collect(),
            events,
            audit: update.audit,
            approvals: update.approvals,
        })?;

        for event in &stored {
            tracing::debug!(
                seq = event.seq,
                account_id = %event.account_id,
                kind = ?event.kind,
                amount = %event.amount,
                "Cost event posted"
            );
        }

        // The events are durable; a failed threshold check must not turn
        // this into an error for the caller.
        let mut triggered = Vec::new();
        let mut checked = HashSet::new();
        for account_id in touched {
            match self.check_thresholds_locked(&account_id, period, now, &mut checked) {
                Ok(mut fired) => triggered.append(&mut fired),
                Err(e) => {
                    tracing::error!(account_id = %account_id, error = %e, "Threshold check failed");
                }
            }
        }

        Ok(CommitOutcome {
            events: stored,
            triggered,
        })
    }

    /// Load an account for mutation: roll its snapshot into `period` and
    /// check it against the log.
    fn load_verified(&self, account_id: &AccountId, period: BudgetPeriod) -> Result<BudgetAccount> {
        let mut account = self.account(account_id)?;
        ensure_not_frozen(&account)?;
        roll_snapshot(&mut account, period);

        let events = self.events(account_id, period)?;
        let spend: Money = events.iter().map(|e| e.amount).sum();
        let banked: Money = events
            .iter()
            .filter(|e| e.kind.is_credit())
            .map(|e| -e.amount)
            .sum();

        if spend != account.ledger.current_spend || banked != account.ledger.banked_headroom {
            let detail = format!(
                "snapshot spend {} / headroom {} but log sums to {spend} / {banked} in {period}",
                account.ledger.current_spend, account.ledger.banked_headroom
            );
            return Err(self.freeze(account, detail));
        }
        Ok(account)
    }

    fn freeze(&self, mut account: BudgetAccount, detail: String) -> EngineError {
        let now = self.now();
        account.ledger.frozen = Some(detail.clone());
        account.updated_at = now;

        tracing::error!(account_id = %account.account_id, %detail, "Ledger inconsistency, freezing account");

        let audit = AuditEntry {
            at: now,
            actor: Actor::System,
            resource_id: None,
            account_id: Some(account.account_id),
            action: "account_frozen".into(),
            detail: detail.clone(),
        };
        if let Err(e) = self.store.commit(LedgerCommit {
            accounts: vec![account.clone()],
            audit: vec![audit],
            ..LedgerCommit::default()
        }) {
            tracing::error!(account_id = %account.account_id, error = %e, "Failed to persist freeze");
        }
        self.notifier.notify(Notification::AccountFrozen {
            account_id: account.account_id,
            detail: detail.clone(),
        });

        EngineError::LedgerInconsistency {
            account_id: account.account_id,
            detail,
        }
    }

    /// Check the snapshot of one account against its log, freezing it on a
    /// mismatch.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LedgerInconsistency` on a mismatch.
    pub fn verify_account(&self, account_id: &AccountId) -> Result<()> {
        self.with_tree(account_id, || {
            self.load_verified(account_id, BudgetPeriod::containing(self.now()))
                .map(|_| ())
        })
    }

    // =========================================================================
    // Thresholds
    // =========================================================================

    fn check_thresholds_locked(
        &self,
        account_id: &AccountId,
        period: BudgetPeriod,
        now: DateTime<Utc>,
        checked: &mut HashSet<AccountId>,
    ) -> Result<Vec<TriggeredAction>> {
        let account = self.account(account_id)?;
        let mut chain = vec![account.clone()];
        chain.extend(self.ancestors(&account)?);

        let mut triggered = Vec::new();
        for mut holder in chain {
            if !checked.insert(holder.account_id) {
                continue;
            }
            roll_snapshot(&mut holder, period);
            let spend = self.rollup_spend(&holder.account_id, period)?;
            let fraction = spend.ratio_of(holder.monthly_limit);
            let mut changed = false;

            for &threshold in &holder.alert_thresholds {
                let bp = basis_points(threshold);
                if fraction >= threshold && !holder.ledger.fired_alerts.contains(&bp) {
                    holder.ledger.fired_alerts.push(bp);
                    changed = true;
                    tracing::info!(
                        account_id = %holder.account_id,
                        threshold,
                        spend = %spend,
                        "Budget threshold crossed"
                    );
                    self.notifier.notify(Notification::BudgetThreshold {
                        account_id: holder.account_id,
                        threshold,
                        spend,
                        limit: holder.monthly_limit,
                    });
                }
            }

            for auto in &holder.auto_actions {
                let bp = basis_points(auto.threshold);
                if fraction >= auto.threshold && !holder.ledger.fired_actions.contains(&bp) {
                    holder.ledger.fired_actions.push(bp);
                    changed = true;
                    tracing::warn!(
                        account_id = %holder.account_id,
                        action = ?auto.action,
                        threshold = auto.threshold,
                        "Budget auto-action fired"
                    );
                    if auto.action == BudgetActionKind::PreventLaunch {
                        holder.ledger.launch_blocked = true;
                    } else {
                        triggered.push(TriggeredAction {
                            account_id: holder.account_id,
                            action: auto.action,
                        });
                    }
                }
            }

            if changed {
                holder.updated_at = now;
                self.store.commit(LedgerCommit {
                    accounts: vec![holder.clone()],
                    audit: vec![AuditEntry {
                        at: now,
                        actor: Actor::Budget,
                        resource_id: None,
                        account_id: Some(holder.account_id),
                        action: "budget_threshold".into(),
                        detail: format!("rollup spend {spend} of {}", holder.monthly_limit),
                    }],
                    ..LedgerCommit::default()
                })?;
            }
        }
        Ok(triggered)
    }

    // =========================================================================
    // Period rollover
    // =========================================================================

    /// Carry unused budget from the previous period into the current one.
    ///
    /// Each account with a rollover cap receives a `rollover` event worth
    /// `min(limit - rollup spend, cap)` of the period just ended. Accounts
    /// that already have one this period are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. Frozen accounts are skipped and
    /// logged.
    pub fn rollover(&self) -> Result<Vec<CostEvent>> {
        let now = self.now();
        let current = BudgetPeriod::containing(now);
        let ended = current.previous();
        let mut posted = Vec::new();

        for account in self.store.list_accounts()? {
            if !account.rollover_cap.is_positive() {
                continue;
            }
            let already = self
                .events(&account.account_id, current)?
                .iter()
                .any(|e| e.kind == CostEventKind::Rollover);
            if already {
                continue;
            }

            let unused = account.monthly_limit - self.rollup_spend(&account.account_id, ended)?;
            let credit = if unused.is_positive() {
                unused.min(account.rollover_cap)
            } else {
                Money::ZERO
            };
            if !credit.is_positive() {
                continue;
            }

            let posting = Posting {
                resource_id: None,
                account_id: account.account_id,
                kind: CostEventKind::Rollover,
                amount: -credit,
                note: Some(format!("rollover from {ended}")),
            };
            match self.commit(LedgerUpdate::default().with_postings([posting])) {
                Ok(outcome) => posted.extend(outcome.events),
                Err(e @ EngineError::LedgerInconsistency { .. }) => {
                    tracing::error!(account_id = %account.account_id, error = %e, "Rollover skipped");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(period = %current, accounts = posted.len(), "Budget rollover posted");
        Ok(posted)
    }

    // =========================================================================
    // Repair and reporting
    // =========================================================================

    /// Rebuild an account's snapshot from its log and unfreeze it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AccountNotFound` or a store error.
    pub fn repair(&self, account_id: &AccountId, actor: Actor) -> Result<AccountStatus> {
        self.with_tree(account_id, || {
            let now = self.now();
            let period = BudgetPeriod::containing(now);
            let mut account = self.account(account_id)?;
            let previous = account.ledger.frozen.take();
            roll_snapshot(&mut account, period);

            let events = self.events(account_id, period)?;
            account.ledger.current_spend = events.iter().map(|e| e.amount).sum();
            account.ledger.banked_headroom = events
                .iter()
                .filter(|e| e.kind.is_credit())
                .map(|e| -e.amount)
                .sum();
            account.updated_at = now;

            self.store.commit(LedgerCommit {
                accounts: vec![account.clone()],
                audit: vec![AuditEntry {
                    at: now,
                    actor,
                    resource_id: None,
                    account_id: Some(*account_id),
                    action: "account_repaired".into(),
                    detail: previous.unwrap_or_else(|| "snapshot rebuilt from log".into()),
                }],
                ..LedgerCommit::default()
            })?;
            tracing::info!(account_id = %account_id, spend = %account.ledger.current_spend, "Account repaired");
            Ok(())
        })?;
        self.status(account_id)
    }

    /// Cost events of an account in `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the account does not exist or the store fails.
    pub fn list_events(&self, account_id: &AccountId, period: BudgetPeriod) -> Result<Vec<CostEvent>> {
        self.account(account_id)?;
        self.events(account_id, period)
    }

    /// Current balances of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the account does not exist or the store fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn status(&self, account_id: &AccountId) -> Result<AccountStatus> {
        let now = self.now();
        let period = BudgetPeriod::containing(now);
        let account = self.account(account_id)?;
        let events = self.events(account_id, period)?;

        let current_spend: Money = events.iter().map(|e| e.amount).sum();
        let banked_headroom: Money = events
            .iter()
            .filter(|e| e.kind.is_credit())
            .map(|e| -e.amount)
            .sum();
        let rollover_credit: Money = events
            .iter()
            .filter(|e| e.kind == CostEventKind::Rollover)
            .map(|e| -e.amount)
            .sum();
        let rollup_spend = self.rollup_spend(account_id, period)?;
        let remaining = account.monthly_limit - rollup_spend;

        // Last seven days of subtree spend, excluding rollovers.
        let since = now - Duration::days(7);
        let mut recent = Money::ZERO;
        for id in self.subtree(account_id)? {
            for p in [period.previous(), period] {
                recent += self
                    .events(&id, p)?
                    .iter()
                    .filter(|e| e.timestamp >= since && e.kind != CostEventKind::Rollover)
                    .map(|e| e.amount)
                    .sum::<Money>();
            }
        }
        let daily = recent.as_micros() as f64 / 7.0;
        let projected_monthly_spend = Money::from_micros(recent.as_micros().saturating_mul(30) / 7);
        let days_until_exhausted = if !remaining.is_positive() {
            Some(0.0)
        } else if daily > 0.0 {
            Some(remaining.as_micros() as f64 / daily)
        } else {
            None
        };

        let billing_resources = self
            .store
            .list_resources_by_account(account_id)?
            .iter()
            .filter(|r| r.is_billing())
            .count();

        let current_period = account.ledger.period == period;
        Ok(AccountStatus {
            account_id: account.account_id,
            name: account.name,
            parent_id: account.parent_id,
            period,
            monthly_limit: account.monthly_limit,
            current_spend,
            rollup_spend,
            rollover_credit,
            banked_headroom,
            remaining,
            spent_percent: rollup_spend.ratio_of(account.monthly_limit) * 100.0,
            projected_monthly_spend,
            days_until_exhausted,
            billing_resources,
            frozen: account.ledger.frozen,
            launch_blocked: current_period && account.ledger.launch_blocked,
        })
    }

    /// What hibernation and stopping saved an account in `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the account does not exist or the store fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn savings_report(&self, account_id: &AccountId, period: BudgetPeriod) -> Result<SavingsReport> {
        let now = self.now();
        let events = self.list_events(account_id, period)?;

        let credits = |kind| -> Money {
            events
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| -e.amount)
                .sum()
        };
        let hibernate_credits = credits(CostEventKind::CreditHibernate);
        let stop_credits = credits(CostEventKind::CreditStop);

        let window_end = now.min(period.end());
        let window_start = period.start();

        let mut parked = Duration::zero();
        let mut avoided_cost = Money::ZERO;
        for resource in self.store.list_resources_by_account(account_id)? {
            if !matches!(resource.state, LifecycleState::Hibernated | LifecycleState::Stopped) {
                continue;
            }
            let from = resource.last_transition_at.max(window_start);
            if from >= window_end {
                continue;
            }
            let span = window_end - from;
            parked += span;
            avoided_cost += resource.spec.cost_rate.cost_for(span);
        }

        let idle_actions = self.count_idle_actions(account_id, window_start, window_end)?;

        let elapsed = (window_end - window_start).num_seconds();
        let total = (period.end() - window_start).num_seconds();
        let projected_monthly_savings = if elapsed > 0 {
            Money::from_micros(
                i64::try_from(i128::from(avoided_cost.as_micros()) * i128::from(total) / i128::from(elapsed))
                    .unwrap_or(i64::MAX),
            )
        } else {
            Money::ZERO
        };

        Ok(SavingsReport {
            account_id: *account_id,
            period,
            hibernate_credits,
            stop_credits,
            idle_actions,
            hours_not_running: parked.num_seconds() as f64 / 3600.0,
            avoided_cost,
            projected_monthly_savings,
        })
    }

    fn count_idle_actions(
        &self,
        account_id: &AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u32> {
        const PAGE: usize = 1_000;
        let mut after = 0;
        let mut count = 0u32;
        loop {
            let page = self.store.journal_since(after, PAGE)?;
            let Some((last, _)) = page.last() else { break };
            after = *last;
            for (_, entry) in &page {
                if let JournalEntry::Audit(audit) = entry {
                    if audit.action == "idle_action"
                        && audit.account_id.as_ref() == Some(account_id)
                        && audit.at >= from
                        && audit.at < to
                    {
                        count += 1;
                    }
                }
            }
            if page.len() < PAGE {
                break;
            }
        }
        Ok(count)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn ensure_not_frozen(account: &BudgetAccount) -> Result<()> {
    match &account.ledger.frozen {
        Some(detail) => Err(EngineError::LedgerInconsistency {
            account_id: account.account_id,
            detail: detail.clone(),
        }),
        None => Ok(()),
    }
}

/// Start a fresh snapshot when `period` has moved on. Fired thresholds and
/// launch blocks end with the period.
fn roll_snapshot(account: &mut BudgetAccount, period: BudgetPeriod) {
    if account.ledger.period != period {
        tracing::debug!(
            account_id = %account.account_id,
            from = %account.ledger.period,
            to = %period,
            "Rolling ledger snapshot"
        );
        account.ledger = LedgerSnapshot::new(period);
    }
}

fn is_starting(resource: &ManagedResource) -> bool {
    resource.billing.is_none()
        && matches!(
            resource.state,
            LifecycleState::Provisioning | LifecycleState::Resuming
        )
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn basis_points(fraction: f64) -> u32 {
    (fraction.clamp(0.0, 1.0) * 10_000.0).round() as u32
}

/// Match an instance class against an allow-list pattern; `*` matches any run
/// of characters.
fn class_matches(pattern: &str, class: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == class;
    }
    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = class.strip_prefix(first) else {
        return false;
    };
    let last = rest.len() - 1;
    for (i, part) in rest.iter().enumerate() {
        if i == last {
            return remaining.ends_with(part);
        }
        match remaining.find(part) {
            Some(at) => remaining = &remaining[at + part.len()..],
            None => return false,
        }
    }
    true
}

fn validate_account(request: &NewAccount) -> Result<()> {
    if request.name.trim().is_empty() {
        return Err(EngineError::InvalidRequest("account name must not be empty".into()));
    }
    if !request.monthly_limit.is_positive() {
        return Err(EngineError::InvalidRequest("monthly_limit must be positive".into()));
    }
    if request.rollover_cap.is_negative() {
        return Err(EngineError::InvalidRequest("rollover_cap must not be negative".into()));
    }
    let thresholds = request
        .alert_thresholds
        .iter()
        .copied()
        .chain(request.auto_actions.iter().map(|a| a.threshold));
    for t in thresholds {
        if !(t > 0.0 && t <= 1.0) {
            return Err(EngineError::InvalidRequest(format!(
                "threshold {t} must lie in (0, 1]"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::ChannelNotifier;
    use chrono::TimeZone;
    use prism_core::{CostRate, ProjectId, ResourceId, UserId};
    use prism_store::{AutoAction, ResourceKind, RocksStore, RoleQuota};
    use tempfile::TempDir;

    struct Fixture {
        ledger: Ledger<RocksStore>,
        store: Arc<RocksStore>,
        clock: Arc<ManualClock>,
        notifier: Arc<ChannelNotifier>,
        _dir: TempDir,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let notifier = Arc::new(ChannelNotifier::new(64));
        let ledger = Ledger::new(
            Arc::clone(&store),
            clock.clone(),
            notifier.clone(),
            Duration::hours(1),
        );
        Fixture {
            ledger,
            store,
            clock,
            notifier,
            _dir: dir,
        }
    }

    fn account(limit: f64) -> NewAccount {
        NewAccount {
            account_id: None,
            parent_id: None,
            name: "research".into(),
            monthly_limit: Money::from_dollars(limit),
            rollover_cap: Money::ZERO,
            hard_cap: false,
            role_quota: RoleQuota::default(),
            alert_thresholds: Vec::new(),
            auto_actions: Vec::new(),
        }
    }

    fn spec(class: &str, hourly: f64) -> ResourceSpec {
        ResourceSpec {
            kind: ResourceKind::Compute,
            instance_class: class.into(),
            cost_rate: CostRate::per_hour(Money::from_dollars(hourly)),
        }
    }

    fn debit(account_id: AccountId, amount: f64) -> LedgerUpdate {
        LedgerUpdate::default().with_postings([Posting {
            resource_id: None,
            account_id,
            kind: CostEventKind::DebitRunning,
            amount: Money::from_dollars(amount),
            note: None,
        }])
    }

    #[test]
    fn create_account_validates() {
        let f = fixture();
        let mut bad = account(0.0);
        assert!(matches!(f.ledger.create_account(bad.clone()), Err(EngineError::InvalidRequest(_))));

        bad.monthly_limit = Money::from_dollars(10.0);
        bad.alert_thresholds = vec![1.5];
        assert!(matches!(f.ledger.create_account(bad.clone()), Err(EngineError::InvalidRequest(_))));

        bad.alert_thresholds = vec![];
        bad.parent_id = Some(AccountId::generate());
        assert!(matches!(f.ledger.create_account(bad), Err(EngineError::AccountNotFound(_))));
    }

    #[test]
    fn commit_keeps_snapshot_equal_to_log() {
        let f = fixture();
        let acct = f.ledger.create_account(account(100.0)).unwrap();

        f.ledger.commit(debit(acct.account_id, 1.0)).unwrap();
        f.ledger
            .commit(LedgerUpdate::default().with_postings([Posting {
                resource_id: None,
                account_id: acct.account_id,
                kind: CostEventKind::CreditHibernate,
                amount: -Money::from_dollars(0.25),
                note: None,
            }]))
            .unwrap();

        let stored = f.store.get_account(&acct.account_id).unwrap().unwrap();
        let period = BudgetPeriod::containing(t0());
        let log_sum = f.ledger.own_spend(&acct.account_id, period).unwrap();
        assert_eq!(stored.ledger.current_spend, log_sum);
        assert_eq!(log_sum, Money::from_dollars(0.75));
        assert_eq!(stored.ledger.banked_headroom, Money::from_dollars(0.25));
    }

    #[test]
    fn class_allow_list_is_enforced() {
        let f = fixture();
        let mut req = account(100.0);
        req.hard_cap = true;
        req.role_quota.allowed_classes = vec!["t3.*".into()];
        let acct = f.ledger.create_account(req).unwrap();

        assert_eq!(
            f.ledger.authorize(&acct.account_id, &spec("t3.medium", 0.04)).unwrap(),
            Authorization::Allow
        );
        match f.ledger.authorize(&acct.account_id, &spec("p3.2xlarge", 3.06)).unwrap() {
            Authorization::Deny(denial) => {
                assert!(matches!(denial.limit, QuotaLimit::InstanceClass { .. }));
            }
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn soft_and_hard_caps() {
        let f = fixture();
        let soft = f.ledger.create_account(account(1.0)).unwrap();
        let mut hard_req = account(1.0);
        hard_req.hard_cap = true;
        let hard = f.ledger.create_account(hard_req).unwrap();

        let big = spec("m5.large", 2.0);
        assert!(matches!(
            f.ledger.authorize(&soft.account_id, &big).unwrap(),
            Authorization::RouteToApproval(_)
        ));
        assert!(matches!(
            f.ledger.authorize(&hard.account_id, &big).unwrap(),
            Authorization::Deny(_)
        ));
    }

    #[test]
    fn parent_budget_constrains_children() {
        let f = fixture();
        let parent = f.ledger.create_account(account(5.0)).unwrap();
        let mut child_req = account(100.0);
        child_req.parent_id = Some(parent.account_id);
        let child = f.ledger.create_account(child_req).unwrap();

        f.ledger.commit(debit(child.account_id, 4.5)).unwrap();

        let period = BudgetPeriod::containing(t0());
        assert_eq!(
            f.ledger.rollup_spend(&parent.account_id, period).unwrap(),
            Money::from_dollars(4.5)
        );
        match f.ledger.authorize(&child.account_id, &spec("t3.large", 1.0)).unwrap() {
            Authorization::RouteToApproval(denial) => match denial.limit {
                QuotaLimit::MonthlyBudget { account_id, .. } => {
                    assert_eq!(account_id, parent.account_id);
                }
                other => panic!("unexpected limit {other:?}"),
            },
            other => panic!("expected approval routing, got {other:?}"),
        }
    }

    #[test]
    fn reserved_first_blocks_count_against_budget() {
        let f = fixture();
        let acct = f.ledger.create_account(account(1.5)).unwrap();
        let project = ProjectId::generate();
        let now = t0();
        let starting = ManagedResource {
            resource_id: ResourceId::generate(&project, "a"),
            provider_id: "i-a".into(),
            name: "a".into(),
            owner: UserId::generate(),
            project_id: project,
            account_id: acct.account_id,
            spec: spec("t3.large", 1.0),
            state: LifecycleState::Provisioning,
            prior_stable_state: None,
            in_flight: None,
            deferred: None,
            policy_ref: "standard".into(),
            policy_override: None,
            last_heartbeat_seq: None,
            last_heartbeat_at: None,
            agent_boot_id: None,
            agent_status: prism_store::AgentStatus::Unseen,
            idle: prism_store::IdleTracking::default(),
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
        };
        f.store.put_resource(&starting).unwrap();

        assert!(matches!(
            f.ledger.authorize(&acct.account_id, &spec("t3.large", 1.0)).unwrap(),
            Authorization::RouteToApproval(_)
        ));
    }

    #[test]
    fn thresholds_fire_once_per_period() {
        let f = fixture();
        let mut rx = f.notifier.subscribe();
        let mut req = account(10.0);
        req.alert_thresholds = vec![0.5];
        req.auto_actions = vec![
            AutoAction {
                threshold: 0.8,
                action: BudgetActionKind::HibernateAll,
            },
            AutoAction {
                threshold: 0.9,
                action: BudgetActionKind::PreventLaunch,
            },
        ];
        let acct = f.ledger.create_account(req).unwrap();

        let first = f.ledger.commit(debit(acct.account_id, 6.0)).unwrap();
        assert!(first.triggered.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Notification::BudgetThreshold { .. }));

        let second = f.ledger.commit(debit(acct.account_id, 2.5)).unwrap();
        assert_eq!(second.triggered.len(), 1);
        assert_eq!(second.triggered[0].action, BudgetActionKind::HibernateAll);

        let third = f.ledger.commit(debit(acct.account_id, 1.0)).unwrap();
        assert!(third.triggered.is_empty());
        assert!(rx.try_recv().is_err());

        let status = f.ledger.status(&acct.account_id).unwrap();
        assert!(status.launch_blocked);
        match f.ledger.authorize(&acct.account_id, &spec("t3.micro", 0.01)).unwrap() {
            Authorization::Deny(denial) => {
                assert!(matches!(denial.limit, QuotaLimit::LaunchBlocked { .. }));
            }
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn inconsistency_freezes_only_that_account() {
        let f = fixture();
        let a = f.ledger.create_account(account(100.0)).unwrap();
        let b = f.ledger.create_account(account(100.0)).unwrap();
        f.ledger.commit(debit(a.account_id, 1.0)).unwrap();
        f.ledger.commit(debit(b.account_id, 1.0)).unwrap();

        // Corrupt A's snapshot behind the ledger's back.
        let mut corrupted = f.store.get_account(&a.account_id).unwrap().unwrap();
        corrupted.ledger.current_spend = Money::from_dollars(42.0);
        f.store.put_account(&corrupted).unwrap();

        assert!(matches!(
            f.ledger.commit(debit(a.account_id, 1.0)),
            Err(EngineError::LedgerInconsistency { .. })
        ));
        assert!(f.ledger.commit(debit(b.account_id, 1.0)).is_ok());
        assert!(matches!(
            f.ledger.authorize(&a.account_id, &spec("t3.micro", 0.01)),
            Err(EngineError::LedgerInconsistency { .. })
        ));

        let repaired = f.ledger.repair(&a.account_id, Actor::Operator("ops".into())).unwrap();
        assert!(repaired.frozen.is_none());
        assert_eq!(repaired.current_spend, Money::from_dollars(1.0));
        assert!(f.ledger.commit(debit(a.account_id, 1.0)).is_ok());
    }

    #[test]
    fn rollover_carries_capped_unused_budget() {
        let f = fixture();
        let mut req = account(100.0);
        req.rollover_cap = Money::from_dollars(20.0);
        let acct = f.ledger.create_account(req).unwrap();
        f.ledger.commit(debit(acct.account_id, 90.0)).unwrap();

        f.clock.set(Utc.with_ymd_and_hms(2026, 4, 1, 0, 5, 0).unwrap());
        let posted = f.ledger.rollover().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].amount, -Money::from_dollars(10.0));

        // Idempotent within the period.
        assert!(f.ledger.rollover().unwrap().is_empty());

        let status = f.ledger.status(&acct.account_id).unwrap();
        assert_eq!(status.rollover_credit, Money::from_dollars(10.0));
        assert_eq!(status.remaining, Money::from_dollars(110.0));
    }

    #[test]
    fn daily_cap_counts_todays_spend() {
        let f = fixture();
        let mut req = account(100.0);
        req.role_quota.daily_cap = Some(Money::from_dollars(5.0));
        let acct = f.ledger.create_account(req).unwrap();
        f.ledger.commit(debit(acct.account_id, 4.5)).unwrap();

        assert!(matches!(
            f.ledger.authorize(&acct.account_id, &spec("t3.large", 1.0)).unwrap(),
            Authorization::RouteToApproval(BudgetDenial {
                limit: QuotaLimit::DailyCap { .. },
                ..
            })
        ));

        f.clock.advance(Duration::days(1));
        assert_eq!(
            f.ledger.authorize(&acct.account_id, &spec("t3.large", 1.0)).unwrap(),
            Authorization::Allow
        );
    }

    #[test]
    fn class_patterns() {
        assert!(class_matches("t3.*", "t3.medium"));
        assert!(!class_matches("t3.*", "t3a.medium"));
        assert!(class_matches("m5.large", "m5.large"));
        assert!(class_matches("*.xlarge", "r5.xlarge"));
        assert!(class_matches("g*.*large", "g4dn.2xlarge"));
        assert!(!class_matches("p3.*", "t3.micro"));
    }
}
