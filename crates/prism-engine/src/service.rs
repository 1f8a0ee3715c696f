//! Governance service implementation.
//!
//! This module provides the `Governance` trait and the `GovernanceEngine`
//! implementation that coordinates the lifecycle state machine, the idle
//! policy engine, the budget ledger, the approval workflow and the provider
//! reconciler over one store and one provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prism_core::{AccountId, ApprovalId, BudgetPeriod, IdleSignal, ProjectId, ResourceId, UserId};
use prism_provider::{Provider, StatusCache};
use prism_store::{
    Actor, AgentStatus, ApprovalRequest, ApprovalStatus, AuditEntry, BudgetAccount, CostEvent,
    IdlePolicy, JournalEntry, LaunchSpec, LifecycleState, ManagedResource, ReconciliationRecord,
    RequestedAction, Store,
};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ledger::Ledger;
use crate::notify::{LogNotifier, Notifier};
use crate::policy;
use crate::types::{
    AccountStatus, ApprovalDecision, ForceRequest, HeartbeatAck, IdleReport, LaunchOutcome,
    NewAccount, OperatorFlags, ResourceFilter, SavingsReport,
};

/// Trait defining the governance operations.
///
/// This trait is the complete API the daemon exposes: launches and lifecycle
/// requests, heartbeat ingestion, budget accounts, approvals and the
/// administrative overrides.
#[async_trait]
pub trait Governance: Send + Sync {
    // =========================================================================
    // Resources
    // =========================================================================

    /// Launch a resource for `requester`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::BudgetExceeded` when a hard limit denies the
    /// launch; soft limits yield `LaunchOutcome::PendingApproval` instead.
    async fn launch(&self, requester: &UserId, spec: LaunchSpec) -> Result<LaunchOutcome>;

    /// Start, stop, hibernate, resume or terminate a resource.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidTransition` if the action does not apply
    /// to the current state, `EngineError::BudgetExceeded` for a resume over
    /// budget, or a provider error.
    async fn request_action(
        &self,
        resource_id: &ResourceId,
        action: RequestedAction,
        actor: Actor,
    ) -> Result<ManagedResource>;

    /// Get a resource.
    async fn get_resource(&self, resource_id: &ResourceId) -> Result<ManagedResource>;

    /// List resources passing `filter`.
    async fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<ManagedResource>>;

    // =========================================================================
    // Idle detection
    // =========================================================================

    /// Ingest one agent heartbeat.
    async fn ingest_heartbeat(&self, signal: IdleSignal) -> Result<HeartbeatAck>;

    /// What idle detection knows about a resource.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AgentUnreachable` while the agent is silent.
    async fn idle_report(&self, resource_id: &ResourceId) -> Result<IdleReport>;

    /// List idle policies.
    async fn list_policies(&self) -> Result<Vec<IdlePolicy>>;

    /// Create or replace an idle policy.
    async fn put_policy(&self, policy: IdlePolicy) -> Result<IdlePolicy>;

    /// Set the default policy of a project.
    async fn set_project_policy(&self, project_id: &ProjectId, policy: &str) -> Result<()>;

    // =========================================================================
    // Budgets
    // =========================================================================

    /// Create a budget account.
    async fn create_account(&self, request: NewAccount) -> Result<BudgetAccount>;

    /// Current balances of an account.
    async fn account_status(&self, account_id: &AccountId) -> Result<AccountStatus>;

    /// Balances of every account.
    async fn list_accounts(&self) -> Result<Vec<AccountStatus>>;

    /// Cost events of an account in a period.
    async fn account_events(
        &self,
        account_id: &AccountId,
        period: BudgetPeriod,
    ) -> Result<Vec<CostEvent>>;

    /// Savings attributable to hibernation and stopping.
    async fn savings_report(
        &self,
        account_id: &AccountId,
        period: BudgetPeriod,
    ) -> Result<SavingsReport>;

    // =========================================================================
    // Approvals
    // =========================================================================

    /// List approval requests, optionally by status.
    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>>;

    /// Get an approval request.
    async fn get_approval(&self, approval_id: &ApprovalId) -> Result<ApprovalRequest>;

    /// Approve or deny a pending request. Deciding twice returns the first
    /// decision unchanged.
    async fn decide_approval(
        &self,
        approval_id: &ApprovalId,
        approver: &UserId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest>;

    // =========================================================================
    // Operations
    // =========================================================================

    /// Force a resource into a state, bypassing the transition table.
    async fn force_transition(
        &self,
        resource_id: &ResourceId,
        operator: &str,
        request: ForceRequest,
    ) -> Result<ManagedResource>;

    /// Return a failed resource to its prior stable state after checking the
    /// provider agrees.
    async fn recover(&self, resource_id: &ResourceId, operator: &str) -> Result<ManagedResource>;

    /// Rebuild a frozen account's snapshot from its event log.
    async fn repair_account(&self, account_id: &AccountId, operator: &str) -> Result<AccountStatus>;

    /// Reconcile one resource against the provider now.
    async fn reconcile_now(&self, resource_id: &ResourceId) -> Result<ReconciliationRecord>;

    /// Everything that currently needs an operator.
    async fn operator_flags(&self) -> Result<OperatorFlags>;

    /// Journal entries after sequence number `after`.
    async fn journal_since(&self, after: u64, limit: usize) -> Result<Vec<(u64, JournalEntry)>>;
}

/// The main governance engine.
pub struct GovernanceEngine<S: Store, P: Provider> {
    pub(crate) store: Arc<S>,
    pub(crate) provider: Arc<P>,
    pub(crate) ledger: Ledger<S>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) cache: StatusCache,
    pub(crate) decisions: tokio::sync::Mutex<()>,
    locks: Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: Store, P: Provider> GovernanceEngine<S, P> {
    /// Create a new engine using the system clock and logging notifier.
    #[must_use]
    pub fn new(store: Arc<S>, provider: Arc<P>, config: EngineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let ledger = Ledger::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&notifier),
            config.billing_block(),
        );
        Self {
            store,
            provider,
            ledger,
            config,
            clock,
            notifier,
            cache: StatusCache::new(),
            decisions: tokio::sync::Mutex::new(()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create with default configuration.
    #[must_use]
    pub fn with_defaults(store: Arc<S>, provider: Arc<P>) -> Self {
        Self::new(store, provider, EngineConfig::default())
    }

    /// Use a different clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.rebuild_ledger();
        self
    }

    /// Use a different notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self.rebuild_ledger();
        self
    }

    fn rebuild_ledger(&mut self) {
        self.ledger = Ledger::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.notifier),
            self.config.billing_block(),
        );
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get a reference to the provider.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Get the budget ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Last provider status observed per provider id.
    #[must_use]
    pub const fn status_cache(&self) -> &StatusCache {
        &self.cache
    }

    /// Store the built-in idle policies that are not present yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn seed_policies(&self) -> Result<usize> {
        policy::seed_builtin_policies(self.store.as_ref())
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The lock serialising every state change of one resource.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ResourceNotFound` for an unknown resource; no
    /// lock is created for it.
    pub(crate) fn resource_lock(&self, resource_id: &ResourceId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        if let Some(lock) = self.locks.lock().get(resource_id) {
            return Ok(Arc::clone(lock));
        }
        self.load(resource_id)?;
        Ok(Arc::clone(self.locks.lock().entry(*resource_id).or_default()))
    }

    /// Drop the locks of terminated or deleted resources that nobody holds.
    ///
    /// Returns the number of locks dropped.
    pub(crate) fn prune_locks(&self) -> usize {
        let unheld: Vec<ResourceId> = self
            .locks
            .lock()
            .iter()
            .filter(|(_, lock)| Arc::strong_count(lock) == 1)
            .map(|(id, _)| *id)
            .collect();

        let mut pruned = 0;
        for resource_id in unheld {
            let finished = match self.store.get_resource(&resource_id) {
                Ok(Some(resource)) => resource.state == LifecycleState::Terminated,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(resource_id = %resource_id, error = %e, "Cannot check resource for lock pruning");
                    false
                }
            };
            if !finished {
                continue;
            }
            let mut locks = self.locks.lock();
            if locks
                .get(&resource_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&resource_id);
                pruned += 1;
            }
        }
        pruned
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    pub(crate) fn load(&self, resource_id: &ResourceId) -> Result<ManagedResource> {
        self.store
            .get_resource(resource_id)?
            .ok_or(EngineError::ResourceNotFound(*resource_id))
    }

    pub(crate) fn audit(
        &self,
        actor: Actor,
        resource: &ManagedResource,
        action: &str,
        detail: impl Into<String>,
    ) -> AuditEntry {
        AuditEntry {
            at: self.now(),
            actor,
            resource_id: Some(resource.resource_id),
            account_id: Some(resource.account_id),
            action: action.to_string(),
            detail: detail.into(),
        }
    }

    fn flags(&self) -> Result<OperatorFlags> {
        let mut flags = OperatorFlags {
            failed: self.store.list_resources_by_state(LifecycleState::Failed)?,
            ..OperatorFlags::default()
        };
        for resource in self.store.list_all_resources()? {
            if resource.agent_status == AgentStatus::Escalated {
                flags.escalated_agents.push(resource.clone());
            }
            if let Some(drift) = &resource.drift {
                flags.drift_conflicts.push(drift.clone());
            }
            if resource.needs_reconciliation {
                flags.needs_reconciliation.push(resource);
            }
        }
        flags.frozen_accounts = self
            .store
            .list_accounts()?
            .into_iter()
            .filter_map(|a| a.ledger.frozen.map(|reason| (a.account_id, reason)))
            .collect();
        Ok(flags)
    }
}

#[async_trait]
impl<S: Store + 'static, P: Provider + 'static> Governance for GovernanceEngine<S, P> {
    // =========================================================================
    // Resources
    // =========================================================================

    async fn launch(&self, requester: &UserId, spec: LaunchSpec) -> Result<LaunchOutcome> {
        self.launch_resource(requester, spec).await
    }

    async fn request_action(
        &self,
        resource_id: &ResourceId,
        action: RequestedAction,
        actor: Actor,
    ) -> Result<ManagedResource> {
        self.request(resource_id, action, actor).await
    }

    async fn get_resource(&self, resource_id: &ResourceId) -> Result<ManagedResource> {
        self.load(resource_id)
    }

    async fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<ManagedResource>> {
        let resources = match (filter.state, filter.account_id) {
            (Some(state), _) => self.store.list_resources_by_state(state)?,
            (None, Some(account_id)) => self.store.list_resources_by_account(&account_id)?,
            (None, None) => self.store.list_all_resources()?,
        };
        Ok(resources.into_iter().filter(|r| filter.matches(r)).collect())
    }

    // =========================================================================
    // Idle detection
    // =========================================================================

    async fn ingest_heartbeat(&self, signal: IdleSignal) -> Result<HeartbeatAck> {
        self.ingest(signal).await
    }

    async fn idle_report(&self, resource_id: &ResourceId) -> Result<IdleReport> {
        let resource = self.load(resource_id)?;
        if matches!(
            resource.agent_status,
            AgentStatus::Unreachable | AgentStatus::Escalated
        ) {
            return Err(EngineError::AgentUnreachable(*resource_id));
        }
        let effective = policy::resolve(
            self.store.as_ref(),
            &resource,
            &self.config.default_policy,
        )?;
        Ok(IdleReport {
            resource_id: resource.resource_id,
            state: resource.state,
            agent_status: resource.agent_status,
            last_heartbeat_at: resource.last_heartbeat_at,
            idle_score: resource.idle.last_score,
            idle_for_secs: resource.idle.accumulator_secs,
            pending: resource.idle.pending,
            policy: effective.name,
        })
    }

    async fn list_policies(&self) -> Result<Vec<IdlePolicy>> {
        Ok(self.store.list_policies()?)
    }

    async fn put_policy(&self, policy: IdlePolicy) -> Result<IdlePolicy> {
        policy::validate_policy(&policy)?;
        self.store.put_policy(&policy)?;
        tracing::info!(policy = %policy.name, "Idle policy stored");
        Ok(policy)
    }

    async fn set_project_policy(&self, project_id: &ProjectId, policy: &str) -> Result<()> {
        if self.store.get_policy(policy)?.is_none() {
            return Err(EngineError::PolicyNotFound(policy.to_string()));
        }
        self.store.put_project_policy(project_id, policy)?;
        Ok(())
    }

    // =========================================================================
    // Budgets
    // =========================================================================

    async fn create_account(&self, request: NewAccount) -> Result<BudgetAccount> {
        self.ledger.create_account(request)
    }

    async fn account_status(&self, account_id: &AccountId) -> Result<AccountStatus> {
        self.ledger.status(account_id)
    }

    async fn list_accounts(&self) -> Result<Vec<AccountStatus>> {
        self.store
            .list_accounts()?
            .iter()
            .map(|a| self.ledger.status(&a.account_id))
            .collect()
    }

    async fn account_events(
        &self,
        account_id: &AccountId,
        period: BudgetPeriod,
    ) -> Result<Vec<CostEvent>> {
        self.ledger.list_events(account_id, period)
    }

    async fn savings_report(
        &self,
        account_id: &AccountId,
        period: BudgetPeriod,
    ) -> Result<SavingsReport> {
        self.ledger.savings_report(account_id, period)
    }

    // =========================================================================
    // Approvals
    // =========================================================================

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        let statuses = match status {
            Some(status) => vec![status],
            None => vec![
                ApprovalStatus::Pending,
                ApprovalStatus::Approved,
                ApprovalStatus::Denied,
                ApprovalStatus::Expired,
            ],
        };
        let mut out = Vec::new();
        for status in statuses {
            out.extend(self.store.list_approvals_by_status(status)?);
        }
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn get_approval(&self, approval_id: &ApprovalId) -> Result<ApprovalRequest> {
        self.store
            .get_approval(approval_id)?
            .ok_or(EngineError::ApprovalNotFound(*approval_id))
    }

    async fn decide_approval(
        &self,
        approval_id: &ApprovalId,
        approver: &UserId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest> {
        self.decide(approval_id, approver, decision).await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn force_transition(
        &self,
        resource_id: &ResourceId,
        operator: &str,
        request: ForceRequest,
    ) -> Result<ManagedResource> {
        self.force(resource_id, operator, request).await
    }

    async fn recover(&self, resource_id: &ResourceId, operator: &str) -> Result<ManagedResource> {
        self.recover_failed(resource_id, operator).await
    }

    async fn repair_account(&self, account_id: &AccountId, operator: &str) -> Result<AccountStatus> {
        self.ledger
            .repair(account_id, Actor::Operator(operator.to_string()))
    }

    async fn reconcile_now(&self, resource_id: &ResourceId) -> Result<ReconciliationRecord> {
        self.reconcile(resource_id).await
    }

    async fn operator_flags(&self) -> Result<OperatorFlags> {
        self.flags()
    }

    async fn journal_since(&self, after: u64, limit: usize) -> Result<Vec<(u64, JournalEntry)>> {
        Ok(self.store.journal_since(after, limit)?)
    }
}
