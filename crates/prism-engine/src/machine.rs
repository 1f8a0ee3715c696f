//! Lifecycle state machine execution.
//!
//! Every transition runs in three phases. Under the resource lock the request
//! is validated and the transitional state is persisted together with an
//! in-flight marker. The provider call then runs without any lock held. Back
//! under the lock the settled state is committed with its ledger postings, or
//! the resource drops into `Failed`.
//!
//! Follow-up work (a user request deferred behind an in-flight call, or the
//! per-resource actions of a budget auto-action) goes onto a queue that the
//! caller drains once its own transition is done.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use prism_core::{Money, ResourceId, UserId};
use prism_provider::{Provider, ProviderAction, ProviderError, ProviderStatus};
use prism_store::{
    Actor, AuditEntry, BudgetActionKind, CostEventKind, DeferredRequest, IdleAction, InFlight,
    LaunchSpec, LifecycleState, ManagedResource, RequestedAction, ResourceKind, Store,
};

use crate::billing::{self, Posting};
use crate::error::{EngineError, Result};
use crate::ledger::LedgerUpdate;
use crate::lifecycle::{
    is_billing_state, is_stable, is_valid_transition, stable_equivalent, validate_transition,
};
use crate::notify::Notification;
use crate::policy;
use crate::reconciler::local_state_for;
use crate::service::GovernanceEngine;
use crate::types::{Authorization, ForceRequest, LaunchOutcome, TriggeredAction};

/// A queued lifecycle request.
pub(crate) type Work = (ResourceId, RequestedAction, Actor);

/// How a requested action maps onto the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Plan {
    pub transitional: LifecycleState,
    pub settled: LifecycleState,
    pub action: ProviderAction,
}

const fn plan_of(
    transitional: LifecycleState,
    settled: LifecycleState,
    action: ProviderAction,
) -> Option<Plan> {
    Some(Plan {
        transitional,
        settled,
        action,
    })
}

/// Work out what `action` means for `resource` in its current state.
///
/// Returns `None` when the resource is already where the action would take
/// it.
pub(crate) fn plan(resource: &ManagedResource, action: RequestedAction) -> Result<Option<Plan>> {
    use LifecycleState::{
        Hibernated, Hibernating, PendingIdleAction, Provisioning, Resuming, Running, Stopped,
        Stopping, Terminated, Terminating,
    };

    let state = resource.state;
    let invalid = |to| EngineError::InvalidTransition {
        resource_id: resource.resource_id,
        from: state,
        to,
    };

    match action {
        RequestedAction::Stop => match state {
            Running | PendingIdleAction => Ok(plan_of(Stopping, Stopped, ProviderAction::Stop)),
            Stopping | Stopped => Ok(None),
            _ => Err(invalid(Stopping)),
        },
        RequestedAction::Hibernate => {
            if resource.spec.kind == ResourceKind::Volume {
                return Err(EngineError::InvalidRequest(
                    "storage volumes cannot be hibernated".into(),
                ));
            }
            match state {
                Running | PendingIdleAction => {
                    Ok(plan_of(Hibernating, Hibernated, ProviderAction::Hibernate))
                }
                Hibernating | Hibernated => Ok(None),
                _ => Err(invalid(Hibernating)),
            }
        }
        RequestedAction::Start | RequestedAction::Resume => match state {
            Stopped => Ok(plan_of(Resuming, Running, ProviderAction::Start)),
            Hibernated => Ok(plan_of(Resuming, Running, ProviderAction::Resume)),
            Running | PendingIdleAction | Resuming | Provisioning => Ok(None),
            _ => Err(invalid(Resuming)),
        },
        RequestedAction::Terminate => match state {
            Terminating | Terminated => Ok(None),
            s if is_valid_transition(s, Terminating) => {
                Ok(plan_of(Terminating, Terminated, ProviderAction::Terminate))
            }
            _ => Err(invalid(Terminating)),
        },
    }
}

/// Open or close the billing window for a move to `target` at `at`.
///
/// Transitional, failed and unknown targets leave the window as it is.
pub(crate) fn apply_billing(
    resource: &mut ManagedResource,
    target: LifecycleState,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    block: chrono::Duration,
) -> Vec<Posting> {
    let rate = resource.spec.cost_rate;
    let mut postings = Vec::new();

    if is_billing_state(target) {
        if resource.billing.is_none() {
            let (window, debit) = billing::open(rate, at, now, block);
            resource.billing = Some(window);
            if debit != Money::ZERO {
                postings.push(
                    Posting::for_resource(
                        resource.resource_id,
                        resource.account_id,
                        CostEventKind::DebitRunning,
                        debit,
                    )
                    .with_note("billing opened"),
                );
            }
        }
    } else if is_stable(target) {
        if let Some(window) = resource.billing.take() {
            let closing = billing::close(rate, &window, at, now, target);
            if closing.amount != Money::ZERO {
                postings.push(
                    Posting::for_resource(
                        resource.resource_id,
                        resource.account_id,
                        closing.kind,
                        closing.amount,
                    )
                    .with_note(format!("billing closed towards {target:?}")),
                );
            }
        }
    }
    postings
}

/// The provider call that moves an instance from `from` to `target`, if any.
const fn provider_action_for(from: LifecycleState, target: LifecycleState) -> Option<ProviderAction> {
    match target {
        LifecycleState::Running => match from {
            LifecycleState::Running | LifecycleState::PendingIdleAction => None,
            LifecycleState::Hibernated | LifecycleState::Hibernating => {
                Some(ProviderAction::Resume)
            }
            _ => Some(ProviderAction::Start),
        },
        LifecycleState::Hibernated => match from {
            LifecycleState::Hibernated => None,
            _ => Some(ProviderAction::Hibernate),
        },
        LifecycleState::Stopped => match from {
            LifecycleState::Stopped => None,
            _ => Some(ProviderAction::Stop),
        },
        LifecycleState::Terminated => match from {
            LifecycleState::Terminated => None,
            _ => Some(ProviderAction::Terminate),
        },
        _ => None,
    }
}

fn validate_launch(spec: &LaunchSpec) -> Result<()> {
    if spec.provider_id.trim().is_empty() {
        return Err(EngineError::InvalidRequest("provider_id must not be empty".into()));
    }
    if spec.name.trim().is_empty() {
        return Err(EngineError::InvalidRequest("name must not be empty".into()));
    }
    if spec.spec.instance_class.trim().is_empty() {
        return Err(EngineError::InvalidRequest("instance_class must not be empty".into()));
    }
    if spec.spec.cost_rate.hourly().is_negative() {
        return Err(EngineError::InvalidRequest("cost_rate must not be negative".into()));
    }
    Ok(())
}

impl<S: Store, P: Provider> GovernanceEngine<S, P> {
    // =========================================================================
    // Requests
    // =========================================================================

    /// Carry out a lifecycle request and any follow-up work it causes.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidTransition` if the action does not apply,
    /// `EngineError::TransitionInFlight` for automated requests racing a
    /// provider call, `EngineError::BudgetExceeded` for a resume over budget,
    /// or the provider error that sent the resource to `Failed`.
    pub async fn request(
        &self,
        resource_id: &ResourceId,
        action: RequestedAction,
        actor: Actor,
    ) -> Result<ManagedResource> {
        let mut queue = VecDeque::new();
        let result = self.transition(resource_id, action, actor, &mut queue).await;
        self.drain(queue).await;
        result
    }

    /// Run queued requests until none are left.
    pub(crate) async fn drain(&self, mut queue: VecDeque<Work>) {
        while let Some((resource_id, action, actor)) = queue.pop_front() {
            if let Err(e) = self
                .transition(&resource_id, action, actor.clone(), &mut queue)
                .await
            {
                tracing::warn!(
                    resource_id = %resource_id,
                    ?action,
                    ?actor,
                    error = %e,
                    "Queued request failed"
                );
            }
        }
    }

    async fn transition(
        &self,
        resource_id: &ResourceId,
        action: RequestedAction,
        actor: Actor,
        queue: &mut VecDeque<Work>,
    ) -> Result<ManagedResource> {
        let lock = self.resource_lock(resource_id)?;

        let (resource, plan, started_at) = {
            let _guard = lock.lock().await;
            let now = self.now();
            let mut resource = self.load(resource_id)?;

            if let Some(target) = resource.in_flight.as_ref().map(|f| f.target) {
                if matches!(actor, Actor::User(_) | Actor::Operator(_)) {
                    tracing::info!(
                        resource_id = %resource_id,
                        ?action,
                        in_flight = ?target,
                        "Deferring request behind in-flight provider call"
                    );
                    resource.deferred = Some(DeferredRequest {
                        action,
                        requested_by: actor,
                        requested_at: now,
                    });
                    resource.updated_at = now;
                    self.store.put_resource(&resource)?;
                    return Ok(resource);
                }
                return Err(EngineError::TransitionInFlight {
                    resource_id: *resource_id,
                    target,
                });
            }

            let Some(plan) = plan(&resource, action)? else {
                tracing::debug!(resource_id = %resource_id, ?action, state = ?resource.state, "Request is a no-op");
                return Ok(resource);
            };
            let from = resource.state;
            validate_transition(resource_id, from, plan.transitional)?;

            let mut audit = vec![self.audit(
                actor.clone(),
                &resource,
                "transition_requested",
                format!("{action:?}: {from:?} -> {:?}", plan.transitional),
            )];
            if from == LifecycleState::PendingIdleAction && actor != Actor::Policy {
                audit.push(self.audit(
                    actor.clone(),
                    &resource,
                    "idle_preempted",
                    "explicit request replaced the pending idle action",
                ));
            }

            resource.idle.pending = None;
            if let Some(stable) = stable_equivalent(from) {
                resource.prior_stable_state = Some(stable);
            }
            resource.state = plan.transitional;
            resource.in_flight = Some(InFlight {
                from,
                target: plan.settled,
                origin: actor.clone(),
                started_at: now,
            });
            resource.error_message = None;
            resource.last_transition_at = now;
            resource.updated_at = now;

            let update = LedgerUpdate {
                resources: vec![resource.clone()],
                postings: Vec::new(),
                audit,
            };
            let needs_budget = plan.settled == LifecycleState::Running
                && !matches!(actor, Actor::Operator(_) | Actor::System);
            if needs_budget {
                self.ledger.with_tree(&resource.account_id, || {
                    match self
                        .ledger
                        .authorize_locked(&resource.account_id, &resource.spec)?
                    {
                        Authorization::Allow => self.ledger.commit_locked(update).map(|_| ()),
                        Authorization::RouteToApproval(denial) | Authorization::Deny(denial) => {
                            Err(EngineError::BudgetExceeded(Box::new(denial)))
                        }
                    }
                })?;
            } else {
                self.ledger.commit(update)?;
            }

            tracing::info!(
                resource_id = %resource_id,
                from = ?from,
                to = ?plan.transitional,
                ?actor,
                "Transition started"
            );
            (resource, plan, now)
        };

        let result = self.call_provider(plan.action, &resource.provider_id).await;
        self.finish(resource_id, plan, &actor, started_at, result, queue)
            .await
    }

    /// Phase three: commit the outcome of a provider call.
    async fn finish(
        &self,
        resource_id: &ResourceId,
        plan: Plan,
        actor: &Actor,
        started_at: DateTime<Utc>,
        result: prism_provider::Result<ProviderStatus>,
        queue: &mut VecDeque<Work>,
    ) -> Result<ManagedResource> {
        let lock = self.resource_lock(resource_id)?;
        let _guard = lock.lock().await;
        let now = self.now();
        let mut resource = self.load(resource_id)?;

        if resource.in_flight.as_ref().map(|f| f.started_at) != Some(started_at) {
            tracing::warn!(
                resource_id = %resource_id,
                action = %plan.action,
                "Provider result superseded by an override, dropping it"
            );
            return Ok(resource);
        }
        resource.in_flight = None;
        let deferred = resource.deferred.take();

        let outcome = match result {
            Ok(status) => {
                self.cache
                    .record(&resource.provider_id, status.clone(), now);
                if local_state_for(status.state, resource.state) == plan.settled {
                    self.settle_or_flag(&mut resource, plan.settled, now, actor, queue);
                } else {
                    tracing::info!(
                        resource_id = %resource_id,
                        observed = ?status.state,
                        "Provider accepted the call; awaiting confirmation"
                    );
                    resource.updated_at = now;
                    self.store.put_resource(&resource)?;
                }
                Ok(())
            }
            Err(ProviderError::NotFound(_)) if plan.action == ProviderAction::Terminate => {
                self.settle_or_flag(&mut resource, LifecycleState::Terminated, now, actor, queue);
                Ok(())
            }
            Err(e) => {
                self.fail(&mut resource, &e.to_string(), actor.clone())?;
                Err(EngineError::from(e))
            }
        };

        if let Some(deferred) = deferred {
            tracing::info!(resource_id = %resource_id, action = ?deferred.action, "Running deferred request");
            queue.push_back((*resource_id, deferred.action, deferred.requested_by));
        }
        outcome.map(|()| resource)
    }

    /// Commit a settled state, or flag the resource for the reconciler when
    /// the ledger post fails.
    fn settle_or_flag(
        &self,
        resource: &mut ManagedResource,
        target: LifecycleState,
        now: DateTime<Utc>,
        actor: &Actor,
        queue: &mut VecDeque<Work>,
    ) {
        let audit = self.settle_audit(actor, resource, target);
        match self.commit_settled(resource, target, now, audit) {
            Ok(triggered) => {
                self.queue_budget_actions(&triggered, queue);
                if *actor == Actor::Policy {
                    let action = if target == LifecycleState::Hibernated {
                        IdleAction::Hibernate
                    } else {
                        IdleAction::Stop
                    };
                    self.notifier.notify(Notification::IdleAction {
                        resource_id: resource.resource_id,
                        action,
                    });
                }
            }
            Err(e) => {
                tracing::error!(
                    resource_id = %resource.resource_id,
                    error = %e,
                    "Ledger post failed, flagging resource for reconciliation"
                );
                resource.needs_reconciliation = true;
                resource.updated_at = now;
                if let Err(e) = self.store.put_resource(resource) {
                    tracing::error!(resource_id = %resource.resource_id, error = %e, "Failed to persist flag");
                }
            }
        }
    }

    fn settle_audit(&self, actor: &Actor, resource: &ManagedResource, target: LifecycleState) -> AuditEntry {
        let action = match (actor, target) {
            (Actor::Policy, LifecycleState::Hibernated | LifecycleState::Stopped) => "idle_action",
            (Actor::Budget, _) => "budget_action",
            (Actor::Approval(_), _) => "approval_reverted",
            (Actor::Schedule, _) => "scheduled_action",
            _ => "transition",
        };
        self.audit(
            actor.clone(),
            resource,
            action,
            format!("{:?} -> {target:?}", resource.state),
        )
    }

    /// Move `resource` to `target` and commit it with its billing postings.
    ///
    /// `at` is when the provider says the change happened. `resource` is only
    /// updated when the commit succeeds.
    pub(crate) fn commit_settled(
        &self,
        resource: &mut ManagedResource,
        target: LifecycleState,
        at: DateTime<Utc>,
        audit: AuditEntry,
    ) -> Result<Vec<TriggeredAction>> {
        let now = self.now();
        let mut next = resource.clone();
        let from = next.state;
        let postings = apply_billing(&mut next, target, at, now, self.config.billing_block());

        if target == LifecycleState::Running
            && matches!(
                from,
                LifecycleState::Provisioning | LifecycleState::Resuming
            )
        {
            next.idle.reset();
        }
        if target != LifecycleState::PendingIdleAction {
            next.idle.pending = None;
        }
        next.state = target;
        if is_stable(target) {
            next.prior_stable_state = Some(target);
            next.error_message = None;
        }
        next.in_flight = None;
        next.needs_reconciliation = false;
        if target != LifecycleState::Terminated {
            next.drift = None;
        }
        next.last_transition_at = now;
        next.updated_at = now;
        if target == LifecycleState::Terminated {
            next.deferred = None;
            next.revert = None;
            next.scheduled = None;
            self.cache.remove(&next.provider_id);
        }

        let outcome = self.ledger.commit(
            LedgerUpdate::resource(next.clone())
                .with_postings(postings)
                .with_audit(audit),
        )?;
        tracing::info!(
            resource_id = %next.resource_id,
            from = ?from,
            to = ?target,
            "Transition committed"
        );
        *resource = next;
        Ok(outcome.triggered)
    }

    /// Move a resource into `Failed` after a provider error. The billing
    /// window stays open: the instance may still be running.
    pub(crate) fn fail(&self, resource: &mut ManagedResource, error: &str, actor: Actor) -> Result<()> {
        let now = self.now();
        let from = resource.state;
        let audit = self.audit(actor, resource, "transition_failed", format!("{from:?}: {error}"));

        resource.state = LifecycleState::Failed;
        resource.in_flight = None;
        resource.error_message = Some(error.to_string());
        resource.last_transition_at = now;
        resource.updated_at = now;
        self.ledger
            .commit(LedgerUpdate::resource(resource.clone()).with_audit(audit))?;

        tracing::error!(resource_id = %resource.resource_id, from = ?from, error, "Resource failed");
        self.notifier.notify(Notification::ResourceFailed {
            resource_id: resource.resource_id,
            error: error.to_string(),
        });
        Ok(())
    }

    /// Expand fired budget auto-actions into per-resource requests.
    pub(crate) fn queue_budget_actions(&self, triggered: &[TriggeredAction], queue: &mut VecDeque<Work>) {
        for fired in triggered {
            let accounts = match self.ledger.subtree(&fired.account_id) {
                Ok(accounts) => accounts,
                Err(e) => {
                    tracing::error!(account_id = %fired.account_id, error = %e, "Cannot expand budget action");
                    continue;
                }
            };
            for account_id in accounts {
                let resources = match self.store.list_resources_by_account(&account_id) {
                    Ok(resources) => resources,
                    Err(e) => {
                        tracing::error!(account_id = %account_id, error = %e, "Cannot list resources");
                        continue;
                    }
                };
                for resource in resources.iter().filter(|r| is_billing_state(r.state)) {
                    let action = match fired.action {
                        BudgetActionKind::HibernateAll
                            if resource.spec.kind == ResourceKind::Compute =>
                        {
                            RequestedAction::Hibernate
                        }
                        BudgetActionKind::HibernateAll | BudgetActionKind::StopAll => {
                            RequestedAction::Stop
                        }
                        BudgetActionKind::PreventLaunch => continue,
                    };
                    queue.push_back((resource.resource_id, action, Actor::Budget));
                }
            }
        }
    }

    /// Apply fired budget auto-actions now.
    pub(crate) async fn apply_budget_actions(&self, triggered: &[TriggeredAction]) {
        if triggered.is_empty() {
            return;
        }
        let mut queue = VecDeque::new();
        self.queue_budget_actions(triggered, &mut queue);
        self.drain(queue).await;
    }

    pub(crate) async fn call_provider(
        &self,
        action: ProviderAction,
        provider_id: &str,
    ) -> prism_provider::Result<ProviderStatus> {
        let provider = &self.provider;
        self.config
            .retry
            .run(action.as_str(), || provider.apply(action, provider_id))
            .await
    }

    pub(crate) async fn describe(&self, provider_id: &str) -> prism_provider::Result<ProviderStatus> {
        let provider = &self.provider;
        self.config
            .retry
            .run("describe", || provider.describe_status(provider_id))
            .await
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Authorise and launch a resource.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::BudgetExceeded` for a hard denial,
    /// `EngineError::PolicyNotFound` for an unknown policy name, or the
    /// provider error that failed the start.
    pub async fn launch_resource(&self, requester: &UserId, spec: LaunchSpec) -> Result<LaunchOutcome> {
        validate_launch(&spec)?;
        let policy_ref =
            policy::policy_for_launch(self.store.as_ref(), &spec, &self.config.default_policy)?;
        let actor = Actor::User(*requester);
        let resource = self.new_resource(&spec, policy_ref, &actor);

        let authorization = self.ledger.with_tree(&spec.account_id, || {
            let authorization = self
                .ledger
                .authorize_locked(&spec.account_id, &spec.spec)?;
            if authorization == Authorization::Allow {
                let audit = self.audit(actor.clone(), &resource, "launch", spec.spec.instance_class.clone());
                self.ledger
                    .commit_locked(LedgerUpdate::resource(resource.clone()).with_audit(audit))?;
            }
            Ok(authorization)
        })?;

        match authorization {
            Authorization::Allow => {
                let resource = self.provision(resource, actor).await?;
                Ok(LaunchOutcome::Launched {
                    resource: Box::new(resource),
                })
            }
            Authorization::RouteToApproval(denial) => {
                let approval = self.submit_approval(requester, spec, &denial)?;
                Ok(LaunchOutcome::PendingApproval {
                    approval: Box::new(approval),
                })
            }
            Authorization::Deny(denial) => Err(EngineError::BudgetExceeded(Box::new(denial))),
        }
    }

    /// A `Provisioning` record for a launch, with its start call in flight.
    pub(crate) fn new_resource(&self, spec: &LaunchSpec, policy_ref: String, actor: &Actor) -> ManagedResource {
        let now = self.now();
        ManagedResource {
            resource_id: ResourceId::generate(&spec.project_id, &spec.name),
            provider_id: spec.provider_id.clone(),
            name: spec.name.clone(),
            owner: spec.owner,
            project_id: spec.project_id,
            account_id: spec.account_id,
            spec: spec.spec.clone(),
            state: LifecycleState::Provisioning,
            prior_stable_state: None,
            in_flight: Some(InFlight {
                from: LifecycleState::Provisioning,
                target: LifecycleState::Running,
                origin: actor.clone(),
                started_at: now,
            }),
            deferred: None,
            policy_ref,
            policy_override: spec.policy_override.clone(),
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
        }
    }

    /// Start a freshly persisted `Provisioning` resource at the provider.
    pub(crate) async fn provision(&self, resource: ManagedResource, actor: Actor) -> Result<ManagedResource> {
        let started_at = resource
            .in_flight
            .as_ref()
            .map_or(resource.created_at, |f| f.started_at);
        let plan = Plan {
            transitional: LifecycleState::Provisioning,
            settled: LifecycleState::Running,
            action: ProviderAction::Start,
        };
        tracing::info!(resource_id = %resource.resource_id, class = %resource.spec.instance_class, "Provisioning");

        let result = self.call_provider(plan.action, &resource.provider_id).await;
        let mut queue = VecDeque::new();
        let outcome = self
            .finish(&resource.resource_id, plan, &actor, started_at, result, &mut queue)
            .await;
        self.drain(queue).await;
        outcome
    }

    // =========================================================================
    // Administrative overrides
    // =========================================================================

    /// Force a resource into `request.target`, bypassing the transition table
    /// and every policy. Ledger postings still follow the billing rules.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidRequest` for an empty reason or a target
    /// that cannot be forced, or a provider error when `skip_provider` is off.
    pub async fn force(
        &self,
        resource_id: &ResourceId,
        operator: &str,
        request: ForceRequest,
    ) -> Result<ManagedResource> {
        if request.reason.trim().is_empty() {
            return Err(EngineError::InvalidRequest("a reason is required".into()));
        }
        let target = request.target;
        if matches!(
            target,
            LifecycleState::PendingIdleAction | LifecycleState::Unknown
        ) {
            return Err(EngineError::InvalidRequest(format!(
                "cannot force a resource into {target:?}"
            )));
        }

        let actor = Actor::Operator(operator.to_string());
        let lock = self.resource_lock(resource_id)?;
        let mut queue = VecDeque::new();

        let (action, provider_id, started_at) = {
            let guard = lock.lock().await;
            let now = self.now();
            let mut resource = self.load(resource_id)?;
            let from = resource.state;
            resource.deferred = None;

            let action = if request.skip_provider {
                None
            } else {
                provider_action_for(from, target)
            };
            let Some(action) = action else {
                let resource =
                    self.commit_forced(resource, target, now, &actor, &request.reason, &mut queue)?;
                drop(guard);
                self.drain(queue).await;
                return Ok(resource);
            };

            // Mark the call so concurrent automation backs off and an
            // earlier in-flight result is dropped.
            resource.in_flight = Some(InFlight {
                from,
                target,
                origin: actor.clone(),
                started_at: now,
            });
            resource.updated_at = now;
            self.store.put_resource(&resource)?;
            (action, resource.provider_id.clone(), now)
        };

        let result = self.call_provider(action, &provider_id).await;

        let resource = {
            let _guard = lock.lock().await;
            let mut resource = self.load(resource_id)?;
            if resource.in_flight.as_ref().map(|f| f.started_at) != Some(started_at) {
                tracing::warn!(
                    resource_id = %resource_id,
                    operator,
                    "Forced transition superseded by another override"
                );
                return Ok(resource);
            }
            let deferred = resource.deferred.take();
            resource.in_flight = None;

            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    // The tick replays a request deferred behind this call.
                    resource.deferred = deferred;
                    resource.updated_at = self.now();
                    self.store.put_resource(&resource)?;
                    tracing::warn!(resource_id = %resource_id, operator, %action, error = %e, "Forced provider call failed");
                    return Err(EngineError::from(e));
                }
            };
            let at = self.now();
            self.cache.record(&provider_id, status, at);
            let resource =
                self.commit_forced(resource, target, at, &actor, &request.reason, &mut queue)?;
            if let Some(deferred) = deferred {
                queue.push_back((*resource_id, deferred.action, deferred.requested_by));
            }
            resource
        };

        self.drain(queue).await;
        Ok(resource)
    }

    /// Write a forced move to `target` at `at`.
    fn commit_forced(
        &self,
        mut resource: ManagedResource,
        target: LifecycleState,
        at: DateTime<Utc>,
        actor: &Actor,
        reason: &str,
        queue: &mut VecDeque<Work>,
    ) -> Result<ManagedResource> {
        let from = resource.state;
        resource.in_flight = None;
        let audit = self.audit(
            actor.clone(),
            &resource,
            "force_transition",
            format!("{from:?} -> {target:?}: {reason}"),
        );

        if is_stable(target) {
            let triggered = self.commit_settled(&mut resource, target, at, audit)?;
            self.queue_budget_actions(&triggered, queue);
        } else {
            resource.state = target;
            if target == LifecycleState::Failed {
                resource.error_message = Some(reason.to_string());
            }
            resource.last_transition_at = at;
            resource.updated_at = at;
            self.ledger
                .commit(LedgerUpdate::resource(resource.clone()).with_audit(audit))?;
        }

        tracing::warn!(
            resource_id = %resource.resource_id,
            ?actor,
            from = ?from,
            to = ?target,
            "Forced transition"
        );
        Ok(resource)
    }

    /// Return a `Failed` resource to its prior stable state once the provider
    /// confirms it is there.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidRequest` if the resource is not failed and
    /// `EngineError::DriftConflict` if the provider reports anything else.
    pub async fn recover_failed(&self, resource_id: &ResourceId, operator: &str) -> Result<ManagedResource> {
        let (provider_id, prior) = failed_with_prior(&self.load(resource_id)?)?;
        let status = self.describe(&provider_id).await?;
        let now = self.now();
        self.cache.record(&provider_id, status.clone(), now);

        let lock = self.resource_lock(resource_id)?;
        let mut queue = VecDeque::new();
        let resource = {
            let _guard = lock.lock().await;
            let mut resource = self.load(resource_id)?;
            if failed_with_prior(&resource)?.1 != prior {
                return Err(EngineError::DriftConflict {
                    resource_id: *resource_id,
                    detail: "prior stable state changed during recovery".into(),
                });
            }

            let observed = local_state_for(status.state, LifecycleState::Failed);
            if observed != prior {
                return Err(EngineError::DriftConflict {
                    resource_id: *resource_id,
                    detail: format!(
                        "provider reports {:?} but the prior stable state was {prior:?}",
                        status.state
                    ),
                });
            }

            let audit = self.audit(
                Actor::Operator(operator.to_string()),
                &resource,
                "recovered",
                format!("Failed -> {prior:?}"),
            );
            let at = status.changed_at.unwrap_or(now);
            let triggered = self.commit_settled(&mut resource, prior, at, audit)?;
            self.queue_budget_actions(&triggered, &mut queue);
            resource
        };
        self.drain(queue).await;
        Ok(resource)
    }
}

/// Provider id and prior stable state of a `Failed` resource.
fn failed_with_prior(resource: &ManagedResource) -> Result<(String, LifecycleState)> {
    if resource.state != LifecycleState::Failed {
        return Err(EngineError::InvalidRequest(format!(
            "resource is {:?}, only failed resources can be recovered",
            resource.state
        )));
    }
    let Some(prior) = resource.prior_stable_state else {
        return Err(EngineError::DriftConflict {
            resource_id: resource.resource_id,
            detail: "no prior stable state recorded".into(),
        });
    };
    Ok((resource.provider_id.clone(), prior))
}
