//! Heartbeat ingestion and agent health.
//!
//! Each accepted heartbeat is scored with the resource's effective policy and
//! fed to the policy engine. Stale or duplicate signals are dropped by
//! sequence number; a new boot id or a long silence clears the idle history.

use chrono::{DateTime, Utc};
use prism_core::IdleSignal;
use prism_provider::Provider;
use prism_store::{
    Actor, AgentStatus, AuditEntry, IdleAction, LifecycleState, ManagedResource, RequestedAction,
    ResourceKind, Store,
};

use crate::error::Result;
use crate::ledger::LedgerUpdate;
use crate::lifecycle::validate_transition;
use crate::notify::Notification;
use crate::policy::{self, Decision};
use crate::service::GovernanceEngine;
use crate::types::HeartbeatAck;

fn ack(resource: &ManagedResource, reason: Option<&str>, score: Option<f64>) -> HeartbeatAck {
    HeartbeatAck {
        accepted: reason.is_none(),
        reason: reason.map(str::to_string),
        state: resource.state,
        idle_score: score,
        idle_for_secs: resource.idle.accumulator_secs,
    }
}

impl<S: Store, P: Provider> GovernanceEngine<S, P> {
    /// Accept one heartbeat and run the idle policy on it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ResourceNotFound` for an unknown resource, or a
    /// store error. Failures of a triggered idle action are logged, not
    /// returned: the heartbeat itself was accepted.
    pub async fn ingest(&self, signal: IdleSignal) -> Result<HeartbeatAck> {
        let resource_id = signal.resource_id;
        let lock = self.resource_lock(&resource_id)?;

        let (mut reply, due) = {
            let _guard = lock.lock().await;
            let now = self.now();
            let mut resource = self.load(&resource_id)?;

            if resource.state == LifecycleState::Terminated {
                return Ok(ack(&resource, Some("resource terminated"), None));
            }

            let mut audit = Vec::new();
            if resource.agent_boot_id == Some(signal.boot_id) {
                if resource.last_heartbeat_seq.is_some_and(|last| signal.seq <= last) {
                    tracing::debug!(
                        resource_id = %resource_id,
                        seq = signal.seq,
                        last = ?resource.last_heartbeat_seq,
                        "Dropping stale heartbeat"
                    );
                    return Ok(ack(&resource, Some("stale sequence"), None));
                }
            } else {
                if resource.agent_boot_id.is_some() {
                    tracing::info!(resource_id = %resource_id, boot_id = signal.boot_id, "Agent restarted");
                }
                resource.agent_boot_id = Some(signal.boot_id);
                self.clear_idle(&mut resource, now, "agent restarted", &mut audit)?;
            }

            if let Some(last) = resource.last_heartbeat_at {
                if now - last > self.config.unreachable_after() {
                    tracing::info!(
                        resource_id = %resource_id,
                        silent_secs = (now - last).num_seconds(),
                        "Heartbeat after connectivity gap"
                    );
                    self.clear_idle(&mut resource, now, "connectivity gap", &mut audit)?;
                }
            }

            resource.last_heartbeat_seq = Some(signal.seq);
            resource.last_heartbeat_at = Some(now);
            if resource.agent_status != AgentStatus::Healthy {
                tracing::info!(resource_id = %resource_id, previous = ?resource.agent_status, "Agent reporting");
            }
            resource.agent_status = AgentStatus::Healthy;
            resource.updated_at = now;

            let evaluable = resource.in_flight.is_none()
                && matches!(
                    resource.state,
                    LifecycleState::Running | LifecycleState::PendingIdleAction
                );
            let mut score = None;
            let mut due = None;
            if evaluable {
                let effective =
                    policy::resolve(self.store.as_ref(), &resource, &self.config.default_policy)?;
                let value = effective.scoring.score(&signal.metrics);
                score = Some(value);

                match policy::evaluate(resource.state, &mut resource.idle, &effective, value, now) {
                    Decision::Continue => {}
                    Decision::EnterPending { action, deadline } => {
                        validate_transition(&resource_id, resource.state, LifecycleState::PendingIdleAction)?;
                        resource.state = LifecycleState::PendingIdleAction;
                        resource.last_transition_at = now;
                        audit.push(self.audit(
                            Actor::Policy,
                            &resource,
                            "idle_warning",
                            format!("{action:?} at {deadline} under policy {}", effective.name),
                        ));
                        tracing::info!(
                            resource_id = %resource_id,
                            ?action,
                            %deadline,
                            policy = %effective.name,
                            "Idle warning raised"
                        );
                        self.notifier.notify(Notification::IdleWarning {
                            resource_id,
                            action,
                            deadline,
                        });
                        if deadline <= now {
                            due = Some(action);
                        }
                    }
                    Decision::CancelPending => {
                        resource.state = LifecycleState::Running;
                        resource.last_transition_at = now;
                        audit.push(self.audit(Actor::Policy, &resource, "idle_cancelled", "activity resumed"));
                        tracing::info!(resource_id = %resource_id, score = value, "Idle warning cancelled");
                    }
                    Decision::Trigger(action) => due = Some(action),
                }
            }

            self.ledger.commit(LedgerUpdate {
                resources: vec![resource.clone()],
                postings: Vec::new(),
                audit,
            })?;
            (ack(&resource, None, score), due)
        };

        if let Some(action) = due {
            match self.execute_idle_action(&resource_id, action).await {
                Ok(resource) => reply.state = resource.state,
                Err(e) => {
                    tracing::warn!(resource_id = %resource_id, ?action, error = %e, "Idle action failed");
                    if let Ok(resource) = self.load(&resource_id) {
                        reply.state = resource.state;
                    }
                }
            }
        }
        Ok(reply)
    }

    /// Forget idle history, cancelling a pending action.
    fn clear_idle(
        &self,
        resource: &mut ManagedResource,
        now: DateTime<Utc>,
        why: &str,
        audit: &mut Vec<AuditEntry>,
    ) -> Result<()> {
        resource.last_heartbeat_seq = None;
        resource.idle.reset();
        if resource.state == LifecycleState::PendingIdleAction {
            validate_transition(&resource.resource_id, resource.state, LifecycleState::Running)?;
            resource.state = LifecycleState::Running;
            resource.last_transition_at = now;
            audit.push(self.audit(Actor::Policy, resource, "idle_cancelled", why));
        }
        Ok(())
    }

    /// Carry out an idle action whose grace period has run out.
    ///
    /// Volumes cannot hibernate, so a hibernate policy stops them.
    ///
    /// # Errors
    ///
    /// Returns whatever the lifecycle request returns.
    pub async fn execute_idle_action(
        &self,
        resource_id: &prism_core::ResourceId,
        action: IdleAction,
    ) -> Result<ManagedResource> {
        let resource = self.load(resource_id)?;
        if resource.state != LifecycleState::PendingIdleAction {
            tracing::debug!(resource_id = %resource_id, state = ?resource.state, "Idle action no longer pending");
            return Ok(resource);
        }

        let requested = match action {
            IdleAction::Notify => return self.notify_only(resource_id).await,
            IdleAction::Hibernate if resource.spec.kind == ResourceKind::Compute => {
                RequestedAction::Hibernate
            }
            IdleAction::Hibernate | IdleAction::Stop => RequestedAction::Stop,
        };
        tracing::info!(resource_id = %resource_id, ?requested, "Executing idle action");
        self.request(resource_id, requested, Actor::Policy).await
    }

    async fn notify_only(&self, resource_id: &prism_core::ResourceId) -> Result<ManagedResource> {
        let lock = self.resource_lock(resource_id)?;
        let _guard = lock.lock().await;
        let now = self.now();
        let mut resource = self.load(resource_id)?;
        if resource.state != LifecycleState::PendingIdleAction {
            return Ok(resource);
        }

        resource.state = LifecycleState::Running;
        resource.idle.reset();
        resource.last_transition_at = now;
        resource.updated_at = now;
        let audit = self.audit(Actor::Policy, &resource, "idle_notified", "notify-only policy");
        self.ledger
            .commit(LedgerUpdate::resource(resource.clone()).with_audit(audit))?;
        self.notifier.notify(Notification::IdleAction {
            resource_id: *resource_id,
            action: IdleAction::Notify,
        });
        Ok(resource)
    }

    // =========================================================================
    // Evaluation tick
    // =========================================================================

    /// Fire pending idle actions whose deadline has passed.
    ///
    /// Only resources with a healthy agent are acted on: a deadline reached
    /// while the agent is silent waits for the next heartbeat, which clears
    /// the idle history after a connectivity gap.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub async fn evaluate_pending(&self) -> Result<usize> {
        let now = self.now();
        let mut fired = 0;
        for resource in self
            .store
            .list_resources_by_state(LifecycleState::PendingIdleAction)?
        {
            if resource.agent_status != AgentStatus::Healthy {
                continue;
            }
            let Some(action) = policy::due_action(&resource.idle, now) else {
                continue;
            };
            fired += 1;
            if let Err(e) = self.execute_idle_action(&resource.resource_id, action).await {
                tracing::warn!(resource_id = %resource.resource_id, ?action, error = %e, "Idle action failed");
            }
        }
        Ok(fired)
    }

    /// Classify agents that stopped reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn check_agents(&self) -> Result<usize> {
        let unreachable_after = self.config.unreachable_after();
        let escalation_after = self.config.escalation_after();
        let mut changed = 0;

        let mut candidates = self.store.list_resources_by_state(LifecycleState::Running)?;
        candidates.extend(
            self.store
                .list_resources_by_state(LifecycleState::PendingIdleAction)?,
        );

        for candidate in candidates {
            let lock = self.resource_lock(&candidate.resource_id)?;
            let _guard = lock.lock().await;
            let now = self.now();
            let mut resource = self.load(&candidate.resource_id)?;
            if !matches!(
                resource.state,
                LifecycleState::Running | LifecycleState::PendingIdleAction
            ) {
                continue;
            }

            let since = resource
                .last_heartbeat_at
                .unwrap_or(resource.last_transition_at);
            let silent = now - since;
            let next = if silent > escalation_after {
                AgentStatus::Escalated
            } else if silent > unreachable_after {
                AgentStatus::Unreachable
            } else {
                continue;
            };
            if resource.agent_status == next
                || (resource.agent_status == AgentStatus::Escalated && next == AgentStatus::Unreachable)
            {
                continue;
            }

            resource.agent_status = next;
            resource.updated_at = now;
            changed += 1;
            if next == AgentStatus::Escalated {
                tracing::error!(
                    resource_id = %resource.resource_id,
                    silent_secs = silent.num_seconds(),
                    "Agent silent past escalation threshold"
                );
                let audit = self.audit(
                    Actor::System,
                    &resource,
                    "agent_escalated",
                    format!("no heartbeat for {}s", silent.num_seconds()),
                );
                self.ledger
                    .commit(LedgerUpdate::resource(resource.clone()).with_audit(audit))?;
                self.notifier.notify(Notification::AgentEscalated {
                    resource_id: resource.resource_id,
                    last_heartbeat_at: resource.last_heartbeat_at,
                });
            } else {
                tracing::warn!(
                    resource_id = %resource.resource_id,
                    silent_secs = silent.num_seconds(),
                    "Agent unreachable"
                );
                self.store.put_resource(&resource)?;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::service::Governance;
    use crate::testing::{busy, harness, launch_spec, signal, Harness};
    use crate::types::LaunchOutcome;
    use chrono::Duration;
    use prism_core::{ActivityMetrics, ResourceId};
    use prism_provider::ProviderAction;
    use prism_store::PolicyOverride;

    async fn launched(h: &Harness, policy: &str) -> ResourceId {
        let mut spec = launch_spec(h.account_id, "ws");
        spec.policy_ref = Some(policy.to_string());
        match h.engine.launch_resource(&h.user, spec).await.unwrap() {
            LaunchOutcome::Launched { resource } => resource.resource_id,
            other => panic!("expected launch, got {other:?}"),
        }
    }

    /// Send quiet heartbeats once a minute for `minutes` minutes.
    async fn quiet_for(h: &Harness, id: ResourceId, first_seq: u64, minutes: u64) -> HeartbeatAck {
        let mut last = None;
        for i in 0..=minutes {
            if i > 0 {
                h.clock.advance(Duration::minutes(1));
            }
            last = Some(
                h.engine
                    .ingest(signal(id, first_seq + i, ActivityMetrics::quiet()))
                    .await
                    .unwrap(),
            );
        }
        last.unwrap()
    }

    #[tokio::test]
    async fn single_idle_sample_does_not_act() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;

        let reply = h
            .engine
            .ingest(signal(id, 1, ActivityMetrics::quiet()))
            .await
            .unwrap();
        assert!(reply.accepted);
        assert_eq!(reply.state, LifecycleState::Running);
        assert_eq!(h.provider.call_count(ProviderAction::Hibernate), 0);
    }

    #[tokio::test]
    async fn sustained_idleness_warns_then_hibernates() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;

        let reply = quiet_for(&h, id, 1, 15).await;
        assert_eq!(reply.state, LifecycleState::PendingIdleAction);
        let resource = h.engine.store().get_resource(&id).unwrap().unwrap();
        assert!(resource.idle.pending.is_some());

        let reply = quiet_for(&h, id, 100, 5).await;
        assert_eq!(reply.state, LifecycleState::Hibernated);
        assert_eq!(h.provider.call_count(ProviderAction::Hibernate), 1);
    }

    #[tokio::test]
    async fn activity_cancels_pending_action() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        quiet_for(&h, id, 1, 15).await;

        let reply = h.engine.ingest(signal(id, 50, busy())).await.unwrap();
        assert_eq!(reply.state, LifecycleState::Running);
        assert_eq!(reply.idle_for_secs, 0);

        let resource = h.engine.store().get_resource(&id).unwrap().unwrap();
        assert!(resource.idle.pending.is_none());
        assert_eq!(h.provider.call_count(ProviderAction::Hibernate), 0);
    }

    #[tokio::test]
    async fn stale_and_duplicate_sequences_are_dropped() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;

        assert!(h.engine.ingest(signal(id, 5, busy())).await.unwrap().accepted);
        let dup = h.engine.ingest(signal(id, 5, busy())).await.unwrap();
        assert!(!dup.accepted);
        assert_eq!(dup.reason.as_deref(), Some("stale sequence"));
        assert!(!h.engine.ingest(signal(id, 3, busy())).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn new_boot_id_resets_sequence_and_idle_history() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        quiet_for(&h, id, 10, 10).await;

        let mut rebooted = signal(id, 1, ActivityMetrics::quiet());
        rebooted.boot_id = 2;
        let reply = h.engine.ingest(rebooted).await.unwrap();
        assert!(reply.accepted);
        assert_eq!(reply.idle_for_secs, 0);
    }

    #[tokio::test]
    async fn connectivity_gap_resets_idle_history() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        quiet_for(&h, id, 1, 10).await;

        h.clock.advance(Duration::minutes(20));
        let reply = h
            .engine
            .ingest(signal(id, 20, ActivityMetrics::quiet()))
            .await
            .unwrap();
        assert_eq!(reply.state, LifecycleState::Running);
        assert_eq!(reply.idle_for_secs, 0);
    }

    #[tokio::test]
    async fn notify_policy_only_notifies() {
        let h = harness(100.0);
        let id = launched(&h, "notify-only").await;
        let mut rx = h.notifier.subscribe();

        let reply = quiet_for(&h, id, 1, 30).await;
        assert_eq!(reply.state, LifecycleState::Running);
        assert!(h.provider.calls().iter().all(|(a, _)| *a == ProviderAction::Start));

        let mut saw_notify = false;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, Notification::IdleAction { action: IdleAction::Notify, .. }) {
                saw_notify = true;
            }
        }
        assert!(saw_notify);
    }

    #[tokio::test]
    async fn disabled_override_never_warns() {
        let h = harness(100.0);
        let mut spec = launch_spec(h.account_id, "pinned");
        spec.policy_override = Some(PolicyOverride {
            disabled: true,
            ..PolicyOverride::default()
        });
        let LaunchOutcome::Launched { resource } =
            h.engine.launch_resource(&h.user, spec).await.unwrap()
        else {
            panic!("expected launch");
        };

        let reply = quiet_for(&h, resource.resource_id, 1, 90).await;
        assert_eq!(reply.state, LifecycleState::Running);
    }

    #[tokio::test]
    async fn resume_starts_idle_tracking_from_zero() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        quiet_for(&h, id, 1, 20).await;
        assert_eq!(
            h.engine.store().get_resource(&id).unwrap().unwrap().state,
            LifecycleState::Hibernated
        );

        let resumed = h
            .engine
            .request(&id, RequestedAction::Resume, Actor::User(h.user))
            .await
            .unwrap();
        assert_eq!(resumed.state, LifecycleState::Running);
        assert_eq!(resumed.idle.accumulator_secs, 0);
        assert!(resumed.idle.idle_since.is_none());

        // Ten quiet minutes after resume are not enough for a new warning.
        let mut rebooted = signal(id, 1, ActivityMetrics::quiet());
        rebooted.boot_id = 2;
        h.engine.ingest(rebooted).await.unwrap();
        let mut seq = 2;
        for _ in 0..10 {
            h.clock.advance(Duration::minutes(1));
            let mut s = signal(id, seq, ActivityMetrics::quiet());
            s.boot_id = 2;
            let reply = h.engine.ingest(s).await.unwrap();
            assert_eq!(reply.state, LifecycleState::Running);
            seq += 1;
        }
    }

    #[tokio::test]
    async fn silent_agents_become_unreachable_then_escalated() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        h.engine.ingest(signal(id, 1, busy())).await.unwrap();

        h.clock.advance(Duration::minutes(4));
        assert_eq!(h.engine.check_agents().await.unwrap(), 1);
        assert!(matches!(
            h.engine.idle_report(&id).await,
            Err(EngineError::AgentUnreachable(_))
        ));

        h.clock.advance(Duration::minutes(30));
        assert_eq!(h.engine.check_agents().await.unwrap(), 1);
        let flags = h.engine.operator_flags().await.unwrap();
        assert_eq!(flags.escalated_agents.len(), 1);

        // Already escalated: nothing new.
        assert_eq!(h.engine.check_agents().await.unwrap(), 0);

        h.engine.ingest(signal(id, 2, busy())).await.unwrap();
        let report = h.engine.idle_report(&id).await.unwrap();
        assert_eq!(report.agent_status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn tick_fires_due_pending_actions() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        quiet_for(&h, id, 1, 15).await;

        h.clock.advance(Duration::minutes(2));
        assert_eq!(h.engine.evaluate_pending().await.unwrap(), 0);

        h.clock.advance(Duration::minutes(3));
        assert_eq!(h.engine.evaluate_pending().await.unwrap(), 1);
        assert_eq!(
            h.engine.store().get_resource(&id).unwrap().unwrap().state,
            LifecycleState::Hibernated
        );
    }

    #[tokio::test]
    async fn terminated_resources_reject_heartbeats() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        h.engine
            .request(&id, RequestedAction::Terminate, Actor::User(h.user))
            .await
            .unwrap();

        let reply = h.engine.ingest(signal(id, 1, busy())).await.unwrap();
        assert!(!reply.accepted);
        assert_eq!(reply.state, LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn unknown_resource_heartbeat_creates_no_lock() {
        let h = harness(100.0);
        let before = h.engine.lock_count();

        for seq in 1..=5 {
            let unknown = ResourceId::generate(&prism_core::ProjectId::generate(), "ghost");
            assert!(matches!(
                h.engine.ingest(signal(unknown, seq, busy())).await,
                Err(EngineError::ResourceNotFound(_))
            ));
        }
        assert_eq!(h.engine.lock_count(), before);
    }

    #[tokio::test]
    async fn terminated_resource_locks_are_pruned() {
        let h = harness(100.0);
        let id = launched(&h, "balanced").await;
        let live = launched(&h, "gpu").await;
        h.engine
            .request(&id, RequestedAction::Terminate, Actor::User(h.user))
            .await
            .unwrap();
        assert_eq!(h.engine.lock_count(), 2);

        assert_eq!(h.engine.prune_locks(), 1);
        assert_eq!(h.engine.lock_count(), 1);
        h.engine.ingest(signal(live, 1, busy())).await.unwrap();
        assert_eq!(h.engine.lock_count(), 1);
    }
}
