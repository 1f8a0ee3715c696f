//! Approval workflow for over-quota launches.
//!
//! A launch over a soft limit becomes a pending [`ApprovalRequest`]. The first
//! decision wins: deciding again returns the stored outcome. Requests left
//! undecided past their deadline are auto-denied. An approved launch skips the
//! budget check, and may carry a time limit after which its resource is
//! stopped or terminated.

use chrono::Duration;
use prism_core::{ApprovalId, Money, UserId};
use prism_provider::Provider;
use prism_store::{
    Actor, ApprovalRequest, ApprovalStatus, AuditEntry, CostEventKind, LaunchSpec, LifecycleState,
    ManagedResource, RequestedAction, RevertAction, ScheduledReversion, Store,
};

use crate::billing::Posting;
use crate::error::{EngineError, Result};
use crate::ledger::LedgerUpdate;
use crate::notify::Notification;
use crate::policy;
use crate::service::GovernanceEngine;
use crate::types::{ApprovalDecision, ApprovalVerdict, BudgetDenial, TriggeredAction};

impl<S: Store, P: Provider> GovernanceEngine<S, P> {
    fn approval_audit(&self, actor: Actor, approval: &ApprovalRequest, action: &str, detail: String) -> AuditEntry {
        AuditEntry {
            at: self.now(),
            actor,
            resource_id: approval.resource_id,
            account_id: Some(approval.account_id),
            action: action.to_string(),
            detail,
        }
    }

    /// Record an over-quota launch as a pending approval request.
    pub(crate) fn submit_approval(
        &self,
        requester: &UserId,
        spec: LaunchSpec,
        denial: &BudgetDenial,
    ) -> Result<ApprovalRequest> {
        let now = self.now();
        let approval = ApprovalRequest {
            approval_id: ApprovalId::generate(),
            requester: *requester,
            account_id: spec.account_id,
            requested: spec,
            reason: denial.summary(),
            status: ApprovalStatus::Pending,
            time_limit_minutes: None,
            revert_action: RevertAction::default(),
            approver: None,
            decided_at: None,
            decision_note: None,
            resource_id: None,
            created_at: now,
            expires_at: now + self.config.approval_timeout(),
        };
        self.store.put_approval(&approval)?;

        let audit = self.approval_audit(
            Actor::User(*requester),
            &approval,
            "approval_requested",
            format!("{}: {}", approval.approval_id, approval.reason),
        );
        self.ledger.commit(LedgerUpdate {
            audit: vec![audit],
            ..LedgerUpdate::default()
        })?;

        tracing::info!(
            approval_id = %approval.approval_id,
            account_id = %approval.account_id,
            reason = %approval.reason,
            "Launch routed to approval"
        );
        self.notifier.notify(Notification::ApprovalNeeded {
            approval_id: approval.approval_id,
            account_id: approval.account_id,
            reason: approval.reason.clone(),
        });
        Ok(approval)
    }

    /// Approve or deny a pending request.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ApprovalNotFound`, `EngineError::ApprovalTimeout`
    /// when the deadline has passed, or `EngineError::LedgerInconsistency`
    /// when the account is frozen.
    pub async fn decide(
        &self,
        approval_id: &ApprovalId,
        approver: &UserId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest> {
        let (approval, launch) = {
            let _guard = self.decisions.lock().await;
            let mut approval = self
                .store
                .get_approval(approval_id)?
                .ok_or(EngineError::ApprovalNotFound(*approval_id))?;

            if approval.status.is_decided() {
                tracing::debug!(approval_id = %approval_id, status = ?approval.status, "Approval already decided");
                return Ok(approval);
            }

            let now = self.now();
            if now >= approval.expires_at {
                self.expire(&mut approval)?;
                return Err(EngineError::ApprovalTimeout(*approval_id));
            }

            approval.approver = Some(*approver);
            approval.decided_at = Some(now);
            approval.decision_note = decision.note;

            match decision.verdict {
                ApprovalVerdict::Deny => {
                    approval.status = ApprovalStatus::Denied;
                    self.store.put_approval(&approval)?;
                    let audit = self.approval_audit(
                        Actor::User(*approver),
                        &approval,
                        "approval_denied",
                        approval.decision_note.clone().unwrap_or_default(),
                    );
                    self.ledger.commit(LedgerUpdate {
                        audit: vec![audit],
                        ..LedgerUpdate::default()
                    })?;
                    (approval, None)
                }
                ApprovalVerdict::Approve => {
                    self.ledger.ensure_mutable(&approval.account_id)?;
                    approval.status = ApprovalStatus::Approved;
                    approval.time_limit_minutes = decision.time_limit_minutes;
                    approval.revert_action = decision.revert_action;
                    let launched = self.approved_resource(&mut approval, approver)?;
                    (approval, Some(launched))
                }
            }
        };

        tracing::info!(
            approval_id = %approval_id,
            approver = %approver,
            status = ?approval.status,
            "Approval decided"
        );
        self.notifier.notify(Notification::ApprovalDecided {
            approval_id: *approval_id,
            status: approval.status,
        });

        if let Some((resource, triggered)) = launch {
            self.apply_budget_actions(&triggered).await;
            let resource_id = resource.resource_id;
            if let Err(e) = self
                .provision(resource, Actor::Approval(*approval_id))
                .await
            {
                tracing::warn!(
                    approval_id = %approval_id,
                    resource_id = %resource_id,
                    error = %e,
                    "Approved launch failed at the provider"
                );
            }
        }
        Ok(approval)
    }

    /// Persist the approval and the resource it launches in one write. On
    /// error the stored request is still pending.
    fn approved_resource(
        &self,
        approval: &mut ApprovalRequest,
        approver: &UserId,
    ) -> Result<(ManagedResource, Vec<TriggeredAction>)> {
        let now = self.now();
        let policy_ref = policy::policy_for_launch(
            self.store.as_ref(),
            &approval.requested,
            &self.config.default_policy,
        )?;
        let actor = Actor::Approval(approval.approval_id);
        let mut resource = self.new_resource(&approval.requested, policy_ref, &actor);
        resource.approval_id = Some(approval.approval_id);
        resource.revert = approval.time_limit_minutes.map(|minutes| ScheduledReversion {
            at: now + Duration::minutes(i64::from(minutes)),
            action: approval.revert_action,
        });
        approval.resource_id = Some(resource.resource_id);

        let adjustment = Posting::for_resource(
            resource.resource_id,
            resource.account_id,
            CostEventKind::ApprovalAdjustment,
            Money::ZERO,
        )
        .with_note(format!("launch approved by {approver} under {}", approval.approval_id));
        let audit = self.approval_audit(
            Actor::User(*approver),
            approval,
            "approval_granted",
            approval
                .time_limit_minutes
                .map_or_else(|| "no time limit".to_string(), |m| format!("time limit {m} minutes")),
        );

        let outcome = self.ledger.commit(
            LedgerUpdate::resource(resource.clone())
                .with_postings([adjustment])
                .with_audit(audit)
                .with_approval(approval.clone()),
        )?;
        Ok((resource, outcome.triggered))
    }

    fn expire(&self, approval: &mut ApprovalRequest) -> Result<()> {
        approval.status = ApprovalStatus::Expired;
        approval.decided_at = Some(self.now());
        self.store.put_approval(approval)?;
        let audit = self.approval_audit(
            Actor::System,
            approval,
            "approval_expired",
            format!("undecided since {}", approval.created_at),
        );
        self.ledger.commit(LedgerUpdate {
            audit: vec![audit],
            ..LedgerUpdate::default()
        })?;
        tracing::info!(approval_id = %approval.approval_id, "Approval expired");
        self.notifier.notify(Notification::ApprovalDecided {
            approval_id: approval.approval_id,
            status: ApprovalStatus::Expired,
        });
        Ok(())
    }

    /// Auto-deny pending requests past their deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn expire_due(&self) -> Result<usize> {
        let _guard = self.decisions.lock().await;
        let now = self.now();
        let mut expired = 0;
        for mut approval in self.store.list_approvals_by_status(ApprovalStatus::Pending)? {
            if approval.expires_at <= now {
                self.expire(&mut approval)?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Stop or terminate resources whose approval time limit has run out.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn revert_due(&self) -> Result<usize> {
        let now = self.now();
        let mut reverted = 0;
        for resource in self.store.list_all_resources()? {
            let Some(revert) = resource.revert else {
                continue;
            };
            if revert.at > now || resource.state == LifecycleState::Terminated {
                continue;
            }
            let actor = resource
                .approval_id
                .map_or(Actor::System, Actor::Approval);
            let action = match revert.action {
                RevertAction::Stop => RequestedAction::Stop,
                RevertAction::Terminate => RequestedAction::Terminate,
            };

            tracing::info!(resource_id = %resource.resource_id, ?action, "Approval time limit reached");
            match self.request(&resource.resource_id, action, actor).await {
                Ok(_) => reverted += 1,
                Err(e) if e.is_retriable() => {
                    tracing::warn!(resource_id = %resource.resource_id, error = %e, "Reversion postponed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(resource_id = %resource.resource_id, error = %e, "Reversion failed");
                }
            }
            self.clear_revert(&resource.resource_id).await?;
        }
        Ok(reverted)
    }

    async fn clear_revert(&self, resource_id: &prism_core::ResourceId) -> Result<()> {
        let lock = self.resource_lock(resource_id)?;
        let _guard = lock.lock().await;
        let mut resource = self.load(resource_id)?;
        if resource.revert.take().is_some() {
            resource.updated_at = self.now();
            self.store.put_resource(&resource)?;
        }
        Ok(())
    }
}
