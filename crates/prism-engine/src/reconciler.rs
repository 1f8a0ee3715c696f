//! Provider reconciliation.
//!
//! The provider is the source of truth for what is running. A reconciliation
//! check describes one resource and repairs the local record:
//!
//! - agreement brings billing accrual up to date
//! - a local transition younger than the grace window is left alone
//! - a ledger post that failed earlier is retried
//! - any other disagreement adopts the provider's state, closing or opening
//!   billing at the time the provider says the change happened
//! - a terminated resource the provider still reports alive is escalated
//!
//! At daemon start every non-terminated resource is first marked `Unknown`
//! and then reconciled, so nothing is billed on a stale belief.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use prism_core::ResourceId;
use prism_provider::{Provider, ProviderStatus};
use prism_store::{
    Actor, JournalEntry, LifecycleState, ManagedResource, ProviderState, ReconciliationRecord,
    Resolution, Store,
};

use crate::billing::{self, Posting};
use crate::error::Result;
use crate::ledger::LedgerUpdate;
use crate::lifecycle::{is_stable, is_transitional, stable_equivalent};
use crate::machine::Work;
use crate::notify::Notification;
use crate::service::GovernanceEngine;
use crate::types::ReconcileSummary;

/// How long terminated resources keep being checked for drift.
const TERMINATED_WATCH_HOURS: i64 = 24;

/// The local state matching what the provider reports.
///
/// A provider `Pending` is the tail of a launch for a `Provisioning` resource
/// and of a start or resume otherwise.
#[must_use]
pub const fn local_state_for(observed: ProviderState, local: LifecycleState) -> LifecycleState {
    match observed {
        ProviderState::Pending => match local {
            LifecycleState::Provisioning => LifecycleState::Provisioning,
            _ => LifecycleState::Resuming,
        },
        ProviderState::Running => LifecycleState::Running,
        ProviderState::Stopping => LifecycleState::Stopping,
        ProviderState::Stopped => LifecycleState::Stopped,
        ProviderState::Hibernating => LifecycleState::Hibernating,
        ProviderState::Hibernated => LifecycleState::Hibernated,
        ProviderState::ShuttingDown => LifecycleState::Terminating,
        ProviderState::Terminated | ProviderState::NotFound => LifecycleState::Terminated,
    }
}

/// Whether `local` and `observed` describe the same thing.
const fn agrees(local: LifecycleState, observed: LifecycleState) -> bool {
    matches!(
        (local, observed),
        (LifecycleState::PendingIdleAction, LifecycleState::Running)
    ) || local as u8 == observed as u8
}

impl<S: Store, P: Provider> GovernanceEngine<S, P> {
    /// Reconcile one resource against the provider.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ResourceNotFound`, a store or ledger error, or
    /// the provider error when a terminated resource cannot be described.
    pub async fn reconcile(&self, resource_id: &ResourceId) -> Result<ReconciliationRecord> {
        let lock = self.resource_lock(resource_id)?;

        let snapshot = {
            let _guard = lock.lock().await;
            let resource = self.load(resource_id)?;
            if resource.in_flight.is_some() {
                return Ok(self.record(&resource, None, Resolution::WithinGraceWindow));
            }
            resource
        };

        let described = self.describe(&snapshot.provider_id).await;

        let mut queue = VecDeque::new();
        let record = {
            let _guard = lock.lock().await;
            let mut resource = self.load(resource_id)?;
            if resource.in_flight.is_some() || resource.state != snapshot.state {
                tracing::debug!(resource_id = %resource_id, "Resource moved during describe, skipping");
                return Ok(self.record(&resource, None, Resolution::WithinGraceWindow));
            }

            match described {
                Ok(status) => {
                    self.cache.record(&resource.provider_id, status.clone(), self.now());
                    self.compare(&mut resource, &status, &mut queue)?
                }
                Err(e) => {
                    if resource.state == LifecycleState::Terminated {
                        return Err(e.into());
                    }
                    self.mark_failed(&mut resource, &e.to_string())?
                }
            }
        };
        self.drain(queue).await;

        if record.is_correction() {
            tracing::info!(
                resource_id = %resource_id,
                local = ?record.local_state_at_check,
                provider = ?record.provider_state_observed,
                resolution = ?record.resolution_applied,
                "Reconciliation corrected resource"
            );
        }
        Ok(record)
    }

    fn record(
        &self,
        resource: &ManagedResource,
        observed: Option<ProviderState>,
        resolution: Resolution,
    ) -> ReconciliationRecord {
        let now = self.now();
        let drift = !matches!(
            resolution,
            Resolution::InSync | Resolution::WithinGraceWindow | Resolution::BackfilledAccrual { .. }
        );
        ReconciliationRecord {
            resource_id: resource.resource_id,
            local_state_at_check: resource.state,
            provider_state_observed: observed,
            drift_detected_at: drift.then_some(now),
            resolution_applied: resolution,
            checked_at: now,
        }
    }

    /// Append a correction to the journal.
    fn journal(&self, record: &ReconciliationRecord) -> Result<()> {
        self.store
            .append_journal(&JournalEntry::Reconciliation(record.clone()))?;
        Ok(())
    }

    fn compare(
        &self,
        resource: &mut ManagedResource,
        status: &ProviderStatus,
        queue: &mut VecDeque<Work>,
    ) -> Result<ReconciliationRecord> {
        let now = self.now();
        let local = resource.state;
        let observed = local_state_for(status.state, local);
        let at = status.changed_at.unwrap_or(now);
        let seen = Some(status.state);

        if local == LifecycleState::Terminated {
            if observed == LifecycleState::Terminated {
                if resource.drift.take().is_some() {
                    tracing::info!(resource_id = %resource.resource_id, "Drift conflict resolved");
                    resource.updated_at = now;
                    self.store.put_resource(resource)?;
                }
                return Ok(self.record(resource, seen, Resolution::InSync));
            }
            return self.escalate(resource, status);
        }

        let record = if agrees(local, observed) {
            let resolution = self.accrue(resource, now)?;
            self.record(resource, seen, resolution)
        } else if resource.needs_reconciliation && is_stable(observed) {
            let record = self.record(resource, seen, Resolution::LedgerPostRetried);
            let audit = self.audit(
                Actor::Reconciler,
                resource,
                "ledger_post_retried",
                format!("{local:?} -> {observed:?}"),
            );
            let triggered = self.commit_settled(resource, observed, at, audit)?;
            self.queue_budget_actions(&triggered, queue);
            record
        } else if is_transitional(local)
            && now - resource.last_transition_at < self.config.reconcile_grace()
        {
            self.record(resource, seen, Resolution::WithinGraceWindow)
        } else if local == LifecycleState::Unknown && resource.prior_stable_state == Some(observed) {
            let record = self.record(resource, seen, Resolution::InSync);
            let audit = self.audit(
                Actor::Reconciler,
                resource,
                "state_restored",
                format!("Unknown -> {observed:?}"),
            );
            let triggered = self.commit_settled(resource, observed, at, audit)?;
            self.queue_budget_actions(&triggered, queue);
            ReconciliationRecord {
                resolution_applied: self.accrue(resource, now)?,
                ..record
            }
        } else if local == LifecycleState::Failed && !is_stable(observed) {
            self.record(resource, seen, Resolution::InSync)
        } else {
            let record = self.record(resource, seen, Resolution::AdoptedProviderState { to: observed });
            self.adopt(resource, observed, at, queue)?;
            record
        };

        if record.is_correction() {
            self.journal(&record)?;
        }
        Ok(record)
    }

    /// Bring an open billing window up to date.
    fn accrue(&self, resource: &mut ManagedResource, now: DateTime<Utc>) -> Result<Resolution> {
        let Some(window) = resource.billing else {
            return Ok(Resolution::InSync);
        };
        let Some(extension) = billing::extend(
            resource.spec.cost_rate,
            &window,
            now,
            self.config.billing_block(),
            self.config.billing_refresh(),
        ) else {
            return Ok(Resolution::InSync);
        };
        if !extension.backfill.is_positive() {
            return Ok(Resolution::InSync);
        }

        let amount = extension.backfill + extension.advance;
        let mut next = resource.clone();
        next.billing = Some(prism_store::BillingWindow {
            opened_at: window.opened_at,
            billed_through: extension.billed_through,
        });
        next.updated_at = now;
        let posting = Posting::for_resource(
            next.resource_id,
            next.account_id,
            prism_store::CostEventKind::DebitRunning,
            amount,
        )
        .with_note(format!("accrual backfilled from {}", window.billed_through));
        let audit = self.audit(Actor::Reconciler, &next, "accrual_backfilled", amount.to_string());
        self.ledger.commit(
            LedgerUpdate::resource(next.clone())
                .with_postings([posting])
                .with_audit(audit),
        )?;
        *resource = next;
        Ok(Resolution::BackfilledAccrual { amount })
    }

    /// Replace the local state with the provider's.
    fn adopt(
        &self,
        resource: &mut ManagedResource,
        observed: LifecycleState,
        at: DateTime<Utc>,
        queue: &mut VecDeque<Work>,
    ) -> Result<()> {
        let from = resource.state;
        let audit = self.audit(
            Actor::Reconciler,
            resource,
            "provider_state_adopted",
            format!("{from:?} -> {observed:?} (provider changed at {at})"),
        );
        tracing::warn!(
            resource_id = %resource.resource_id,
            from = ?from,
            to = ?observed,
            %at,
            "Adopting provider state"
        );

        if is_stable(observed) {
            let triggered = self.commit_settled(resource, observed, at, audit)?;
            self.queue_budget_actions(&triggered, queue);
        } else {
            let now = self.now();
            if let Some(stable) = stable_equivalent(from) {
                resource.prior_stable_state = Some(stable);
            }
            resource.state = observed;
            resource.idle.pending = None;
            resource.last_transition_at = now;
            resource.updated_at = now;
            self.ledger
                .commit(LedgerUpdate::resource(resource.clone()).with_audit(audit))?;
        }
        Ok(())
    }

    /// Record a terminated resource the provider still reports alive. Only
    /// the first sighting is journaled and notified; its time is kept across
    /// restarts on the resource record.
    fn escalate(&self, resource: &mut ManagedResource, status: &ProviderStatus) -> Result<ReconciliationRecord> {
        let reason = format!(
            "resource is terminated locally but the provider reports {:?}",
            status.state
        );
        let mut record = self.record(
            resource,
            Some(status.state),
            Resolution::Escalated {
                reason: reason.clone(),
            },
        );
        if let Some(first) = &resource.drift {
            record.drift_detected_at = first.drift_detected_at;
            return Ok(record);
        }

        resource.drift = Some(record.clone());
        resource.updated_at = record.checked_at;
        self.store.put_resource(resource)?;
        tracing::error!(resource_id = %resource.resource_id, %reason, "Drift escalated");
        self.journal(&record)?;
        self.notifier.notify(Notification::DriftEscalated {
            resource_id: resource.resource_id,
            detail: reason,
        });
        Ok(record)
    }

    fn mark_failed(&self, resource: &mut ManagedResource, error: &str) -> Result<ReconciliationRecord> {
        let record = self.record(
            resource,
            None,
            Resolution::MarkedFailed {
                error: error.to_string(),
            },
        );
        if resource.state == LifecycleState::Failed {
            return Ok(record);
        }
        if let Some(stable) = stable_equivalent(resource.state) {
            resource.prior_stable_state = Some(stable);
        }
        self.fail(resource, error, Actor::Reconciler)?;
        self.journal(&record)?;
        Ok(record)
    }

    /// Reconcile every live resource, those terminated in the last day, and
    /// terminated ones with an open drift conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource list cannot be read; individual
    /// failures are logged and counted.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary> {
        let cutoff = self.now() - Duration::hours(TERMINATED_WATCH_HOURS);
        let ids: Vec<ResourceId> = self
            .store
            .list_all_resources()?
            .into_iter()
            .filter(|r| {
                r.state != LifecycleState::Terminated
                    || r.last_transition_at >= cutoff
                    || r.drift.is_some()
            })
            .map(|r| r.resource_id)
            .collect();

        let results: Vec<(ResourceId, Result<ReconciliationRecord>)> = stream::iter(ids)
            .map(|id| async move { (id, self.reconcile(&id).await) })
            .buffer_unordered(self.config.reconcile_concurrency.max(1))
            .collect()
            .await;

        let mut summary = ReconcileSummary::default();
        for (id, result) in results {
            summary.checked += 1;
            match result {
                Ok(record) => match record.resolution_applied {
                    Resolution::InSync | Resolution::WithinGraceWindow => summary.in_sync += 1,
                    Resolution::MarkedFailed { .. } => summary.failed += 1,
                    Resolution::Escalated { .. } => summary.escalated += 1,
                    _ => summary.corrected += 1,
                },
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(resource_id = %id, error = %e, "Reconciliation failed");
                }
            }
        }

        tracing::info!(
            checked = summary.checked,
            in_sync = summary.in_sync,
            corrected = summary.corrected,
            failed = summary.failed,
            escalated = summary.escalated,
            "Reconciliation pass complete"
        );
        Ok(summary)
    }

    /// Suspend local belief about every live resource and reconcile it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn startup(&self) -> Result<ReconcileSummary> {
        let mut marked = 0usize;
        for candidate in self.store.list_all_resources()? {
            if candidate.state == LifecycleState::Terminated {
                continue;
            }
            let lock = self.resource_lock(&candidate.resource_id)?;
            let _guard = lock.lock().await;
            let mut resource = self.load(&candidate.resource_id)?;
            if resource.state != LifecycleState::Unknown {
                if let Some(stable) = stable_equivalent(resource.state) {
                    resource.prior_stable_state = Some(stable);
                }
                resource.state = LifecycleState::Unknown;
            }
            resource.in_flight = None;
            resource.deferred = None;
            resource.idle.pending = None;
            resource.updated_at = self.now();
            self.store.put_resource(&resource)?;
            marked += 1;
        }
        tracing::info!(resources = marked, "Marked resources unknown pending reconciliation");
        self.reconcile_all().await
    }
}
