//! Periodic background work.
//!
//! Three loops run beside the API: the evaluation tick (grace timers, agent
//! health, approval deadlines and reversions), the reconciliation pass, and
//! the accrual task that keeps running resources prepaid and posts the
//! monthly rollover. Each loop stops when the shutdown channel fires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use prism_core::BudgetPeriod;
use prism_provider::Provider;
use prism_store::{BillingWindow, CostEventKind, LifecycleState, Store};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::billing::{self, Posting};
use crate::lifecycle::is_billing_state;
use crate::error::Result;
use crate::ledger::LedgerUpdate;
use crate::service::GovernanceEngine;
use crate::types::TriggeredAction;

// =============================================================================
// Accrual
// =============================================================================

impl<S: Store, P: Provider> GovernanceEngine<S, P> {
    /// Extend the prepaid window of every billing resource close to its end.
    ///
    /// Returns the number of windows extended.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. Per-resource ledger errors are
    /// logged and skipped.
    pub async fn accrue_all(&self) -> Result<usize> {
        let mut candidates = self.store.list_resources_by_state(LifecycleState::Running)?;
        candidates.extend(
            self.store
                .list_resources_by_state(LifecycleState::PendingIdleAction)?,
        );

        let mut extended = 0;
        let mut triggered = Vec::new();
        for candidate in candidates {
            match self.extend_window(&candidate.resource_id).await {
                Ok(Some(mut fired)) => {
                    extended += 1;
                    triggered.append(&mut fired);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(resource_id = %candidate.resource_id, error = %e, "Accrual failed");
                }
            }
        }
        self.apply_budget_actions(&triggered).await;

        let now = self.now();
        let mut checkpoint = self.store.get_checkpoint()?;
        checkpoint.last_accrual_at = Some(now);
        self.store.put_checkpoint(&checkpoint)?;

        debug!(extended, "Accrual pass complete");
        Ok(extended)
    }

    async fn extend_window(&self, resource_id: &prism_core::ResourceId) -> Result<Option<Vec<TriggeredAction>>> {
        let lock = self.resource_lock(resource_id)?;
        let _guard = lock.lock().await;
        let mut resource = self.load(resource_id)?;
        if !is_billing_state(resource.state) || resource.in_flight.is_some() {
            return Ok(None);
        }
        let Some(window) = resource.billing else {
            return Ok(None);
        };

        let now = self.now();
        let Some(extension) = billing::extend(
            resource.spec.cost_rate,
            &window,
            now,
            self.config.billing_block(),
            self.config.billing_refresh(),
        ) else {
            return Ok(None);
        };

        resource.billing = Some(BillingWindow {
            opened_at: window.opened_at,
            billed_through: extension.billed_through,
        });
        resource.updated_at = now;

        let mut posting = Posting::for_resource(
            resource.resource_id,
            resource.account_id,
            CostEventKind::DebitRunning,
            extension.backfill + extension.advance,
        );
        if extension.backfill.is_positive() {
            posting = posting.with_note(format!("includes {} backfilled", extension.backfill));
        }
        let outcome = self
            .ledger
            .commit(LedgerUpdate::resource(resource).with_postings([posting]))?;
        Ok(Some(outcome.triggered))
    }

    /// Post the rollover for a period that has started since the last one.
    ///
    /// Returns whether a rollover ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn roll_period(&self) -> Result<bool> {
        let current = BudgetPeriod::containing(self.now());
        let mut checkpoint = self.store.get_checkpoint()?;
        if checkpoint.last_rollover_period == Some(current) {
            return Ok(false);
        }
        let posted = self.ledger.rollover()?;
        checkpoint.last_rollover_period = Some(current);
        self.store.put_checkpoint(&checkpoint)?;
        info!(period = %current, credits = posted.len(), "Period rolled over");
        Ok(true)
    }

    /// One evaluation tick: due idle actions, agent health, approval
    /// deadlines, time-limited reversions and hibernation schedules.
    pub async fn evaluation_tick(&self) {
        if let Err(e) = self.evaluate_pending().await {
            warn!(error = %e, "Idle evaluation failed");
        }
        if let Err(e) = self.check_agents().await {
            warn!(error = %e, "Agent health check failed");
        }
        if let Err(e) = self.expire_due().await {
            warn!(error = %e, "Approval expiry failed");
        }
        if let Err(e) = self.revert_due().await {
            warn!(error = %e, "Approval reversion failed");
        }
        match self.apply_schedules().await {
            Ok(issued) if issued > 0 => debug!(issued, "Schedule windows applied"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Schedule evaluation failed"),
        }
        let deferred = self.resume_deferred().await;
        if deferred > 0 {
            debug!(deferred, "Deferred requests replayed");
        }
        let pruned = self.prune_locks();
        if pruned > 0 {
            debug!(pruned, "Resource locks released");
        }
    }

    /// Replay deferred requests left behind on settled resources, e.g. by a
    /// restart between a provider call and its completion.
    async fn resume_deferred(&self) -> usize {
        let stranded = match self.store.list_all_resources() {
            Ok(resources) => resources
                .into_iter()
                .filter(|r| r.in_flight.is_none() && r.deferred.is_some())
                .map(|r| r.resource_id)
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(error = %e, "Cannot list resources");
                return 0;
            }
        };

        let mut queue = VecDeque::new();
        for resource_id in stranded {
            let Ok(lock) = self.resource_lock(&resource_id) else {
                continue;
            };
            let _guard = lock.lock().await;
            let Ok(mut resource) = self.load(&resource_id) else {
                continue;
            };
            if resource.in_flight.is_some() {
                continue;
            }
            if let Some(deferred) = resource.deferred.take() {
                resource.updated_at = self.now();
                if let Err(e) = self.store.put_resource(&resource) {
                    warn!(resource_id = %resource_id, error = %e, "Cannot clear deferred request");
                    continue;
                }
                queue.push_back((resource_id, deferred.action, deferred.requested_by));
            }
        }
        let replayed = queue.len();
        self.drain(queue).await;
        replayed
    }
}

// =============================================================================
// Loops
// =============================================================================

/// Handles to the spawned background loops.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn the evaluation, reconciliation and accrual loops.
    #[must_use]
    pub fn spawn<S, P>(engine: &Arc<GovernanceEngine<S, P>>, shutdown: &broadcast::Sender<()>) -> Self
    where
        S: Store + 'static,
        P: Provider + 'static,
    {
        let config = engine.config();
        let handles = vec![
            tokio::spawn(run_loop(
                "evaluation",
                StdDuration::from_secs(config.evaluation_tick_seconds.max(1)),
                Arc::clone(engine),
                shutdown.subscribe(),
                |engine| async move { engine.evaluation_tick().await },
            )),
            tokio::spawn(run_loop(
                "reconciliation",
                StdDuration::from_secs(config.reconcile_interval_seconds.max(1)),
                Arc::clone(engine),
                shutdown.subscribe(),
                |engine| async move {
                    match engine.reconcile_all().await {
                        Ok(summary) if summary.corrected > 0 => {
                            info!(checked = summary.checked, corrected = summary.corrected, "Reconciliation pass");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                    }
                },
            )),
            tokio::spawn(run_loop(
                "accrual",
                StdDuration::from_secs(config.accrual_interval_seconds.max(1)),
                Arc::clone(engine),
                shutdown.subscribe(),
                |engine| async move {
                    if let Err(e) = engine.roll_period() {
                        warn!(error = %e, "Rollover failed");
                    }
                    if let Err(e) = engine.accrue_all().await {
                        warn!(error = %e, "Accrual pass failed");
                    }
                },
            )),
        ];
        Self { handles }
    }

    /// Wait for every loop to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task panicked");
            }
        }
    }
}

async fn run_loop<S, P, F, Fut>(
    name: &'static str,
    period: StdDuration,
    engine: Arc<GovernanceEngine<S, P>>,
    mut shutdown: broadcast::Receiver<()>,
    body: F,
) where
    S: Store + 'static,
    P: Provider + 'static,
    F: Fn(Arc<GovernanceEngine<S, P>>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    info!(task = name, interval_secs = period.as_secs(), "Starting background task");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                body(Arc::clone(&engine)).await;
            }
            _ = shutdown.recv() => {
                info!(task = name, "Shutting down background task");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::service::Governance;
    use crate::testing::{harness, launch_spec, Harness};
    use chrono::Duration;
    use prism_core::Money;
    use prism_store::{Actor, RequestedAction};

    fn spend(h: &Harness) -> Money {
        h.engine
            .ledger()
            .own_spend(&h.account_id, BudgetPeriod::containing(h.clock.now()))
            .unwrap()
    }

    #[tokio::test]
    async fn accrual_extends_windows_near_their_end() {
        let h = harness(100.0);
        h.engine
            .launch(&h.user, launch_spec(h.account_id, "a"))
            .await
            .unwrap();
        assert_eq!(spend(&h), Money::from_dollars(0.10));

        h.clock.advance(Duration::minutes(30));
        assert_eq!(h.engine.accrue_all().await.unwrap(), 0);

        h.clock.advance(Duration::minutes(25));
        assert_eq!(h.engine.accrue_all().await.unwrap(), 1);
        assert_eq!(spend(&h), Money::from_dollars(0.20));

        let checkpoint = h.engine.store().get_checkpoint().unwrap();
        assert_eq!(checkpoint.last_accrual_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn accrual_backfills_missed_time() {
        let h = harness(100.0);
        h.engine
            .launch(&h.user, launch_spec(h.account_id, "a"))
            .await
            .unwrap();

        h.clock.advance(Duration::hours(3));
        assert_eq!(h.engine.accrue_all().await.unwrap(), 1);
        // 1h prepaid, 2h backfilled, 1h next block.
        assert_eq!(spend(&h), Money::from_dollars(0.40));
    }

    #[tokio::test]
    async fn stopped_resources_do_not_accrue() {
        let h = harness(100.0);
        let launched = h
            .engine
            .launch(&h.user, launch_spec(h.account_id, "a"))
            .await
            .unwrap();
        let crate::types::LaunchOutcome::Launched { resource } = launched else {
            panic!("expected a launch");
        };
        h.engine
            .request(&resource.resource_id, RequestedAction::Stop, Actor::System)
            .await
            .unwrap();

        h.clock.advance(Duration::hours(2));
        assert_eq!(h.engine.accrue_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn block_bought_before_month_end_never_credits_the_new_month() {
        use chrono::TimeZone;

        let h = harness(100.0);
        let month_end = chrono::Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        h.clock.set(month_end - Duration::minutes(20));
        let launched = h
            .engine
            .launch(&h.user, launch_spec(h.account_id, "a"))
            .await
            .unwrap();
        let crate::types::LaunchOutcome::Launched { resource } = launched else {
            panic!("expected a launch");
        };
        let twenty_minutes = resource.spec.cost_rate.cost_for(Duration::minutes(20));

        h.clock.set(month_end - Duration::minutes(5));
        assert_eq!(h.engine.accrue_all().await.unwrap(), 0);

        h.clock.set(month_end + Duration::minutes(20));
        h.engine.roll_period().unwrap();
        h.engine
            .request(&resource.resource_id, RequestedAction::Hibernate, Actor::System)
            .await
            .unwrap();

        let ledger = h.engine.ledger();
        let march = BudgetPeriod::containing(month_end - Duration::minutes(1));
        assert_eq!(ledger.own_spend(&h.account_id, march).unwrap(), twenty_minutes);
        let april = ledger.own_spend(&h.account_id, march.next()).unwrap();
        assert!(!april.is_negative());
        assert_eq!(april, twenty_minutes);
    }

    #[test]
    fn rollover_runs_once_per_period() {
        let h = harness(100.0);
        assert!(h.engine.roll_period().unwrap());
        assert!(!h.engine.roll_period().unwrap());

        h.clock.advance(Duration::days(31));
        assert!(h.engine.roll_period().unwrap());
        let checkpoint = h.engine.store().get_checkpoint().unwrap();
        assert_eq!(
            checkpoint.last_rollover_period,
            Some(BudgetPeriod::containing(h.clock.now()))
        );
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let h = harness(100.0);
        let (shutdown, _) = broadcast::channel(1);
        let tasks = BackgroundTasks::spawn(&h.engine, &shutdown);

        tokio::task::yield_now().await;
        shutdown.send(()).unwrap();
        tokio::time::timeout(StdDuration::from_secs(5), tasks.join())
            .await
            .unwrap();
    }
}
