//! Time-based hibernation schedules.
//!
//! A policy may name recurring windows during which its resources sleep
//! whatever their load. When a window opens, a running resource is hibernated
//! or stopped and the sleep is recorded on the resource; when it closes, the
//! resource is resumed if the schedule asks for it. A resource someone starts
//! inside the window is left alone until the window closes.
//!
//! Schedules are evaluated on the evaluation tick and act through the normal
//! request path, so budget checks, deferral and auditing all apply.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use prism_core::ResourceId;
use prism_provider::Provider;
use prism_store::{
    Actor, HibernationSchedule, IdleAction, LifecycleState, ManagedResource, RequestedAction,
    ResourceKind, ScheduleKind, ScheduledSleep, Store, WakeAction,
};

use crate::error::{EngineError, Result};
use crate::notify::Notification;
use crate::policy;
use crate::service::GovernanceEngine;

const WORK_DAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Largest accepted distance from UTC, in minutes.
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Parse an `HH:MM` time of day.
///
/// # Errors
///
/// Returns `EngineError::InvalidRequest` if `value` is not a valid time.
pub fn parse_clock(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| {
        EngineError::InvalidRequest(format!("invalid time of day {value:?}, expected HH:MM"))
    })
}

/// Check a schedule before its policy is stored.
///
/// # Errors
///
/// Returns `EngineError::InvalidRequest` for an empty name, malformed or
/// empty windows, an out-of-range UTC offset, or a `notify` action.
pub fn validate_schedule(schedule: &HibernationSchedule) -> Result<()> {
    if schedule.name.trim().is_empty() {
        return Err(EngineError::InvalidRequest("schedule name must not be empty".into()));
    }
    let start = parse_clock(&schedule.start)?;
    let end = parse_clock(&schedule.end)?;
    match schedule.kind {
        ScheduleKind::WorkHours if start >= end => {
            return Err(EngineError::InvalidRequest(format!(
                "schedule {}: work hours must start before they end",
                schedule.name
            )));
        }
        ScheduleKind::Daily | ScheduleKind::Weekly if start == end => {
            return Err(EngineError::InvalidRequest(format!(
                "schedule {}: window is empty",
                schedule.name
            )));
        }
        _ => {}
    }
    if schedule.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(EngineError::InvalidRequest(format!(
            "schedule {}: UTC offset out of range",
            schedule.name
        )));
    }
    if schedule.action == IdleAction::Notify {
        return Err(EngineError::InvalidRequest(format!(
            "schedule {}: action must be hibernate or stop",
            schedule.name
        )));
    }
    Ok(())
}

fn applies(days: &[Weekday], day: Weekday, default: &[Weekday]) -> bool {
    if days.is_empty() {
        default.contains(&day)
    } else {
        days.contains(&day)
    }
}

/// Whether the schedule's sleep window is open at `at`.
///
/// A malformed schedule is never open.
#[must_use]
pub fn window_open(schedule: &HibernationSchedule, at: DateTime<Utc>) -> bool {
    let (Ok(start), Ok(end)) = (parse_clock(&schedule.start), parse_clock(&schedule.end)) else {
        return false;
    };
    let local = at.naive_utc() + Duration::minutes(i64::from(schedule.utc_offset_minutes));
    let day = local.weekday();
    let time = local.time();

    match schedule.kind {
        ScheduleKind::WorkHours => {
            let working = applies(&schedule.days, day, &WORK_DAYS);
            !(working && start <= time && time < end)
        }
        ScheduleKind::Daily | ScheduleKind::Weekly => {
            if start < end {
                applies(&schedule.days, day, &ALL_DAYS) && start <= time && time < end
            } else {
                // Spans midnight: the tail belongs to the previous day.
                (applies(&schedule.days, day, &ALL_DAYS) && time >= start)
                    || (applies(&schedule.days, day.pred(), &ALL_DAYS) && time < end)
            }
        }
    }
}

/// The first schedule whose window is open at `at`.
#[must_use]
pub fn active_schedule(schedules: &[HibernationSchedule], at: DateTime<Utc>) -> Option<&HibernationSchedule> {
    schedules.iter().find(|schedule| window_open(schedule, at))
}

impl<S: Store, P: Provider> GovernanceEngine<S, P> {
    /// Open and close schedule windows for every live resource.
    ///
    /// Returns the number of sleep and wake requests issued.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource list cannot be read. Per-resource
    /// failures are logged and retried on the next tick.
    pub async fn apply_schedules(&self) -> Result<usize> {
        let now = self.now();
        let mut issued = 0;
        for resource in self.store.list_all_resources()? {
            if matches!(
                resource.state,
                LifecycleState::Terminated | LifecycleState::Failed | LifecycleState::Unknown
            ) {
                continue;
            }
            match self.apply_schedule(&resource, now).await {
                Ok(true) => issued += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(resource_id = %resource.resource_id, error = %e, "Schedule evaluation failed");
                }
            }
        }
        Ok(issued)
    }

    async fn apply_schedule(&self, resource: &ManagedResource, now: DateTime<Utc>) -> Result<bool> {
        let effective = policy::resolve(self.store.as_ref(), resource, &self.config.default_policy)?;
        let open = if effective.disabled {
            None
        } else {
            active_schedule(&effective.schedules, now)
        };

        match (open, resource.scheduled.as_ref()) {
            (Some(schedule), None) => self.sleep(resource, schedule, now).await,
            (Some(_), Some(sleep)) => {
                let woken = matches!(
                    resource.state,
                    LifecycleState::Running | LifecycleState::PendingIdleAction
                );
                if woken && !sleep.overridden && resource.in_flight.is_none() {
                    tracing::info!(
                        resource_id = %resource.resource_id,
                        schedule = %sleep.schedule,
                        "Started inside its sleep window, leaving it running"
                    );
                    let mut sleep = sleep.clone();
                    sleep.overridden = true;
                    self.set_scheduled(&resource.resource_id, Some(sleep)).await?;
                }
                Ok(false)
            }
            (None, Some(sleep)) => self.wake(resource, sleep).await,
            (None, None) => Ok(false),
        }
    }

    async fn sleep(
        &self,
        resource: &ManagedResource,
        schedule: &HibernationSchedule,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if resource.in_flight.is_some()
            || !matches!(
                resource.state,
                LifecycleState::Running | LifecycleState::PendingIdleAction
            )
        {
            return Ok(false);
        }
        let action = match schedule.action {
            IdleAction::Hibernate if resource.spec.kind == ResourceKind::Compute => {
                RequestedAction::Hibernate
            }
            _ => RequestedAction::Stop,
        };

        tracing::info!(
            resource_id = %resource.resource_id,
            schedule = %schedule.name,
            ?action,
            "Schedule window opened"
        );
        self.request(&resource.resource_id, action, Actor::Schedule)
            .await?;
        self.set_scheduled(
            &resource.resource_id,
            Some(ScheduledSleep {
                schedule: schedule.name.clone(),
                wake: schedule.wake,
                since: now,
                overridden: false,
            }),
        )
        .await?;
        self.notifier.notify(Notification::ScheduleApplied {
            resource_id: resource.resource_id,
            schedule: schedule.name.clone(),
            action,
        });
        Ok(true)
    }

    async fn wake(&self, resource: &ManagedResource, sleep: &ScheduledSleep) -> Result<bool> {
        if resource.in_flight.is_some() {
            return Ok(false);
        }
        let asleep = matches!(
            resource.state,
            LifecycleState::Hibernated | LifecycleState::Stopped
        );
        let mut woke = false;
        if sleep.wake == WakeAction::Resume && !sleep.overridden && asleep {
            tracing::info!(
                resource_id = %resource.resource_id,
                schedule = %sleep.schedule,
                "Schedule window closed, resuming"
            );
            match self
                .request(&resource.resource_id, RequestedAction::Resume, Actor::Schedule)
                .await
            {
                Ok(_) => {
                    woke = true;
                    self.notifier.notify(Notification::ScheduleApplied {
                        resource_id: resource.resource_id,
                        schedule: sleep.schedule.clone(),
                        action: RequestedAction::Resume,
                    });
                }
                Err(e) if e.is_retriable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        resource_id = %resource.resource_id,
                        schedule = %sleep.schedule,
                        error = %e,
                        "Scheduled wake refused, leaving resource asleep"
                    );
                }
            }
        }
        self.set_scheduled(&resource.resource_id, None).await?;
        Ok(woke)
    }

    async fn set_scheduled(&self, resource_id: &ResourceId, scheduled: Option<ScheduledSleep>) -> Result<()> {
        let lock = self.resource_lock(resource_id)?;
        let _guard = lock.lock().await;
        let mut resource = self.load(resource_id)?;
        if resource.state == LifecycleState::Terminated {
            return Ok(());
        }
        resource.scheduled = scheduled;
        resource.updated_at = self.now();
        self.store.put_resource(&resource)?;
        Ok(())
    }
}
