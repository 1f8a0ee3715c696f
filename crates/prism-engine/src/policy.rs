//! Hibernation policy engine.
//!
//! Policies are named records in the store. A resource follows the policy it
//! names, adjusted by its own override; when the name does not resolve, the
//! project default and then the built-in `standard` policy apply.
//!
//! Evaluation is debounced both ways: the score has to stay below the
//! threshold for the whole idle threshold before a warning is raised, the
//! action only runs once the grace period has passed, and any active sample
//! in between cancels back to `Running` with the idle history cleared.
//!
//! A policy may also carry hibernation schedules; see [`crate::schedule`].

use chrono::{DateTime, Duration, Utc};
use prism_core::{MetricSaturation, MetricWeights, ScoringProfile};
use prism_store::{
    HibernationSchedule, IdleAction, IdlePolicy, IdleTracking, LaunchSpec, LifecycleState,
    ManagedResource, PendingIdle, PolicyOverride, ScheduleKind, Store, WakeAction,
};

use crate::error::{EngineError, Result};

/// Name of the policy every lookup falls back to.
pub const STANDARD_POLICY: &str = "standard";

/// The built-in catalogue seeded on first start.
#[must_use]
pub fn builtin_policies() -> Vec<IdlePolicy> {
    let io_heavy = ScoringProfile {
        weights: MetricWeights {
            cpu: 0.25,
            memory: 0.10,
            disk: 0.25,
            network: 0.25,
            gpu: 0.05,
            interactive: 0.10,
        },
        saturation: MetricSaturation {
            disk_io_kbps: 5_000.0,
            network_io_kbps: 5_000.0,
            ..MetricSaturation::default()
        },
    };
    let gpu_heavy = ScoringProfile {
        weights: MetricWeights {
            cpu: 0.20,
            memory: 0.05,
            disk: 0.05,
            network: 0.05,
            gpu: 0.50,
            interactive: 0.15,
        },
        saturation: MetricSaturation::default(),
    };

    vec![
        policy(STANDARD_POLICY, "Stop after 30 idle minutes", 30, 0, IdleAction::Stop, 0.05, ScoringProfile::default()),
        policy("batch", "Hibernate long-running batch hosts after an idle hour", 60, 0, IdleAction::Hibernate, 0.03, ScoringProfile::default()),
        policy("gpu", "Stop idle GPU instances quickly", 15, 0, IdleAction::Stop, 0.05, gpu_heavy),
        policy("data-intensive", "Stop after 45 idle minutes, weighting disk and network", 45, 0, IdleAction::Stop, 0.05, io_heavy),
        policy("balanced", "Hibernate after 15 idle minutes with a 5 minute warning", 15, 5, IdleAction::Hibernate, 0.05, ScoringProfile::default()),
        policy("notify-only", "Only notify after 30 idle minutes", 30, 0, IdleAction::Notify, 0.05, ScoringProfile::default()),
        IdlePolicy {
            schedules: vec![HibernationSchedule {
                name: "after-hours".into(),
                kind: ScheduleKind::WorkHours,
                start: "09:00".into(),
                end: "18:00".into(),
                days: Vec::new(),
                utc_offset_minutes: 0,
                action: IdleAction::Hibernate,
                wake: WakeAction::Resume,
            }],
            ..policy("office-hours", "Hibernate outside 09:00-18:00 on weekdays and over weekends", 30, 5, IdleAction::Hibernate, 0.05, ScoringProfile::default())
        },
        IdlePolicy {
            schedules: vec![HibernationSchedule {
                name: "night".into(),
                kind: ScheduleKind::Daily,
                start: "20:00".into(),
                end: "08:00".into(),
                days: Vec::new(),
                utc_offset_minutes: 0,
                action: IdleAction::Hibernate,
                wake: WakeAction::Resume,
            }],
            ..policy("overnight", "Hibernate from 20:00 to 08:00 every night", 30, 5, IdleAction::Hibernate, 0.05, ScoringProfile::default())
        },
    ]
}

fn policy(
    name: &str,
    description: &str,
    idle_threshold_minutes: u32,
    grace_period_minutes: u32,
    action: IdleAction,
    idle_score_threshold: f64,
    scoring: ScoringProfile,
) -> IdlePolicy {
    IdlePolicy {
        name: name.to_string(),
        description: description.to_string(),
        idle_threshold_minutes,
        grace_period_minutes,
        action,
        idle_score_threshold,
        scoring,
        schedules: Vec::new(),
    }
}

/// Check a policy before it is stored.
///
/// # Errors
///
/// Returns `EngineError::InvalidRequest` for an empty name, a zero idle
/// threshold, a score threshold outside (0, 1] or a malformed schedule, and
/// `EngineError::Core` for an invalid scoring profile.
pub fn validate_policy(policy: &IdlePolicy) -> Result<()> {
    if policy.name.trim().is_empty() {
        return Err(EngineError::InvalidRequest("policy name must not be empty".into()));
    }
    if policy.idle_threshold_minutes == 0 {
        return Err(EngineError::InvalidRequest(
            "idle threshold must be at least one minute".into(),
        ));
    }
    if !(policy.idle_score_threshold > 0.0 && policy.idle_score_threshold <= 1.0) {
        return Err(EngineError::InvalidRequest(
            "idle score threshold must be in (0, 1]".into(),
        ));
    }
    policy.scoring.validate()?;
    for (i, schedule) in policy.schedules.iter().enumerate() {
        crate::schedule::validate_schedule(schedule)?;
        if policy.schedules[..i].iter().any(|s| s.name == schedule.name) {
            return Err(EngineError::InvalidRequest(format!(
                "duplicate schedule name {}",
                schedule.name
            )));
        }
    }
    Ok(())
}

/// Write every built-in policy that is not already stored.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn seed_builtin_policies<S: Store>(store: &S) -> Result<usize> {
    let mut seeded = 0;
    for policy in builtin_policies() {
        if store.get_policy(&policy.name)?.is_none() {
            store.put_policy(&policy)?;
            seeded += 1;
        }
    }
    if seeded > 0 {
        tracing::info!(seeded, "Seeded built-in idle policies");
    }
    Ok(seeded)
}

/// A policy with the resource's override applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    /// Name of the underlying policy.
    pub name: String,
    /// Continuous idleness required before warning.
    pub idle_threshold: Duration,
    /// Time between warning and action.
    pub grace_period: Duration,
    /// Action at the end of the grace period.
    pub action: IdleAction,
    /// Scores strictly below this are idle.
    pub idle_score_threshold: f64,
    /// Scoring profile.
    pub scoring: ScoringProfile,
    /// Idle handling switched off for this resource.
    pub disabled: bool,
    /// Hibernation schedules, in priority order.
    pub schedules: Vec<HibernationSchedule>,
}

impl EffectivePolicy {
    /// Apply an optional override to a stored policy.
    #[must_use]
    pub fn new(policy: &IdlePolicy, adjust: Option<&PolicyOverride>) -> Self {
        let adjust = adjust.cloned().unwrap_or_default();
        Self {
            name: policy.name.clone(),
            idle_threshold: minutes(
                adjust
                    .idle_threshold_minutes
                    .unwrap_or(policy.idle_threshold_minutes),
            ),
            grace_period: minutes(
                adjust
                    .grace_period_minutes
                    .unwrap_or(policy.grace_period_minutes),
            ),
            action: adjust.action.unwrap_or(policy.action),
            idle_score_threshold: adjust
                .idle_score_threshold
                .unwrap_or(policy.idle_score_threshold),
            scoring: policy.scoring,
            disabled: adjust.disabled,
            schedules: policy.schedules.clone(),
        }
    }
}

fn minutes(value: u32) -> Duration {
    Duration::minutes(i64::from(value))
}

/// Look up the policy a resource follows.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn resolve<S: Store>(
    store: &S,
    resource: &ManagedResource,
    default_policy: &str,
) -> Result<EffectivePolicy> {
    let stored = match store.get_policy(&resource.policy_ref)? {
        Some(policy) => policy,
        None => {
            tracing::debug!(
                resource_id = %resource.resource_id,
                policy = %resource.policy_ref,
                "Policy missing, falling back to project default"
            );
            fallback_policy(store, resource, default_policy)?
        }
    };
    Ok(EffectivePolicy::new(&stored, resource.policy_override.as_ref()))
}

fn fallback_policy<S: Store>(
    store: &S,
    resource: &ManagedResource,
    default_policy: &str,
) -> Result<IdlePolicy> {
    if let Some(name) = store.get_project_policy(&resource.project_id)? {
        if let Some(policy) = store.get_policy(&name)? {
            return Ok(policy);
        }
    }
    if let Some(policy) = store.get_policy(default_policy)? {
        return Ok(policy);
    }
    builtin_policies()
        .into_iter()
        .find(|p| p.name == STANDARD_POLICY)
        .ok_or_else(|| EngineError::PolicyNotFound(STANDARD_POLICY.to_string()))
}

/// Pick the policy name recorded on a newly launched resource.
///
/// # Errors
///
/// Returns `EngineError::PolicyNotFound` when the launch names a policy that
/// does not exist.
pub fn policy_for_launch<S: Store>(store: &S, spec: &LaunchSpec, default_policy: &str) -> Result<String> {
    if let Some(name) = &spec.policy_ref {
        if store.get_policy(name)?.is_none() {
            return Err(EngineError::PolicyNotFound(name.clone()));
        }
        return Ok(name.clone());
    }
    Ok(store
        .get_project_policy(&spec.project_id)?
        .unwrap_or_else(|| default_policy.to_string()))
}

/// What the policy engine decided for one accepted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do.
    Continue,
    /// Raise the idle warning and start the grace period.
    EnterPending {
        /// Action scheduled for the deadline.
        action: IdleAction,
        /// End of the grace period.
        deadline: DateTime<Utc>,
    },
    /// Renewed activity: back to `Running`.
    CancelPending,
    /// Grace period over with sustained idleness: act.
    Trigger(IdleAction),
}

/// Evaluate one signal's score against the policy, updating `idle` in place.
///
/// Only `Running` and `PendingIdleAction` resources are evaluated; anything
/// else yields `Continue` without touching the tracking state.
pub fn evaluate(
    state: LifecycleState,
    idle: &mut IdleTracking,
    policy: &EffectivePolicy,
    score: f64,
    now: DateTime<Utc>,
) -> Decision {
    let pending = state == LifecycleState::PendingIdleAction;
    if !pending && state != LifecycleState::Running {
        return Decision::Continue;
    }
    idle.last_score = Some(score);

    if policy.disabled || score >= policy.idle_score_threshold {
        idle.reset();
        return if pending {
            Decision::CancelPending
        } else {
            Decision::Continue
        };
    }

    let since = *idle.idle_since.get_or_insert(now);
    idle.accumulator_secs = u64::try_from((now - since).num_seconds()).unwrap_or(0);

    if pending {
        return due_action(idle, now).map_or(Decision::Continue, Decision::Trigger);
    }

    if now - since >= policy.idle_threshold {
        let deadline = now + policy.grace_period;
        idle.pending = Some(PendingIdle {
            entered_at: now,
            deadline,
            action: policy.action,
        });
        return Decision::EnterPending {
            action: policy.action,
            deadline,
        };
    }
    Decision::Continue
}

/// The pending action whose grace period has run out, if any.
#[must_use]
pub fn due_action(idle: &IdleTracking, now: DateTime<Utc>) -> Option<IdleAction> {
    idle.pending
        .as_ref()
        .filter(|p| p.deadline <= now)
        .map(|p| p.action)
}
