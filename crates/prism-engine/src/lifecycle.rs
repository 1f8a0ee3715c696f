//! Resource lifecycle state machine table.
//!
//! This module defines the valid state transitions for managed resources and
//! provides validation logic. The table is checked when the crate is compiled:
//! every non-terminal state can reach `Terminating` or `Terminated`, every
//! state with a provider call in progress can fall into `Failed`, and nothing
//! leaves `Terminated`.
//!
//! # State Machine
//!
//! ```text
//!   ┌──────────────┐  provider ready   ┌─────────┐  idle  ┌───────────────────┐
//!   │ Provisioning │──────────────────▶│ Running │───────▶│ PendingIdleAction │
//!   └──────────────┘                   └─────────┘◀───────└───────────────────┘
//!                                       │   ▲   │  active       │         │
//!                              hibernate│   │   │stop           │hibernate│stop
//!                                       ▼   │   ▼               ▼         ▼
//!                            ┌─────────────┐│┌──────────┐  (same edges as Running)
//!                            │ Hibernating │││ Stopping │
//!                            └──────┬──────┘│└────┬─────┘
//!                                   ▼       │     ▼
//!                            ┌────────────┐ │ ┌─────────┐
//!                            │ Hibernated │ │ │ Stopped │
//!                            └──────┬─────┘ │ └────┬────┘
//!                                   │  ┌────┴────┐ │
//!                                   └─▶│Resuming │◀┘
//!                                      └─────────┘
//!
//!   any non-terminal ──▶ Terminating ──▶ Terminated
//!   any in-flight    ──▶ Failed ──▶ prior stable state
//!   Unknown (daemon start) ──▶ whatever the provider reports
//! ```

use prism_core::ResourceId;
use prism_store::LifecycleState;

use crate::error::{EngineError, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `EngineError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(
    resource_id: &ResourceId,
    from: LifecycleState,
    to: LifecycleState,
) -> Result<LifecycleState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(EngineError::InvalidTransition {
            resource_id: *resource_id,
            from,
            to,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::{
        Failed, Hibernated, Hibernating, PendingIdleAction, Provisioning, Resuming, Running,
        Stopped, Stopping, Terminated, Terminating, Unknown,
    };

    matches!(
        (from, to),
        // Provider confirms the instance is up
        (Provisioning | Resuming, Running)
            // Idle policy warning and its cancellation
            | (Running, PendingIdleAction)
            | (PendingIdleAction, Running)
            // Policy, user or budget driven suspension
            | (Running | PendingIdleAction, Hibernating | Stopping)
            | (Hibernating, Hibernated)
            | (Stopping, Stopped)
            // Start and resume
            | (Hibernated | Stopped, Resuming)
            // Explicit delete from anything not already on its way out
            | (Provisioning | Running | PendingIdleAction | Hibernated | Stopped | Failed, Terminating)
            | (Terminating, Terminated)
            // Retries exhausted or permanent provider error
            | (Provisioning | Hibernating | Stopping | Resuming | Terminating | Unknown, Failed)
            // Recovery to the prior stable state
            | (Failed, Running | Hibernated | Stopped | Terminated)
            // Startup reconciliation adopts whatever the provider reports
            | (Unknown, Running | Hibernating | Hibernated | Stopping | Stopped | Resuming | Terminating | Terminated)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: LifecycleState) -> Vec<LifecycleState> {
    LifecycleState::ALL
        .into_iter()
        .filter(|to| is_valid_transition(state, *to))
        .collect()
}

/// Returns true while the resource accrues cost.
#[must_use]
pub const fn is_billing_state(state: LifecycleState) -> bool {
    matches!(
        state,
        LifecycleState::Running | LifecycleState::PendingIdleAction
    )
}

/// Returns true for states a provider call is driving the resource out of.
#[must_use]
pub const fn is_transitional(state: LifecycleState) -> bool {
    matches!(
        state,
        LifecycleState::Provisioning
            | LifecycleState::Hibernating
            | LifecycleState::Stopping
            | LifecycleState::Resuming
            | LifecycleState::Terminating
    )
}

/// Returns true for states recovery may return a resource to.
#[must_use]
pub const fn is_stable(state: LifecycleState) -> bool {
    matches!(
        state,
        LifecycleState::Running
            | LifecycleState::Hibernated
            | LifecycleState::Stopped
            | LifecycleState::Terminated
    )
}

/// Returns true if the resource is gone for good.
#[must_use]
pub const fn is_terminal(state: LifecycleState) -> bool {
    matches!(state, LifecycleState::Terminated)
}

/// The stable state a resource counts as being in for recovery purposes.
#[must_use]
pub const fn stable_equivalent(state: LifecycleState) -> Option<LifecycleState> {
    match state {
        LifecycleState::Running | LifecycleState::PendingIdleAction => {
            Some(LifecycleState::Running)
        }
        LifecycleState::Hibernated => Some(LifecycleState::Hibernated),
        LifecycleState::Stopped => Some(LifecycleState::Stopped),
        LifecycleState::Terminated => Some(LifecycleState::Terminated),
        _ => None,
    }
}

const fn can_reach(from: LifecycleState, to: LifecycleState) -> bool {
    // Depth bounded by the number of states.
    let mut frontier = [false; 13];
    frontier[from as usize] = true;
    let mut round = 0;
    while round < LifecycleState::ALL.len() {
        let mut i = 0;
        while i < LifecycleState::ALL.len() {
            let a = LifecycleState::ALL[i];
            if frontier[a as usize] {
                let mut j = 0;
                while j < LifecycleState::ALL.len() {
                    let b = LifecycleState::ALL[j];
                    if is_valid_transition(a, b) {
                        frontier[b as usize] = true;
                    }
                    j += 1;
                }
            }
            i += 1;
        }
        round += 1;
    }
    frontier[to as usize]
}

const fn table_is_consistent() -> bool {
    let mut i = 0;
    while i < LifecycleState::ALL.len() {
        let state = LifecycleState::ALL[i];
        if is_valid_transition(state, state) {
            return false;
        }
        if is_terminal(state) {
            let mut j = 0;
            while j < LifecycleState::ALL.len() {
                if is_valid_transition(state, LifecycleState::ALL[j]) {
                    return false;
                }
                j += 1;
            }
        } else if !can_reach(state, LifecycleState::Terminated) {
            return false;
        }
        if is_transitional(state) && !is_valid_transition(state, LifecycleState::Failed) {
            return false;
        }
        if is_billing_state(state) && !is_valid_transition(state, LifecycleState::Stopping) {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(table_is_consistent(), "lifecycle transition table is inconsistent");
const _: () = assert!(!is_valid_transition(
    LifecycleState::Stopped,
    LifecycleState::Running
));
const _: () = assert!(!is_valid_transition(
    LifecycleState::Hibernating,
    LifecycleState::Running
));
