//! Error types for the governance engine.
//!
//! The variants follow the failure taxonomy the daemon surfaces to callers:
//! provider failures, drift conflicts, budget and approval outcomes, agent
//! reachability and ledger inconsistencies, plus request validation.

use prism_core::{AccountId, ApprovalId, CoreError, ResourceId};
use prism_provider::ProviderError;
use prism_store::{LifecycleState, StoreError};
use thiserror::Error;

use crate::types::BudgetDenial;

/// A result type using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in governance operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested resource was not found.
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),

    /// The requested budget account was not found.
    #[error("budget account not found: {0}")]
    AccountNotFound(AccountId),

    /// The requested approval was not found.
    #[error("approval not found: {0}")]
    ApprovalNotFound(ApprovalId),

    /// The named idle policy does not exist.
    #[error("idle policy not found: {0}")]
    PolicyNotFound(String),

    /// The requested state transition is not in the transition table.
    #[error(
        "invalid state transition for resource {resource_id}: cannot transition from {from:?} to {to:?}"
    )]
    InvalidTransition {
        /// The resource being transitioned.
        resource_id: ResourceId,
        /// The current state.
        from: LifecycleState,
        /// The requested target state.
        to: LifecycleState,
    },

    /// A provider call for this resource is already in flight.
    #[error("resource {resource_id} has a transition to {target:?} in flight")]
    TransitionInFlight {
        /// The resource.
        resource_id: ResourceId,
        /// Where the in-flight call is heading.
        target: LifecycleState,
    },

    /// The provider failed transiently and retries ran out.
    #[error("provider temporarily unavailable: {0}")]
    TransientProvider(String),

    /// The provider rejected the call.
    #[error("provider rejected the request: {0}")]
    PermanentProvider(String),

    /// Local and provider state disagree in a way that needs an operator.
    #[error("drift conflict on resource {resource_id}: {detail}")]
    DriftConflict {
        /// The resource.
        resource_id: ResourceId,
        /// What disagrees.
        detail: String,
    },

    /// A launch or resume exceeds budget or quota.
    #[error("budget exceeded: {}", .0.summary())]
    BudgetExceeded(Box<BudgetDenial>),

    /// The approval timed out before a decision.
    #[error("approval {0} timed out")]
    ApprovalTimeout(ApprovalId),

    /// The resource's agent has stopped reporting.
    #[error("agent on resource {0} is unreachable")]
    AgentUnreachable(ResourceId),

    /// The account's snapshot disagrees with its event log; mutation is halted
    /// for that account until it is repaired.
    #[error("ledger inconsistency on account {account_id}: {detail}")]
    LedgerInconsistency {
        /// The affected account.
        account_id: AccountId,
        /// What disagrees.
        detail: String,
    },

    /// The request is malformed or not applicable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Core validation error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(_) | ProviderError::Timeout(_) => {
                Self::TransientProvider(err.to_string())
            }
            ProviderError::Permanent(_) | ProviderError::NotFound(_) => {
                Self::PermanentProvider(err.to_string())
            }
            ProviderError::Config(msg) => Self::Internal(msg),
        }
    }
}

impl EngineError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::ResourceNotFound(_)
            | Self::AccountNotFound(_)
            | Self::ApprovalNotFound(_)
            | Self::PolicyNotFound(_) => 404,
            Self::InvalidTransition { .. }
            | Self::TransitionInFlight { .. }
            | Self::DriftConflict { .. } => 409,
            Self::BudgetExceeded(_) => 402,
            Self::ApprovalTimeout(_) => 410,
            Self::AgentUnreachable(_) => 503,
            Self::LedgerInconsistency { .. } => 423,
            Self::InvalidRequest(_) | Self::Core(_) => 400,
            Self::TransientProvider(_) | Self::PermanentProvider(_) => 502,
            Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::ApprovalNotFound(_) => "APPROVAL_NOT_FOUND",
            Self::PolicyNotFound(_) => "POLICY_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::TransitionInFlight { .. } => "TRANSITION_IN_FLIGHT",
            Self::TransientProvider(_) => "TRANSIENT_PROVIDER_ERROR",
            Self::PermanentProvider(_) => "PERMANENT_PROVIDER_ERROR",
            Self::DriftConflict { .. } => "DRIFT_CONFLICT",
            Self::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Self::ApprovalTimeout(_) => "APPROVAL_TIMEOUT",
            Self::AgentUnreachable(_) => "AGENT_UNREACHABLE",
            Self::LedgerInconsistency { .. } => "LEDGER_INCONSISTENCY",
            Self::InvalidRequest(_) | Self::Core(_) => "INVALID_REQUEST",
            Self::Store(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransientProvider(_) | Self::TransitionInFlight { .. } | Self::Store(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuotaLimit;
    use prism_core::{Money, ProjectId};

    #[test]
    fn error_status_codes() {
        let resource_id = ResourceId::generate(&ProjectId::generate(), "ws");
        let account_id = AccountId::generate();

        assert_eq!(EngineError::ResourceNotFound(resource_id).http_status_code(), 404);
        assert_eq!(
            EngineError::InvalidTransition {
                resource_id,
                from: LifecycleState::Terminated,
                to: LifecycleState::Running
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            EngineError::LedgerInconsistency {
                account_id,
                detail: "mismatch".into()
            }
            .http_status_code(),
            423
        );

        let denial = BudgetDenial {
            account_id,
            limit: QuotaLimit::LaunchBlocked { account_id },
            hard_cap: true,
            remaining: Money::ZERO,
            requested: Money::from_dollars(1.0),
            remediation: "wait for the next period".into(),
        };
        let err = EngineError::BudgetExceeded(Box::new(denial));
        assert_eq!(err.http_status_code(), 402);
        assert_eq!(err.error_code(), "BUDGET_EXCEEDED");
    }

    #[test]
    fn provider_errors_map_onto_taxonomy() {
        let transient: EngineError = ProviderError::Transient("throttled".into()).into();
        assert!(matches!(transient, EngineError::TransientProvider(_)));
        assert!(transient.is_retriable());

        let permanent: EngineError = ProviderError::Permanent("bad class".into()).into();
        assert!(matches!(permanent, EngineError::PermanentProvider(_)));
        assert!(!permanent.is_retriable());
    }
}
