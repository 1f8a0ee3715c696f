//! API error types and responses.
//!
//! Every error renders as `{"error": {"code", "message", "details"}}`.
//! Engine errors keep their own status and code; budget denials put the
//! balance, the limit hit and the remediation in `details`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use prism_engine::EngineError;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request carries no caller identity.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// Invalid request body or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An error from the governance engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

/// Error details.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(err) => StatusCode::from_u16(err.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Get the error code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Engine(err) => err.error_code(),
        }
    }

    /// Structured context for the caller, when there is any.
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        let Self::Engine(err) = self else {
            return None;
        };
        match err {
            EngineError::BudgetExceeded(denial) => Some(json!({
                "account_id": denial.account_id,
                "limit": denial.limit,
                "hard_cap": denial.hard_cap,
                "remaining": denial.remaining,
                "requested": denial.requested,
                "remediation": denial.remediation,
            })),
            EngineError::InvalidTransition {
                resource_id,
                from,
                to,
            } => Some(json!({ "resource_id": resource_id, "from": from, "to": to })),
            EngineError::TransitionInFlight {
                resource_id,
                target,
            } => Some(json!({ "resource_id": resource_id, "target": target })),
            EngineError::DriftConflict { resource_id, .. } => {
                Some(json!({ "resource_id": resource_id }))
            }
            EngineError::LedgerInconsistency { account_id, .. } => {
                Some(json!({ "account_id": account_id, "frozen": true }))
            }
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Engine(EngineError::Store(_) | EngineError::Internal(_)) => {
                "internal error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else if let Self::Engine(EngineError::BudgetExceeded(denial)) = &self {
            tracing::warn!(account_id = %denial.account_id, summary = %denial.summary(), "Request denied by budget");
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.message(),
                details: self.details(),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{AccountId, ApprovalId, Money, ProjectId, ResourceId};
    use prism_engine::{BudgetDenial, QuotaLimit};
    use prism_store::LifecycleState;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            ApiError::Unauthorized("missing header").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::BadRequest("test".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(EngineError::ApprovalNotFound(ApprovalId::generate())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(EngineError::InvalidTransition {
                resource_id: ResourceId::generate(&ProjectId::generate(), "ws"),
                from: LifecycleState::Terminated,
                to: LifecycleState::Running,
            })
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(EngineError::Internal("boom".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn budget_errors_carry_details() {
        let account_id = AccountId::generate();
        let err = ApiError::from(EngineError::BudgetExceeded(Box::new(BudgetDenial {
            account_id,
            limit: QuotaLimit::MonthlyBudget {
                account_id,
                monthly_limit: Money::from_dollars(100.0),
            },
            hard_cap: true,
            remaining: Money::from_dollars(0.05),
            requested: Money::from_dollars(0.10),
            remediation: "ask an approver to raise the limit".into(),
        })));

        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(err.code(), "BUDGET_EXCEEDED");
        let details = err.details().unwrap();
        assert_eq!(details["hard_cap"], true);
        assert_eq!(details["limit"]["limit"], "monthly_budget");
        assert_eq!(details["remediation"], "ask an approver to raise the limit");
    }

    #[test]
    fn internal_messages_are_not_leaked() {
        let err = ApiError::from(EngineError::Internal("lock poisoned at 0x1".into()));
        assert_eq!(err.message(), "internal error");
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
