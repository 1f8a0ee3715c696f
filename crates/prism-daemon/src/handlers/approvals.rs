//! Approval workflow endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use prism_core::ApprovalId;
use prism_engine::{ApprovalDecision, Governance};
use prism_store::{ApprovalRequest, ApprovalStatus};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::caller::Caller;
use crate::error::ApiError;
use crate::state::DaemonState;

/// `?status=` filter.
#[derive(Debug, Default, Deserialize)]
pub struct ApprovalQuery {
    /// Only requests in this status.
    #[serde(default)]
    pub status: Option<ApprovalStatus>,
}

/// Response for approval listings.
#[derive(Debug, Serialize)]
pub struct ListApprovalsResponse {
    /// Matching requests.
    pub approvals: Vec<ApprovalRequest>,
}

/// List approval requests.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn list<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Query(query): Query<ApprovalQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let approvals = state.governance.list_approvals(query.status).await?;
    Ok(Json(ListApprovalsResponse { approvals }))
}

/// Get one approval request.
///
/// # Errors
///
/// Returns `APPROVAL_NOT_FOUND` for an unknown id.
pub async fn get<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(approval_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let approval_id: ApprovalId = parse_id(&approval_id, "approval id")?;
    Ok(Json(state.governance.get_approval(&approval_id).await?))
}

/// Approve or deny a pending request as the caller.
///
/// A request that was already decided comes back unchanged.
///
/// # Errors
///
/// Returns `APPROVAL_TIMEOUT` once the request has expired.
pub async fn decide<G>(
    State(state): State<Arc<DaemonState<G>>>,
    caller: Caller,
    Path(approval_id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let approval_id: ApprovalId = parse_id(&approval_id, "approval id")?;
    let approval = state
        .governance
        .decide_approval(&approval_id, &caller.user_id, decision)
        .await?;
    Ok(Json(approval))
}
