//! Resource endpoints: launches, listings, lifecycle actions and idle reports.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use prism_core::ResourceId;
use prism_engine::{Governance, LaunchOutcome, ResourceFilter};
use prism_store::{Actor, LaunchSpec, ManagedResource, RequestedAction};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::caller::Caller;
use crate::error::ApiError;
use crate::state::DaemonState;

/// Response for resource listings.
#[derive(Debug, Serialize)]
pub struct ListResourcesResponse {
    /// Matching resources.
    pub resources: Vec<ManagedResource>,
}

/// Body of a lifecycle request.
#[derive(Debug, Deserialize)]
pub struct ActionBody {
    /// What to do.
    pub action: RequestedAction,
}

/// Launch a resource.
///
/// Answers `201 Created` with the resource, or `202 Accepted` with the
/// approval request when a soft limit routes the launch to an approver.
///
/// # Errors
///
/// Returns `BUDGET_EXCEEDED` when a hard cap denies the launch.
pub async fn launch<G>(
    State(state): State<Arc<DaemonState<G>>>,
    caller: Caller,
    Json(spec): Json<LaunchSpec>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    if spec.name.trim().is_empty() || spec.provider_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "name and provider_id must not be empty".to_string(),
        ));
    }

    let outcome = state.governance.launch(&caller.user_id, spec).await?;
    let status = match outcome {
        LaunchOutcome::Launched { .. } => StatusCode::CREATED,
        LaunchOutcome::PendingApproval { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

/// List resources, optionally filtered by `state` and `account_id`.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn list<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Query(filter): Query<ResourceFilter>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let resources = state.governance.list_resources(&filter).await?;
    Ok(Json(ListResourcesResponse { resources }))
}

/// Get one resource.
///
/// # Errors
///
/// Returns `RESOURCE_NOT_FOUND` for an unknown id.
pub async fn get<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(resource_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let resource_id: ResourceId = parse_id(&resource_id, "resource id")?;
    Ok(Json(state.governance.get_resource(&resource_id).await?))
}

/// Start, stop, hibernate, resume or terminate a resource on the caller's behalf.
///
/// # Errors
///
/// Returns `INVALID_TRANSITION` when the action does not apply to the
/// current state, `TRANSITION_IN_FLIGHT` while a provider call is pending,
/// or `BUDGET_EXCEEDED` for a start or resume over budget.
pub async fn action<G>(
    State(state): State<Arc<DaemonState<G>>>,
    caller: Caller,
    Path(resource_id): Path<String>,
    Json(body): Json<ActionBody>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let resource_id: ResourceId = parse_id(&resource_id, "resource id")?;
    let resource = state
        .governance
        .request_action(&resource_id, body.action, Actor::User(caller.user_id))
        .await?;
    Ok(Json(resource))
}

/// Idle detection's view of a resource.
///
/// # Errors
///
/// Returns `AGENT_UNREACHABLE` while the agent is silent.
pub async fn idle_report<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(resource_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let resource_id: ResourceId = parse_id(&resource_id, "resource id")?;
    Ok(Json(state.governance.idle_report(&resource_id).await?))
}
