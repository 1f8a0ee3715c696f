//! Idle policy endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use prism_core::ProjectId;
use prism_engine::Governance;
use prism_store::IdlePolicy;
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::error::ApiError;
use crate::state::DaemonState;

/// Response for the policy catalogue.
#[derive(Debug, Serialize)]
pub struct ListPoliciesResponse {
    /// Every named policy.
    pub policies: Vec<IdlePolicy>,
}

/// Body naming a project's default policy.
#[derive(Debug, Deserialize)]
pub struct ProjectPolicyBody {
    /// Policy name.
    pub policy: String,
}

/// List the policy catalogue.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn list<G>(State(state): State<Arc<DaemonState<G>>>) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let policies = state.governance.list_policies().await?;
    Ok(Json(ListPoliciesResponse { policies }))
}

/// Create or replace the policy named in the path.
///
/// # Errors
///
/// Returns `BAD_REQUEST` if the body names another policy, or
/// `INVALID_REQUEST` if its values are out of range.
pub async fn put<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(name): Path<String>,
    Json(policy): Json<IdlePolicy>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    if policy.name != name {
        return Err(ApiError::BadRequest(format!(
            "policy name `{}` does not match path `{name}`",
            policy.name
        )));
    }
    Ok(Json(state.governance.put_policy(policy).await?))
}

/// Set a project's default policy.
///
/// # Errors
///
/// Returns `POLICY_NOT_FOUND` for an unknown policy.
pub async fn set_project_policy<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(project_id): Path<String>,
    Json(body): Json<ProjectPolicyBody>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let project_id: ProjectId = parse_id(&project_id, "project id")?;
    state
        .governance
        .set_project_policy(&project_id, &body.policy)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
