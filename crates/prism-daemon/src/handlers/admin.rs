//! Administrative overrides and the audit journal.
//!
//! Every override names its operator; the engine records it in the audit log.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use prism_core::{AccountId, ResourceId};
use prism_engine::{ForceRequest, Governance};
use prism_store::JournalEntry;
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::caller::Operator;
use crate::error::ApiError;
use crate::state::DaemonState;

/// `?since=&limit=` for the journal.
#[derive(Debug, Default, Deserialize)]
pub struct JournalQuery {
    /// Return entries after this sequence number.
    #[serde(default)]
    pub since: u64,
    /// Page size, capped by configuration.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One journal entry with its sequence number.
#[derive(Debug, Serialize)]
pub struct JournalItem {
    /// Sequence number; pass the last one back as `since`.
    pub seq: u64,
    /// The entry.
    #[serde(flatten)]
    pub entry: JournalEntry,
}

/// A page of the journal.
#[derive(Debug, Serialize)]
pub struct JournalResponse {
    /// Entries in sequence order.
    pub entries: Vec<JournalItem>,
    /// Sequence number to resume from.
    pub next_since: u64,
}

/// Force a resource into a state.
///
/// # Errors
///
/// Returns `INVALID_REQUEST` without a reason, or a provider error unless
/// `skip_provider` is set.
pub async fn force<G>(
    State(state): State<Arc<DaemonState<G>>>,
    operator: Operator,
    Path(resource_id): Path<String>,
    Json(request): Json<ForceRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let resource_id: ResourceId = parse_id(&resource_id, "resource id")?;
    if request.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("a reason is required".to_string()));
    }
    tracing::warn!(
        resource_id = %resource_id,
        operator = %operator.name,
        target = ?request.target,
        "Forced transition requested"
    );
    let resource = state
        .governance
        .force_transition(&resource_id, &operator.name, request)
        .await?;
    Ok(Json(resource))
}

/// Return a failed resource to its prior stable state.
///
/// # Errors
///
/// Returns `DRIFT_CONFLICT` if the provider disagrees with the prior state.
pub async fn recover<G>(
    State(state): State<Arc<DaemonState<G>>>,
    operator: Operator,
    Path(resource_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let resource_id: ResourceId = parse_id(&resource_id, "resource id")?;
    Ok(Json(state.governance.recover(&resource_id, &operator.name).await?))
}

/// Reconcile one resource against the provider now.
///
/// # Errors
///
/// Returns a provider error once retries run out.
pub async fn reconcile<G>(
    State(state): State<Arc<DaemonState<G>>>,
    _operator: Operator,
    Path(resource_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let resource_id: ResourceId = parse_id(&resource_id, "resource id")?;
    Ok(Json(state.governance.reconcile_now(&resource_id).await?))
}

/// Rebuild a frozen account's snapshot from its event log.
///
/// # Errors
///
/// Returns `ACCOUNT_NOT_FOUND` for an unknown id.
pub async fn repair<G>(
    State(state): State<Arc<DaemonState<G>>>,
    operator: Operator,
    Path(account_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let account_id: AccountId = parse_id(&account_id, "account id")?;
    Ok(Json(
        state
            .governance
            .repair_account(&account_id, &operator.name)
            .await?,
    ))
}

/// Everything that currently needs an operator.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn flags<G>(
    State(state): State<Arc<DaemonState<G>>>,
    _operator: Operator,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    Ok(Json(state.governance.operator_flags().await?))
}

/// Cost events, reconciliation records and audit entries after `since`.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn journal<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Query(query): Query<JournalQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let max = state.config.journal_page_limit;
    let limit = query.limit.unwrap_or(max).clamp(1, max.max(1));
    let entries = state.governance.journal_since(query.since, limit).await?;
    let next_since = entries.last().map_or(query.since, |(seq, _)| *seq);
    Ok(Json(JournalResponse {
        entries: entries
            .into_iter()
            .map(|(seq, entry)| JournalItem { seq, entry })
            .collect(),
        next_since,
    }))
}
