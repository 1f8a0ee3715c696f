//! Budget account endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use prism_core::{AccountId, BudgetPeriod};
use prism_engine::{AccountStatus, Governance, NewAccount};
use prism_store::CostEvent;
use serde::Serialize;

use super::{parse_id, PeriodQuery};
use crate::error::ApiError;
use crate::state::DaemonState;

/// Response for account listings.
#[derive(Debug, Serialize)]
pub struct ListAccountsResponse {
    /// Balances of every account.
    pub accounts: Vec<AccountStatus>,
}

/// Response for an account's cost events.
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    /// The account.
    pub account_id: AccountId,
    /// Period covered.
    pub period: BudgetPeriod,
    /// Events in posting order.
    pub events: Vec<CostEvent>,
}

/// Create a budget account.
///
/// # Errors
///
/// Returns `INVALID_REQUEST` for a bad limit, threshold or rollover cap, or
/// `ACCOUNT_NOT_FOUND` for an unknown parent.
pub async fn create<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Json(request): Json<NewAccount>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let account = state.governance.create_account(request).await?;
    tracing::info!(account_id = %account.account_id, name = %account.name, "Budget account created");
    Ok((StatusCode::CREATED, Json(account)))
}

/// Balances of every account.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn list<G>(State(state): State<Arc<DaemonState<G>>>) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let accounts = state.governance.list_accounts().await?;
    Ok(Json(ListAccountsResponse { accounts }))
}

/// Current balances of one account.
///
/// # Errors
///
/// Returns `ACCOUNT_NOT_FOUND` for an unknown id.
pub async fn status<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(account_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let account_id: AccountId = parse_id(&account_id, "account id")?;
    Ok(Json(state.governance.account_status(&account_id).await?))
}

/// Cost events of an account in a period.
///
/// # Errors
///
/// Returns `BAD_REQUEST` for a malformed period.
pub async fn events<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(account_id): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let account_id: AccountId = parse_id(&account_id, "account id")?;
    let period = query.resolve()?;
    let events = state.governance.account_events(&account_id, period).await?;
    Ok(Json(EventsResponse {
        account_id,
        period,
        events,
    }))
}

/// Savings from hibernation and stopping in a period.
///
/// # Errors
///
/// Returns `BAD_REQUEST` for a malformed period.
pub async fn savings<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Path(account_id): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    let account_id: AccountId = parse_id(&account_id, "account id")?;
    let period = query.resolve()?;
    Ok(Json(state.governance.savings_report(&account_id, period).await?))
}
