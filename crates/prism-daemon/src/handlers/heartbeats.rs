//! Heartbeat ingestion from idle detection agents.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use prism_core::IdleSignal;
use prism_engine::Governance;

use crate::error::ApiError;
use crate::state::DaemonState;

/// Accept one heartbeat.
///
/// Stale and duplicate signals are answered with `accepted: false` and a
/// reason rather than an error, so the agent keeps its own sequence.
///
/// # Errors
///
/// Returns an error if the resource is unknown or the store fails.
pub async fn ingest<G>(
    State(state): State<Arc<DaemonState<G>>>,
    Json(signal): Json<IdleSignal>,
) -> Result<impl IntoResponse, ApiError>
where
    G: Governance + 'static,
{
    tracing::trace!(resource_id = %signal.resource_id, seq = signal.seq, "Heartbeat received");
    let ack = state.governance.ingest_heartbeat(signal).await?;
    Ok(Json(ack))
}
