use axum::{Json, extract::State};
use serde_json::{Value, json};

use ledger::ResolveRequest;

use crate::error::ApiError;
use crate::state::SharedState;

/// `GET /api/intervention/pending`
///
/// Pending human interventions, most urgent first.
pub async fn pending(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let interventions = state
        .machine
        .store()
        .pending_interventions()
        .map_err(|e| ledger::LedgerError::PersistenceFailed {
            source: e.to_string(),
        })?;
    Ok(Json(json!({
        "success": true,
        "count": interventions.len(),
        "interventions": interventions,
    })))
}

/// `POST /api/intervention/resolve`
///
/// Records an operator's resolution on the chain and reopens the
/// sheet's pipeline.
pub async fn resolve(
    State(state): State<SharedState>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
    let (outcome, intervention) = state.machine.resolve_intervention(req)?;
    Ok(Json(json!({
        "success": true,
        "intervention": intervention,
        "block_index": outcome.block.index,
        "block_hash": outcome.block.hash,
    })))
}
