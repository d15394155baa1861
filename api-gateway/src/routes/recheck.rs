use axum::{Json, extract::Path, extract::State};
use serde_json::{Value, json};

use ledger::RecheckInput;

use crate::error::ApiError;
use crate::state::SharedState;

/// `POST /api/recheck/create`
///
/// Files a recheck request against a completed sheet. The original
/// result stays published; the recheck is its own block.
pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<RecheckInput>,
) -> Result<Json<Value>, ApiError> {
    let (outcome, recheck) = state.machine.request_recheck(req)?;
    Ok(Json(json!({
        "success": true,
        "recheck": recheck,
        "block_index": outcome.block.index,
        "block_hash": outcome.block.hash,
        "idempotent_replay": outcome.idempotent_replay,
    })))
}

/// `GET /api/recheck/{sheet_id}`
pub async fn list(
    State(state): State<SharedState>,
    Path(sheet_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let rechecks = state
        .machine
        .store()
        .rechecks_for_sheet(&sheet_id)
        .map_err(|e| ledger::LedgerError::PersistenceFailed {
            source: e.to_string(),
        })?;
    Ok(Json(json!({ "success": true, "rechecks": rechecks })))
}
