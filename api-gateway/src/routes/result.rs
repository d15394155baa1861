use axum::{Json, extract::Path, extract::State};
use serde_json::{Value, json};

use ledger::ResultRequest;

use crate::error::ApiError;
use crate::state::SharedState;

/// `POST /api/result/commit`
///
/// Publishes the final result of a verified sheet: appends the
/// `result` block and returns the QR payload bound to it.
pub async fn commit(
    State(state): State<SharedState>,
    Json(req): Json<ResultRequest>,
) -> Result<Json<Value>, ApiError> {
    let (outcome, result) = state.machine.commit_result(req)?;
    Ok(Json(json!({
        "success": true,
        "sheet_id": outcome.sheet_id,
        "block_index": outcome.block.index,
        "block_hash": outcome.block.hash,
        "result": result,
        "idempotent_replay": outcome.idempotent_replay,
    })))
}

/// `GET /api/result/{roll_number}`
///
/// Published-result lookup, served from the result cache, together
/// with the sheet's block trail and audit timeline.
pub async fn lookup(
    State(state): State<SharedState>,
    Path(roll_number): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .machine
        .lookup_result(&roll_number)?
        .ok_or_else(|| ledger::LedgerError::not_found(format!("result for roll {roll_number}")))?;

    let blocks = state.machine.engine().find_by_sheet(&result.sheet_id);
    let timeline = state
        .machine
        .audit()
        .timeline(&result.sheet_id)
        .unwrap_or_default();

    Ok(Json(json!({
        "success": true,
        "result": result,
        "block_trail": blocks
            .iter()
            .map(|b| json!({
                "index": b.index,
                "block_type": b.block_type,
                "hash": b.hash,
                "timestamp": b.timestamp,
            }))
            .collect::<Vec<Value>>(),
        "audit_trail": timeline,
    })))
}
