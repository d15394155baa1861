use axum::{Json, extract::Path, extract::State};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::SharedState;

/// `GET /api/blockchain/stats`
///
/// Chain summary: totals per block type, difficulty, validity, and
/// the end hashes.
pub async fn stats(State(state): State<SharedState>) -> Json<Value> {
    let stats = state.machine.engine().stats();
    Json(json!({ "success": true, "stats": stats }))
}

/// `GET /api/blockchain/validate`
///
/// Full chain re-validation.
pub async fn validate(State(state): State<SharedState>) -> Json<Value> {
    let report = state.machine.engine().validate();
    Json(json!({
        "is_valid": report.is_valid,
        "error_index": report.error_index,
        "error": report.error,
    }))
}

/// `GET /api/blockchain/block/{index}`
pub async fn block(
    State(state): State<SharedState>,
    Path(index): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let block = state
        .machine
        .engine()
        .get(index)
        .ok_or_else(|| ledger::LedgerError::not_found(format!("block {index}")))?;
    Ok(Json(json!({ "success": true, "block": block })))
}

/// `GET /api/blockchain/block/{index}/proof`
///
/// Proof of inclusion for a single block.
pub async fn proof(
    State(state): State<SharedState>,
    Path(index): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let proof = state
        .machine
        .engine()
        .proof(index)
        .ok_or_else(|| ledger::LedgerError::not_found(format!("block {index}")))?;
    Ok(Json(json!({ "success": true, "proof": proof })))
}

/// `GET /api/blockchain/export`
///
/// The full chain, genesis first. Re-hydrating the export into a
/// fresh ledger must validate.
pub async fn export(State(state): State<SharedState>) -> Json<Value> {
    let chain = state.machine.engine().export();
    Json(json!({
        "success": true,
        "length": chain.len(),
        "chain": chain,
    }))
}

/// `GET /api/blockchain/sheet/{sheet_id}`
///
/// All blocks recorded for one sheet, in chain order.
pub async fn by_sheet(
    State(state): State<SharedState>,
    Path(sheet_id): Path<String>,
) -> Json<Value> {
    let blocks = state.machine.engine().find_by_sheet(&sheet_id);
    Json(json!({
        "success": true,
        "sheet_id": sheet_id,
        "count": blocks.len(),
        "blocks": blocks,
    }))
}
