use axum::{Json, extract::Path, extract::State};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::SharedState;

/// `GET /api/audit/{sheet_id}`
///
/// The sheet's full audit document.
pub async fn read(
    State(state): State<SharedState>,
    Path(sheet_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let doc = state
        .machine
        .audit()
        .read_sheet(&sheet_id)?
        .ok_or_else(|| ledger::LedgerError::not_found(format!("audit log for {sheet_id}")))?;
    Ok(Json(json!({ "success": true, "log": doc })))
}

/// `GET /api/audit/{sheet_id}/verify`
///
/// Re-hashes every entry of the sheet's audit log and reports
/// whether the stored hashes still match.
pub async fn verify(
    State(state): State<SharedState>,
    Path(sheet_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.machine.audit().verify_integrity(&sheet_id) {
        Ok(()) => Ok(Json(json!({ "sheet_id": sheet_id, "is_valid": true }))),
        Err(ledger::LedgerError::IntegrityViolation { context }) => Ok(Json(json!({
            "sheet_id": sheet_id,
            "is_valid": false,
            "error": context,
        }))),
        Err(other) => Err(other.into()),
    }
}
