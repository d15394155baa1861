use axum::{Json, extract::Path, extract::State};
use serde_json::{Value, json};

use ledger::VerifyRequest;

use crate::error::ApiError;
use crate::routes::StageResponse;
use crate::state::SharedState;

/// `POST /api/verify/create`
///
/// Collects the three required approvals and appends the `verify`
/// block. Missing or unauthorized signers fail the request with the
/// absent roles enumerated; no block is produced in that case.
pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = state.machine.create_verify(req)?;
    Ok(Json(outcome.into()))
}

/// `GET /api/verify/{sheet_id}`
///
/// Returns the verification block and stored signatures for a sheet.
pub async fn get(
    State(state): State<SharedState>,
    Path(sheet_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let sheet = state
        .machine
        .store()
        .get_sheet(&sheet_id)
        .map_err(|e| ledger::LedgerError::PersistenceFailed {
            source: e.to_string(),
        })?
        .ok_or_else(|| ledger::LedgerError::not_found(format!("sheet {sheet_id}")))?;

    let signatures = state
        .machine
        .store()
        .signatures_for_sheet(&sheet_id)
        .map_err(|e| ledger::LedgerError::PersistenceFailed {
            source: e.to_string(),
        })?;

    let block = sheet.verify_block.and_then(|index| state.machine.engine().get(index));

    Ok(Json(json!({
        "success": block.is_some(),
        "sheet_id": sheet_id,
        "status": sheet.status,
        "block": block,
        "signatures": signatures,
    })))
}
