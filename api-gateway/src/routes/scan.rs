use axum::{Json, extract::Path, extract::State};
use serde_json::{Value, json};

use ledger::ScanRequest;

use crate::error::ApiError;
use crate::routes::StageResponse;
use crate::state::SharedState;

/// `POST /api/scan/create`
///
/// Registers an uploaded OMR sheet: verifies the declared file hash,
/// stores the raw image off-chain, and appends the `scan` block.
pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = state.machine.create_scan(req)?;
    Ok(Json(outcome.into()))
}

/// `GET /api/scan/{sheet_id}`
///
/// Returns the scan block and sheet record for a sheet.
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

    let block = sheet
        .scan_block
        .and_then(|index| state.machine.engine().get(index))
        .ok_or_else(|| ledger::LedgerError::not_found(format!("scan block for {sheet_id}")))?;

    Ok(Json(json!({
        "success": true,
        "sheet": sheet,
        "block": block,
    })))
}
