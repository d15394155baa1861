use axum::{Json, extract::State};
use serde_json::{Value, json};

use ledger::EvaluateRequest;

use crate::error::ApiError;
use crate::state::SharedState;

/// `POST /api/evaluation/create`
///
/// Marks a scored sheet against an approved answer key, tallies the
/// automated total against the optional manual one, and appends the
/// `evaluation` block. A mismatch files a `marks_mismatch`
/// intervention that blocks verification.
pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<Value>, ApiError> {
    let (outcome, evaluation) = state.machine.evaluate(req)?;
    Ok(Json(json!({
        "success": true,
        "evaluation": evaluation,
        "block_index": outcome.block.index,
        "block_hash": outcome.block.hash,
        "idempotent_replay": outcome.idempotent_replay,
    })))
}
