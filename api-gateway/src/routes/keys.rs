use axum::{Json, extract::Path, extract::State};
use serde_json::{Value, json};

use ledger::{KeyApproveRequest, KeyVerifyRequest, PaperRequest};

use crate::error::ApiError;
use crate::state::SharedState;

/// `POST /api/question-paper/upload`
pub async fn upload_paper(
    State(state): State<SharedState>,
    Json(req): Json<PaperRequest>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.machine.upload_question_paper(req)?;
    Ok(Json(json!({
        "success": true,
        "paper_id": outcome.sheet_id,
        "block_index": outcome.block.index,
        "block_hash": outcome.block.hash,
        "idempotent_replay": outcome.idempotent_replay,
    })))
}

/// `POST /api/answer-key/verify`
///
/// Uploads an answer key and runs AI verification over it. The key
/// lands `verified` or `flagged`; flagged keys wait for human review.
pub async fn verify_key(
    State(state): State<SharedState>,
    Json(req): Json<KeyVerifyRequest>,
) -> Result<Json<Value>, ApiError> {
    // Key verification calls the AI solver per question; keep the
    // blocking client off the async workers.
    let (outcome, key) =
        crate::routes::quality::run_blocking(move || state.machine.verify_answer_key(req))
            .await?;
    Ok(Json(json!({
        "success": true,
        "key": key,
        "block_index": outcome.block.index,
        "block_hash": outcome.block.hash,
        "idempotent_replay": outcome.idempotent_replay,
    })))
}

/// `POST /api/answer-key/approve`
///
/// Human approval, optionally with corrections to flagged questions.
pub async fn approve_key(
    State(state): State<SharedState>,
    Json(req): Json<KeyApproveRequest>,
) -> Result<Json<Value>, ApiError> {
    let (outcome, key) = state.machine.approve_answer_key(req)?;
    Ok(Json(json!({
        "success": true,
        "key": key,
        "block_index": outcome.block.index,
        "block_hash": outcome.block.hash,
        "idempotent_replay": outcome.idempotent_replay,
    })))
}

/// `GET /api/answer-key/{key_id}`
pub async fn get_key(
    State(state): State<SharedState>,
    Path(key_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = state
        .machine
        .store()
        .get_answer_key(&key_id)
        .map_err(|e| ledger::LedgerError::PersistenceFailed {
            source: e.to_string(),
        })?
        .ok_or_else(|| ledger::LedgerError::not_found(format!("answer key {key_id}")))?;
    Ok(Json(json!({ "success": true, "key": key })))
}
