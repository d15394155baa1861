use axum::{Json, extract::State};

use ledger::ScoreRequest;

use crate::error::ApiError;
use crate::routes::StageResponse;
use crate::state::SharedState;

/// `POST /api/score/create`
///
/// Records the AI scoring pass over a sheet's detected answers.
pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<ScoreRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = state.machine.create_score(req)?;
    Ok(Json(outcome.into()))
}
