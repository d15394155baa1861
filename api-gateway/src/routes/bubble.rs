use axum::{Json, extract::State};
use serde::Deserialize;

use ledger::BubbleRequest;

use crate::error::ApiError;
use crate::routes::StageResponse;
use crate::state::SharedState;

/// `POST /api/bubble/create`
///
/// Records the detected answers for a quality-approved sheet.
pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<BubbleRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = state.machine.create_bubble(req)?;
    Ok(Json(outcome.into()))
}

/// Request body for `POST /api/bubble/detect`.
#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    pub sheet_id: String,
}

/// `POST /api/bubble/detect`
///
/// AI-driven variant: fetches the stored image and runs bubble
/// detection through the provider stack.
pub async fn detect(
    State(state): State<SharedState>,
    Json(req): Json<DetectRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome =
        crate::routes::quality::run_blocking(move || {
            state.machine.detect_bubbles_with_ai(&req.sheet_id)
        })
        .await?;
    Ok(Json(outcome.into()))
}
