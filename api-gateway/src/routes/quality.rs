use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

use ledger::{QualityReport, ReviewRequest};

use crate::error::ApiError;
use crate::routes::StageResponse;
use crate::state::SharedState;

/// Request body for `POST /api/quality/assess`.
///
/// With `report` present the gate runs over the supplied figures;
/// without it the stored image is fetched and assessed by the AI
/// provider.
#[derive(Debug, Deserialize)]
pub struct AssessRequest {
    pub sheet_id: String,
    #[serde(default)]
    pub report: Option<QualityReport>,
}

/// `POST /api/quality/assess`
pub async fn assess(
    State(state): State<SharedState>,
    Json(req): Json<AssessRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    // The AI path uses the blocking HTTP client; keep it off the
    // async runtime's worker threads.
    let outcome = run_blocking(move || match req.report {
        Some(report) => state.machine.assess_quality(&req.sheet_id, report),
        None => state.machine.assess_quality_with_ai(&req.sheet_id),
    })
    .await?;
    Ok(Json(outcome.into()))
}

/// Runs a lifecycle command on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ledger::LedgerError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            ApiError(ledger::LedgerError::ExternalFailed {
                source: format!("blocking task failed: {e}"),
            })
        })?
        .map_err(ApiError)
}

/// `POST /api/quality/review`
///
/// Human decision on a flagged or rejected sheet.
pub async fn review(
    State(state): State<SharedState>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = state.machine.review_quality(req)?;
    Ok(Json(outcome.into()))
}

/// Request body for `POST /api/quality/reconstruct`.
#[derive(Debug, Deserialize)]
pub struct ReconstructRequest {
    pub sheet_id: String,
}

/// `POST /api/quality/reconstruct`
///
/// Runs AI reconstruction over a rejected-but-recoverable sheet.
pub async fn reconstruct(
    State(state): State<SharedState>,
    Json(req): Json<ReconstructRequest>,
) -> Result<Json<Value>, ApiError> {
    let quality = run_blocking(move || state.machine.reconstruct(&req.sheet_id)).await?;
    Ok(Json(json!({
        "success": true,
        "quality": quality,
    })))
}
