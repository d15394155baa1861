//! Domain-error to HTTP mapping.
//!
//! Every handler returns `Result<_, ApiError>`; the conversion from
//! `ledger::LedgerError` picks the status code from the error tag and
//! serializes a stable JSON body, including the missing signer roles
//! for incomplete verifications.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use ledger::LedgerError;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable tag (`not_found`, `signatures_incomplete`, ...).
    pub error: &'static str,
    pub message: String,
    /// Signer roles absent from an incomplete verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<&'static str>>,
}

/// Wrapper turning `LedgerError` into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError(e)
    }
}

fn status_for(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::AlreadyExists { .. } | LedgerError::InvalidState { .. } => {
            StatusCode::CONFLICT
        }
        LedgerError::HashMismatch { .. } => StatusCode::BAD_REQUEST,
        LedgerError::SignaturesIncomplete { .. } | LedgerError::QualityRejected { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LedgerError::ExternalFailed { .. } => StatusCode::BAD_GATEWAY,
        LedgerError::MiningBudgetExceeded { .. }
        | LedgerError::PersistenceFailed { .. }
        | LedgerError::IntegrityViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);

        let missing = match &self.0 {
            LedgerError::SignaturesIncomplete { missing } => {
                Some(missing.iter().map(|s| s.as_str()).collect())
            }
            _ => None,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }

        let body = ErrorBody {
            error: self.0.tag(),
            message: self.0.to_string(),
            missing,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::SignerType;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            status_for(&LedgerError::not_found("sheet S")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&LedgerError::already_exists("sheet S")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&LedgerError::SignaturesIncomplete {
                missing: vec![SignerType::AdminController]
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&LedgerError::QualityRejected {
                sheet_id: "S".into(),
                reason: "damaged".into()
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&LedgerError::HashMismatch {
                context: "bad".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&LedgerError::IntegrityViolation {
                context: "bad".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
