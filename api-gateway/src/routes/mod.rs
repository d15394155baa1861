//! HTTP route handlers.
//!
//! One module per lifecycle area, mirroring the command surface of
//! the ledger crate. All block-producing handlers answer with
//! [`StageResponse`], a uniform envelope carrying the block identity
//! and the sheet's post-command status.

use serde::Serialize;

use ledger::StageOutcome;

pub mod audit;
pub mod blockchain;
pub mod bubble;
pub mod evaluation;
pub mod health;
pub mod intervention;
pub mod keys;
pub mod quality;
pub mod recheck;
pub mod result;
pub mod scan;
pub mod score;
pub mod verify;

/// Uniform response for block-producing commands.
#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub success: bool,
    pub sheet_id: String,
    pub block_index: u64,
    pub block_hash: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    /// True when the call replayed an earlier identical command.
    pub idempotent_replay: bool,
}

impl From<StageOutcome> for StageResponse {
    fn from(outcome: StageOutcome) -> Self {
        StageResponse {
            success: true,
            sheet_id: outcome.sheet_id,
            block_index: outcome.block.index,
            block_hash: outcome.block.hash.as_str().to_string(),
            content_hash: outcome.content_hash.as_str().to_string(),
            status: outcome.status.map(|s| s.as_str()),
            idempotent_replay: outcome.idempotent_replay,
        }
    }
}
