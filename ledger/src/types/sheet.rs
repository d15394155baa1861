//! Sheet records and lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::HexHash;

/// Lifecycle state of an answer sheet.
///
/// The happy path runs `Scanned → QualityAssessed → BubbleDetected →
/// Scored → Verified → Completed`. Sheets that fail the quality gate
/// land in `QualityRejected`; a human reviewer can move them back into
/// the pipeline or park them in `RescanRequested`, which is terminal
/// for this sheet. `ReconstructedApproved` is the optional detour for
/// damaged-but-recoverable sheets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStatus {
    Uploaded,
    Scanned,
    QualityAssessed,
    QualityRejected,
    RescanRequested,
    ReconstructedApproved,
    BubbleDetected,
    Scored,
    Verified,
    Completed,
}

impl SheetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetStatus::Uploaded => "uploaded",
            SheetStatus::Scanned => "scanned",
            SheetStatus::QualityAssessed => "quality_assessed",
            SheetStatus::QualityRejected => "quality_rejected",
            SheetStatus::RescanRequested => "rescan_requested",
            SheetStatus::ReconstructedApproved => "reconstructed_approved",
            SheetStatus::BubbleDetected => "bubble_detected",
            SheetStatus::Scored => "scored",
            SheetStatus::Verified => "verified",
            SheetStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SheetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SheetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(SheetStatus::Uploaded),
            "scanned" => Ok(SheetStatus::Scanned),
            "quality_assessed" => Ok(SheetStatus::QualityAssessed),
            "quality_rejected" => Ok(SheetStatus::QualityRejected),
            "rescan_requested" => Ok(SheetStatus::RescanRequested),
            "reconstructed_approved" => Ok(SheetStatus::ReconstructedApproved),
            "bubble_detected" => Ok(SheetStatus::BubbleDetected),
            "scored" => Ok(SheetStatus::Scored),
            "verified" => Ok(SheetStatus::Verified),
            "completed" => Ok(SheetStatus::Completed),
            other => Err(format!("unknown sheet status: {other}")),
        }
    }
}

/// The five block-producing stages whose content hashes live on the
/// sheet record for idempotency checks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Scan,
    Bubble,
    Score,
    Verify,
    Result,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Bubble => "bubble",
            Stage::Score => "score",
            Stage::Verify => "verify",
            Stage::Result => "result",
        }
    }
}

/// Lifecycle record for one answer sheet.
///
/// Created by the scan command, mutated only by the state machine,
/// never deleted. Stage hashes record the content hash of each
/// completed stage so a repeated command with an identical payload can
/// be answered with the original block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sheet {
    pub sheet_id: String,
    pub roll_number: String,
    pub exam_id: String,
    pub student_name: Option<String>,
    /// Hash of the originally uploaded file.
    pub original_file_hash: HexHash,
    /// Where the raw image lives in the object store.
    pub object_store_url: Option<String>,
    pub status: SheetStatus,
    pub scan_hash: Option<HexHash>,
    pub bubble_hash: Option<HexHash>,
    pub score_hash: Option<HexHash>,
    pub verify_hash: Option<HexHash>,
    pub result_hash: Option<HexHash>,
    /// Chain indexes of the blocks produced at each stage.
    pub scan_block: Option<u64>,
    pub bubble_block: Option<u64>,
    pub score_block: Option<u64>,
    pub verify_block: Option<u64>,
    pub result_block: Option<u64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Sheet {
    /// Returns the stored content hash and block index for a stage.
    pub fn stage_record(&self, stage: Stage) -> (Option<&HexHash>, Option<u64>) {
        match stage {
            Stage::Scan => (self.scan_hash.as_ref(), self.scan_block),
            Stage::Bubble => (self.bubble_hash.as_ref(), self.bubble_block),
            Stage::Score => (self.score_hash.as_ref(), self.score_block),
            Stage::Verify => (self.verify_hash.as_ref(), self.verify_block),
            Stage::Result => (self.result_hash.as_ref(), self.result_block),
        }
    }

    /// Records the content hash and block index of a completed stage.
    pub fn record_stage(&mut self, stage: Stage, hash: HexHash, block_index: u64) {
        let slot = match stage {
            Stage::Scan => (&mut self.scan_hash, &mut self.scan_block),
            Stage::Bubble => (&mut self.bubble_hash, &mut self.bubble_block),
            Stage::Score => (&mut self.score_hash, &mut self.score_block),
            Stage::Verify => (&mut self.verify_hash, &mut self.verify_block),
            Stage::Result => (&mut self.result_hash, &mut self.result_block),
        };
        *slot.0 = Some(hash);
        *slot.1 = Some(block_index);
    }
}
