//! Answer-key, quality, evaluation, and intervention records.
//!
//! These are the domain records the lifecycle produces around the
//! chain itself: the exam-level answer key with its verification
//! status, the per-sheet quality assessment, the computed evaluation,
//! queued human interventions, recheck requests, and the published
//! final result.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::HexHash;

/// One question of an answer key: the expected answer and its marks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub answer: String,
    pub marks: f64,
}

/// Verification status of an answer key.
///
/// Keys progress `PendingVerification → (Verified | Flagged) →
/// Approved`; only approved keys may be used for evaluation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKeyStatus {
    PendingVerification,
    Verified,
    Flagged,
    Approved,
}

impl AnswerKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerKeyStatus::PendingVerification => "pending_verification",
            AnswerKeyStatus::Verified => "verified",
            AnswerKeyStatus::Flagged => "flagged",
            AnswerKeyStatus::Approved => "approved",
        }
    }
}

impl FromStr for AnswerKeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_verification" => Ok(AnswerKeyStatus::PendingVerification),
            "verified" => Ok(AnswerKeyStatus::Verified),
            "flagged" => Ok(AnswerKeyStatus::Flagged),
            "approved" => Ok(AnswerKeyStatus::Approved),
            other => Err(format!("unknown answer key status: {other}")),
        }
    }
}

/// Answer key for one exam paper.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerKey {
    pub key_id: String,
    pub paper_id: String,
    pub exam_id: String,
    /// Question id (`Q1`..`Qn`) to entry. BTreeMap keeps storage and
    /// hashing stable; contiguity is validated separately.
    pub answers: BTreeMap<String, KeyEntry>,
    pub status: AnswerKeyStatus,
    pub key_hash: HexHash,
    /// Mean confidence reported by AI verification, when run.
    pub ai_confidence: Option<f64>,
    /// Question numbers flagged for human review.
    pub flagged_questions: Vec<u32>,
    pub created_at: String,
    pub verified_at: Option<String>,
}

/// Question paper metadata registered before keys and sheets arrive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionPaper {
    pub paper_id: String,
    pub exam_id: String,
    pub subject: String,
    pub title: Option<String>,
    pub total_questions: u32,
    pub max_marks: f64,
    pub file_hash: HexHash,
    pub uploaded_at: String,
}

/// Coarse damage severity reported by quality assessment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageSeverity {
    Low,
    Medium,
    High,
    Severe,
}

impl DamageSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DamageSeverity::Low => "low",
            DamageSeverity::Medium => "medium",
            DamageSeverity::High => "high",
            DamageSeverity::Severe => "severe",
        }
    }
}

/// Outcome of assessing one scanned sheet's physical quality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub assessment_id: String,
    pub sheet_id: String,
    pub has_damage: bool,
    pub damage_types: Vec<String>,
    pub damage_severity: Option<DamageSeverity>,
    /// 0.0 (unusable) to 1.0 (pristine).
    pub overall_quality_score: f64,
    pub is_recoverable: bool,
    pub requires_reconstruction: bool,
    pub reconstruction_performed: bool,
    pub reconstruction_quality: Option<f64>,
    pub approved_for_evaluation: bool,
    pub flagged_for_review: bool,
    pub flag_reason: Option<String>,
    pub requires_human_intervention: bool,
    pub total_damage_count: u32,
    pub severe_damage_count: u32,
    /// Vision model that produced the assessment, when AI-driven.
    pub assessment_model: Option<String>,
    pub assessed_at: String,
}

/// Per-question outcome of marking a sheet against the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question: String,
    pub correct_answer: String,
    pub student_answer: String,
    pub is_correct: bool,
    pub marks_earned: f64,
    pub marks_possible: f64,
    pub confidence: f64,
}

/// Computed score for one sheet.
///
/// An evaluation is *perfect* when manual marks were provided and
/// agree with the automated total within 0.01; anything else with a
/// manual total present requires investigation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evaluation {
    pub evaluation_id: String,
    pub sheet_id: String,
    pub key_id: String,
    pub roll_number: String,
    pub exam_id: String,
    pub detected_answers: BTreeMap<String, String>,
    pub automated_total: f64,
    pub automated_correct: u32,
    pub automated_incorrect: u32,
    pub automated_unanswered: u32,
    pub automated_percentage: f64,
    pub automated_grade: String,
    pub total_questions: u32,
    pub max_marks: f64,
    pub manual_total: Option<f64>,
    pub marks_match: Option<bool>,
    pub discrepancy: Option<f64>,
    pub requires_investigation: bool,
    pub is_perfect_evaluation: bool,
    pub question_results: Vec<QuestionResult>,
    pub evaluated_at: String,
}

/// Why a human was pulled into the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    QualityReview,
    AnswerKeyFlagged,
    DetectionAmbiguous,
    MarksMismatch,
}

impl InterventionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionType::QualityReview => "quality_review",
            InterventionType::AnswerKeyFlagged => "answer_key_flagged",
            InterventionType::DetectionAmbiguous => "detection_ambiguous",
            InterventionType::MarksMismatch => "marks_mismatch",
        }
    }
}

impl FromStr for InterventionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quality_review" => Ok(InterventionType::QualityReview),
            "answer_key_flagged" => Ok(InterventionType::AnswerKeyFlagged),
            "detection_ambiguous" => Ok(InterventionType::DetectionAmbiguous),
            "marks_mismatch" => Ok(InterventionType::MarksMismatch),
            other => Err(format!("unknown intervention type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl InterventionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionPriority::Low => "low",
            InterventionPriority::Medium => "medium",
            InterventionPriority::High => "high",
            InterventionPriority::Critical => "critical",
        }
    }
}

impl FromStr for InterventionPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(InterventionPriority::Low),
            "medium" => Ok(InterventionPriority::Medium),
            "high" => Ok(InterventionPriority::High),
            "critical" => Ok(InterventionPriority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    InReview,
    Resolved,
    Escalated,
}

impl InterventionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionStatus::Pending => "pending",
            InterventionStatus::InReview => "in_review",
            InterventionStatus::Resolved => "resolved",
            InterventionStatus::Escalated => "escalated",
        }
    }
}

impl FromStr for InterventionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InterventionStatus::Pending),
            "in_review" => Ok(InterventionStatus::InReview),
            "resolved" => Ok(InterventionStatus::Resolved),
            "escalated" => Ok(InterventionStatus::Escalated),
            other => Err(format!("unknown intervention status: {other}")),
        }
    }
}

/// A queued manual action created by the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HumanIntervention {
    pub intervention_id: String,
    pub sheet_id: String,
    pub intervention_type: InterventionType,
    /// Pipeline stage that raised the flag.
    pub pipeline_stage: String,
    pub reason: String,
    pub priority: InterventionPriority,
    pub status: InterventionStatus,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecheckStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
}

impl RecheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecheckStatus::Pending => "pending",
            RecheckStatus::InProgress => "in_progress",
            RecheckStatus::Completed => "completed",
            RecheckStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for RecheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecheckStatus::Pending),
            "in_progress" => Ok(RecheckStatus::InProgress),
            "completed" => Ok(RecheckStatus::Completed),
            "rejected" => Ok(RecheckStatus::Rejected),
            other => Err(format!("unknown recheck status: {other}")),
        }
    }
}

/// Re-evaluation request layered on top of a completed sheet.
///
/// The original sheet and its result stay untouched; the recheck is
/// recorded as its own block and tracked here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecheckRequest {
    pub request_id: String,
    pub sheet_id: String,
    pub requested_by: String,
    pub reason: String,
    pub questions: Vec<u32>,
    pub status: RecheckStatus,
    pub recheck_hash: Option<HexHash>,
    pub recheck_block: Option<u64>,
    pub requested_at: String,
}

/// Published final result for one sheet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalResult {
    pub result_id: String,
    pub sheet_id: String,
    pub roll_number: String,
    pub total_questions: u32,
    pub correct_answers: u32,
    pub incorrect_answers: u32,
    pub unanswered: u32,
    pub total_marks: f64,
    pub percentage: f64,
    pub grade: String,
    pub result_hash: HexHash,
    /// Chain hash of the result block.
    pub block_hash: HexHash,
    /// Canonical-JSON QR payload (`roll_number`, `result_hash`,
    /// `blockchain_hash`, `verify_url`).
    pub qr_payload: String,
    /// Base64-encoded PNG rendering of the QR payload.
    pub qr_png_base64: String,
    /// Commitment from the ZKP placeholder engine.
    pub zkp_commitment: Option<String>,
    pub published_at: String,
}

impl fmt::Display for InterventionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order_low_to_critical() {
        assert!(InterventionPriority::Low < InterventionPriority::High);
        assert!(InterventionPriority::High < InterventionPriority::Critical);
    }

    #[test]
    fn enum_strings_round_trip() {
        assert_eq!(
            "quality_review".parse::<InterventionType>().expect("parses"),
            InterventionType::QualityReview
        );
        assert_eq!(
            "pending_verification"
                .parse::<AnswerKeyStatus>()
                .expect("parses"),
            AnswerKeyStatus::PendingVerification
        );
        assert_eq!(
            "in_progress".parse::<RecheckStatus>().expect("parses"),
            RecheckStatus::InProgress
        );
    }
}
