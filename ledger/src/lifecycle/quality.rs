//! Quality assessment, human review, and reconstruction commands.
//!
//! The quality gate sits between scanning and bubble detection.
//! Approval requires an overall quality score of at least 0.7 on a
//! recoverable sheet; badly damaged sheets (more than three severe
//! regions, or a score below 0.5, or unrecoverable) additionally
//! raise a high-priority `quality_review` intervention. Rejected but
//! recoverable sheets can re-enter the pipeline through AI
//! reconstruction or an explicit human review decision.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::LedgerError;
use crate::hashing;
use crate::store::SqliteStore;
use crate::types::{
    BlockType, DamageSeverity, HumanIntervention, InterventionPriority, InterventionStatus,
    InterventionType, QualityAssessment, SheetStatus, new_id, utc_now_iso,
};

use super::machine::{LifecycleMachine, StageOutcome, store_err};
use super::status::Command;

/// Quality gate thresholds.
pub const APPROVAL_SCORE: f64 = 0.7;
pub const INTERVENTION_SCORE: f64 = 0.5;
pub const SEVERE_DAMAGE_LIMIT: u32 = 3;

/// Damage-detection figures feeding the quality gate, as reported by
/// the vision model (or entered by an operator).
#[derive(Clone, Debug, Deserialize)]
pub struct QualityReport {
    pub has_damage: bool,
    #[serde(default)]
    pub damage_types: Vec<String>,
    pub overall_quality_score: f64,
    pub is_recoverable: bool,
    #[serde(default)]
    pub total_damage_count: u32,
    #[serde(default)]
    pub severe_damage_count: u32,
    #[serde(default)]
    pub assessment_model: Option<String>,
}

/// Human decision on a flagged or rejected sheet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityDecision {
    Approve,
    Reject,
    RequestRescan,
}

impl QualityDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityDecision::Approve => "approve",
            QualityDecision::Reject => "reject",
            QualityDecision::RequestRescan => "request_rescan",
        }
    }
}

/// Input to [`LifecycleMachine::review_quality`].
#[derive(Clone, Debug, Deserialize)]
pub struct ReviewRequest {
    pub sheet_id: String,
    pub reviewer: String,
    pub decision: QualityDecision,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Applies the gate rules to a report, producing the stored
/// assessment record.
fn build_assessment(sheet_id: &str, report: &QualityReport) -> QualityAssessment {
    let score = report.overall_quality_score;
    let severe = report.severe_damage_count;

    let approved_for_evaluation =
        !report.has_damage || (score >= APPROVAL_SCORE && report.is_recoverable);
    let requires_reconstruction =
        report.has_damage && score < APPROVAL_SCORE && report.is_recoverable;
    let requires_human_intervention =
        !report.is_recoverable || severe > SEVERE_DAMAGE_LIMIT || score < INTERVENTION_SCORE;
    let flagged_for_review =
        requires_human_intervention || (report.has_damage && score < 0.6);

    let damage_severity = if severe > 5 {
        Some(DamageSeverity::Severe)
    } else if severe > 2 {
        Some(DamageSeverity::High)
    } else if report.total_damage_count > 5 {
        Some(DamageSeverity::Medium)
    } else if report.has_damage {
        Some(DamageSeverity::Low)
    } else {
        None
    };

    let flag_reason = if !report.is_recoverable {
        Some("sheet damage is too severe and not recoverable".to_string())
    } else if severe > SEVERE_DAMAGE_LIMIT {
        Some(format!("sheet has {severe} severe damage regions"))
    } else if score < INTERVENTION_SCORE {
        Some(format!("overall quality score too low: {score:.2}"))
    } else if flagged_for_review {
        Some("quality assessment requires human review".to_string())
    } else {
        None
    };

    QualityAssessment {
        assessment_id: new_id(),
        sheet_id: sheet_id.to_string(),
        has_damage: report.has_damage,
        damage_types: report.damage_types.clone(),
        damage_severity,
        overall_quality_score: score,
        is_recoverable: report.is_recoverable,
        requires_reconstruction,
        reconstruction_performed: false,
        reconstruction_quality: None,
        approved_for_evaluation,
        flagged_for_review,
        flag_reason,
        requires_human_intervention,
        total_damage_count: report.total_damage_count,
        severe_damage_count: severe,
        assessment_model: report.assessment_model.clone(),
        assessed_at: utc_now_iso(),
    }
}

impl LifecycleMachine {
    /// Runs the quality gate over a damage report and appends the
    /// `quality_assessment` block.
    ///
    /// Approval moves the sheet to `quality_assessed`; failure moves
    /// it to `quality_rejected`, and sufficiently bad damage also
    /// files a high-priority `quality_review` intervention. Both
    /// outcomes produce a block.
    pub fn assess_quality(
        &self,
        sheet_id: &str,
        report: QualityReport,
    ) -> Result<StageOutcome, LedgerError> {
        let lock = self.locks.for_sheet(sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let mut sheet = self.load_sheet(sheet_id)?;

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(sheet_id));
        payload.insert("has_damage".into(), json!(report.has_damage));
        payload.insert(
            "overall_quality_score".into(),
            json!(report.overall_quality_score),
        );
        payload.insert("is_recoverable".into(), json!(report.is_recoverable));
        payload.insert(
            "total_damage_count".into(),
            json!(report.total_damage_count),
        );
        payload.insert(
            "severe_damage_count".into(),
            json!(report.severe_damage_count),
        );
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        // One assessment per sheet: an identical repeat replays the
        // original block, a divergent one conflicts.
        if let Some(existing) = self.store.get_quality(sheet_id).map_err(store_err)? {
            return match self
                .find_block_by_content(BlockType::QualityAssessment, &content_hash)
            {
                Some(block) => Ok(StageOutcome {
                    sheet_id: sheet_id.to_string(),
                    block,
                    content_hash,
                    status: Some(sheet.status),
                    idempotent_replay: true,
                }),
                None => Err(LedgerError::already_exists(format!(
                    "quality assessment {} for sheet {sheet_id} (divergent payload)",
                    existing.assessment_id
                ))),
            };
        }
        self.ensure_allowed(&sheet, Command::AssessQuality)?;

        let assessment = build_assessment(sheet_id, &report);
        let new_status = if assessment.approved_for_evaluation {
            SheetStatus::QualityAssessed
        } else {
            SheetStatus::QualityRejected
        };

        let mut data = payload;
        data.insert(
            "approved_for_evaluation".into(),
            json!(assessment.approved_for_evaluation),
        );
        data.insert(
            "requires_reconstruction".into(),
            json!(assessment.requires_reconstruction),
        );
        data.insert(
            "requires_human_intervention".into(),
            json!(assessment.requires_human_intervention),
        );
        data.insert("flag_reason".into(), json!(assessment.flag_reason));
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let event_data = Value::Object(data.clone());
        let assessment_for_rows = assessment.clone();
        let block = self.append_block(
            BlockType::QualityAssessment,
            data,
            Vec::new(),
            |conn, block| {
                SqliteStore::insert_quality(conn, &assessment_for_rows)?;

                if assessment_for_rows.requires_human_intervention {
                    let intervention = HumanIntervention {
                        intervention_id: new_id(),
                        sheet_id: sheet_id.to_string(),
                        intervention_type: InterventionType::QualityReview,
                        pipeline_stage: "quality_assessment".to_string(),
                        reason: assessment_for_rows
                            .flag_reason
                            .clone()
                            .unwrap_or_else(|| "quality gate failed".to_string()),
                        priority: InterventionPriority::High,
                        status: InterventionStatus::Pending,
                        resolution: None,
                        resolved_by: None,
                        created_at: utc_now_iso(),
                        resolved_at: None,
                    };
                    SqliteStore::insert_intervention(conn, &intervention)?;
                }

                sheet.status = new_status;
                SqliteStore::update_sheet(conn, &sheet)?;
                SqliteStore::insert_event(
                    conn,
                    &Self::event_record(
                        sheet_id,
                        "quality_assessed",
                        event_data.clone(),
                        content_hash.clone(),
                        block.index,
                        "system",
                    ),
                )?;
                SqliteStore::upsert_pipeline_stage(
                    conn,
                    sheet_id,
                    new_status.as_str(),
                    2,
                    if assessment_for_rows.approved_for_evaluation {
                        "in_progress"
                    } else {
                        "flagged"
                    },
                )?;
                SqliteStore::insert_action_log(
                    conn,
                    "quality_assessment_created",
                    "sheet",
                    sheet_id,
                    "system",
                    Some(&block.hash),
                )
            },
        )?;

        self.audit_event(
            sheet_id,
            "quality_assessment_created",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            assessment
                .assessment_model
                .as_deref()
                .unwrap_or("system"),
        );

        tracing::info!(
            sheet_id,
            approved = assessment.approved_for_evaluation,
            score = assessment.overall_quality_score,
            "quality assessed"
        );

        Ok(StageOutcome {
            sheet_id: sheet_id.to_string(),
            block,
            content_hash,
            status: Some(new_status),
            idempotent_replay: false,
        })
    }

    /// AI-driven variant of [`assess_quality`]: fetches the stored
    /// image and runs damage detection through the provider stack
    /// (retry + mock fallback included).
    ///
    /// [`assess_quality`]: LifecycleMachine::assess_quality
    pub fn assess_quality_with_ai(&self, sheet_id: &str) -> Result<StageOutcome, LedgerError> {
        let image = self.fetch_sheet_image(sheet_id)?;
        let response = self
            .ai
            .detect_damage(&image)
            .map_err(|e| LedgerError::ExternalFailed {
                source: e.to_string(),
            })?;

        let out = &response.output;
        let report = QualityReport {
            has_damage: out
                .get("has_damage")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            damage_types: out
                .get("damage_types")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            overall_quality_score: out
                .get("overall_quality_score")
                .and_then(Value::as_f64)
                .unwrap_or(response.confidence),
            is_recoverable: out
                .get("is_recoverable")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            total_damage_count: out
                .get("total_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            severe_damage_count: out
                .get("severe_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            assessment_model: out
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some("vision-service".to_string())),
        };

        self.assess_quality(sheet_id, report)
    }

    /// Human review decision on a flagged or rejected sheet.
    ///
    /// Appends a `quality_human_review` block, resolves any pending
    /// `quality_review` interventions, and moves the sheet according
    /// to the decision: approve re-admits it, reject keeps it out,
    /// request-rescan parks it terminally.
    pub fn review_quality(&self, req: ReviewRequest) -> Result<StageOutcome, LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let mut sheet = self.load_sheet(&req.sheet_id)?;
        self.ensure_allowed(&sheet, Command::ReviewQuality)?;

        let new_status = match req.decision {
            QualityDecision::Approve => SheetStatus::QualityAssessed,
            QualityDecision::Reject => SheetStatus::QualityRejected,
            QualityDecision::RequestRescan => SheetStatus::RescanRequested,
        };

        let mut data = Map::new();
        data.insert("sheet_id".into(), json!(req.sheet_id));
        data.insert("reviewer".into(), json!(req.reviewer));
        data.insert("decision".into(), json!(req.decision.as_str()));
        data.insert("notes".into(), json!(req.notes));
        let content_hash = hashing::hash_value(&Value::Object(data.clone()));

        if let Some(block) =
            self.find_block_by_content(BlockType::QualityHumanReview, &content_hash)
        {
            return Ok(StageOutcome {
                sheet_id: req.sheet_id,
                block,
                content_hash,
                status: Some(sheet.status),
                idempotent_replay: true,
            });
        }

        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let pending = self
            .store
            .pending_interventions_for_sheet(&req.sheet_id)
            .map_err(store_err)?;

        let event_data = Value::Object(data.clone());
        let block = self.append_block(
            BlockType::QualityHumanReview,
            data,
            Vec::new(),
            |conn, block| {
                for intervention in &pending {
                    if intervention.intervention_type != InterventionType::QualityReview {
                        continue;
                    }
                    let mut resolved = intervention.clone();
                    resolved.status = InterventionStatus::Resolved;
                    resolved.resolution = Some(format!(
                        "human review: {}",
                        req.decision.as_str()
                    ));
                    resolved.resolved_by = Some(req.reviewer.clone());
                    resolved.resolved_at = Some(utc_now_iso());
                    SqliteStore::update_intervention(conn, &resolved)?;
                }

                if req.decision == QualityDecision::Approve
                    && let Some(mut quality) =
                        SqliteStore::get_quality_tx(conn, &req.sheet_id)?
                {
                    quality.approved_for_evaluation = true;
                    quality.requires_human_intervention = false;
                    quality.flagged_for_review = false;
                    SqliteStore::update_quality(conn, &quality)?;
                }

                sheet.status = new_status;
                SqliteStore::update_sheet(conn, &sheet)?;
                SqliteStore::insert_event(
                    conn,
                    &Self::event_record(
                        &req.sheet_id,
                        "quality_human_review",
                        event_data.clone(),
                        content_hash.clone(),
                        block.index,
                        &req.reviewer,
                    ),
                )?;
                SqliteStore::insert_action_log(
                    conn,
                    "quality_human_review",
                    "sheet",
                    &req.sheet_id,
                    &req.reviewer,
                    Some(&block.hash),
                )
            },
        )?;

        self.audit_event(
            &req.sheet_id,
            "quality_human_review",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            &req.reviewer,
        );

        Ok(StageOutcome {
            sheet_id: req.sheet_id,
            block,
            content_hash,
            status: Some(new_status),
            idempotent_replay: false,
        })
    }

    /// Reconstructs a damaged-but-recoverable sheet through the AI
    /// provider.
    ///
    /// Updates the quality record in place (no new block): a
    /// reconstruction quality of at least 0.7 marks the sheet
    /// `reconstructed_approved`, anything lower leaves it rejected.
    pub fn reconstruct(&self, sheet_id: &str) -> Result<QualityAssessment, LedgerError> {
        // AI call happens before the sheet lock; only the state
        // mutation is serialized.
        let image = self.fetch_sheet_image(sheet_id)?;
        let response = self
            .ai
            .reconstruct_sheet(&image)
            .map_err(|e| LedgerError::ExternalFailed {
                source: e.to_string(),
            })?;

        let lock = self.locks.for_sheet(sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let mut sheet = self.load_sheet(sheet_id)?;
        self.ensure_allowed(&sheet, Command::Reconstruct)?;

        let mut quality = self
            .store
            .get_quality(sheet_id)
            .map_err(store_err)?
            .ok_or_else(|| {
                LedgerError::not_found(format!("quality assessment for sheet {sheet_id}"))
            })?;

        if !quality.requires_reconstruction {
            return Err(LedgerError::InvalidState {
                entity: format!("sheet {sheet_id}"),
                state: sheet.status.as_str().to_string(),
                expected: "'quality_rejected' with a reconstruction flag",
            });
        }

        let reconstruction_quality = response
            .output
            .get("reconstruction_quality")
            .and_then(Value::as_f64)
            .unwrap_or(response.confidence);
        let approved = reconstruction_quality >= APPROVAL_SCORE;

        quality.reconstruction_performed = true;
        quality.reconstruction_quality = Some(reconstruction_quality);
        if approved {
            quality.approved_for_evaluation = true;
            quality.flag_reason = None;
            sheet.status = SheetStatus::ReconstructedApproved;
        }

        self.store
            .with_tx(|conn| {
                SqliteStore::update_quality(conn, &quality)?;
                if approved {
                    SqliteStore::update_sheet(conn, &sheet)?;
                }
                SqliteStore::insert_action_log(
                    conn,
                    "sheet_reconstructed",
                    "sheet",
                    sheet_id,
                    "system",
                    None,
                )
            })
            .map_err(store_err)?;

        self.audit_event(
            sheet_id,
            "sheet_reconstructed",
            json!({
                "sheet_id": sheet_id,
                "reconstruction_quality": reconstruction_quality,
                "approved": approved,
            }),
            None,
            "system",
        );

        tracing::info!(
            sheet_id,
            reconstruction_quality,
            approved,
            "sheet reconstruction finished"
        );

        Ok(quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(score: f64, severe: u32, recoverable: bool) -> QualityReport {
        QualityReport {
            has_damage: true,
            damage_types: vec!["tear".to_string()],
            overall_quality_score: score,
            is_recoverable: recoverable,
            total_damage_count: severe + 1,
            severe_damage_count: severe,
            assessment_model: None,
        }
    }

    #[test]
    fn clean_sheet_is_approved() {
        let a = build_assessment(
            "S",
            &QualityReport {
                has_damage: false,
                damage_types: Vec::new(),
                overall_quality_score: 0.95,
                is_recoverable: true,
                total_damage_count: 0,
                severe_damage_count: 0,
                assessment_model: None,
            },
        );
        assert!(a.approved_for_evaluation);
        assert!(!a.requires_human_intervention);
        assert!(a.damage_severity.is_none());
    }

    #[test]
    fn damaged_but_good_score_is_approved() {
        let a = build_assessment("S", &report(0.85, 0, true));
        assert!(a.approved_for_evaluation);
        assert!(!a.requires_reconstruction);
    }

    #[test]
    fn low_score_recoverable_needs_reconstruction() {
        let a = build_assessment("S", &report(0.6, 0, true));
        assert!(!a.approved_for_evaluation);
        assert!(a.requires_reconstruction);
        assert!(!a.requires_human_intervention);
    }

    #[test]
    fn very_low_score_raises_intervention() {
        let a = build_assessment("S", &report(0.42, 0, true));
        assert!(!a.approved_for_evaluation);
        assert!(a.requires_human_intervention);
        assert!(a.flag_reason.as_deref().unwrap_or("").contains("too low"));
    }

    #[test]
    fn many_severe_damages_raise_intervention() {
        let a = build_assessment("S", &report(0.8, 5, true));
        // Score alone would pass, but the severe-damage count trips
        // the human gate.
        assert!(a.requires_human_intervention);
        assert!(
            a.flag_reason
                .as_deref()
                .unwrap_or("")
                .contains("severe damage regions")
        );
    }

    #[test]
    fn unrecoverable_sheet_is_flagged() {
        let a = build_assessment("S", &report(0.9, 0, false));
        assert!(a.requires_human_intervention);
        assert!(!a.approved_for_evaluation);
        assert!(!a.requires_reconstruction);
    }

    #[test]
    fn severity_ladder() {
        assert_eq!(
            build_assessment("S", &report(0.8, 6, true)).damage_severity,
            Some(DamageSeverity::Severe)
        );
        assert_eq!(
            build_assessment("S", &report(0.8, 3, true)).damage_severity,
            Some(DamageSeverity::High)
        );
        let medium = QualityReport {
            total_damage_count: 7,
            ..report(0.8, 0, true)
        };
        assert_eq!(
            build_assessment("S", &medium).damage_severity,
            Some(DamageSeverity::Medium)
        );
        assert_eq!(
            build_assessment("S", &report(0.8, 0, true)).damage_severity,
            Some(DamageSeverity::Low)
        );
    }
}
