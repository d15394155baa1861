//! The evaluation command: marks vs. key, manual tally, discrepancy.
//!
//! Evaluation runs after scoring and before verification. It marks
//! the detected answers against the approved answer key, optionally
//! tallies the automated total against a manually entered one, and
//! appends the `evaluation` block. A tally mismatch beyond the 0.01
//! tolerance files a high-priority `marks_mismatch` intervention,
//! which blocks verification until an operator resolves it.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::LedgerError;
use crate::evaluation::{analyze_discrepancy, mark_sheet, tally_marks};
use crate::hashing;
use crate::store::SqliteStore;
use crate::types::{
    AnswerKeyStatus, BlockType, Evaluation, HumanIntervention, InterventionPriority,
    InterventionStatus, InterventionType, new_id, utc_now_iso,
};

use super::machine::{LifecycleMachine, StageOutcome, store_err};
use super::status::Command;

/// Input to [`LifecycleMachine::evaluate`].
#[derive(Clone, Debug, Deserialize)]
pub struct EvaluateRequest {
    pub sheet_id: String,
    pub key_id: String,
    /// Manually verified total, when a second marking exists.
    #[serde(default)]
    pub manual_total: Option<f64>,
}

impl LifecycleMachine {
    /// Marks the sheet against an approved answer key and appends the
    /// `evaluation` block. The sheet stays `scored`; verification
    /// still gates the result.
    pub fn evaluate(
        &self,
        req: EvaluateRequest,
    ) -> Result<(StageOutcome, Evaluation), LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let sheet = self.load_sheet(&req.sheet_id)?;

        let key = self
            .store
            .get_answer_key(&req.key_id)
            .map_err(store_err)?
            .ok_or_else(|| LedgerError::not_found(format!("answer key {}", req.key_id)))?;
        if key.status != AnswerKeyStatus::Approved {
            return Err(LedgerError::InvalidState {
                entity: format!("answer key {}", req.key_id),
                state: key.status.as_str().to_string(),
                expected: "'approved'",
            });
        }

        // Detected answers come from the sheet's bubble block.
        let bubble_block = sheet
            .bubble_block
            .and_then(|index| self.engine.get(index))
            .ok_or_else(|| {
                LedgerError::not_found(format!("bubble block for sheet {}", req.sheet_id))
            })?;
        let detected: BTreeMap<String, String> = bubble_block
            .data
            .get("detected_answers")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(q, a)| a.as_str().map(|a| (q.clone(), a.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let confidence: BTreeMap<String, f64> = bubble_block
            .data
            .get("detection_confidence")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(q, c)| c.as_f64().map(|c| (q.clone(), c)))
                    .collect()
            })
            .unwrap_or_default();

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(req.sheet_id));
        payload.insert("key_id".into(), json!(req.key_id));
        payload.insert("key_hash".into(), json!(key.key_hash.as_str()));
        payload.insert("manual_total".into(), json!(req.manual_total));
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        if let Some(existing) = self.store.get_evaluation(&req.sheet_id).map_err(store_err)? {
            return match self.find_block_by_content(BlockType::Evaluation, &content_hash) {
                Some(block) => Ok((
                    StageOutcome {
                        sheet_id: req.sheet_id,
                        block,
                        content_hash,
                        status: Some(sheet.status),
                        idempotent_replay: true,
                    },
                    existing,
                )),
                None => Err(LedgerError::already_exists(format!(
                    "evaluation for sheet {} (divergent payload)",
                    req.sheet_id
                ))),
            };
        }
        self.ensure_downstream_open(&sheet)?;
        self.ensure_allowed(&sheet, Command::Evaluate)?;

        let marked = mark_sheet(&detected, &key.answers, &confidence);

        let (marks_match, discrepancy) = match req.manual_total {
            Some(manual) => {
                let (matched, d) = tally_marks(marked.total_marks, manual);
                (Some(matched), Some(d))
            }
            None => (None, None),
        };
        let requires_investigation = marks_match == Some(false);
        let is_perfect_evaluation = marks_match == Some(true);

        let evaluation = Evaluation {
            evaluation_id: new_id(),
            sheet_id: req.sheet_id.clone(),
            key_id: req.key_id.clone(),
            roll_number: sheet.roll_number.clone(),
            exam_id: sheet.exam_id.clone(),
            detected_answers: detected,
            automated_total: marked.total_marks,
            automated_correct: marked.correct,
            automated_incorrect: marked.incorrect,
            automated_unanswered: marked.unanswered,
            automated_percentage: marked.percentage,
            automated_grade: marked.grade.to_string(),
            total_questions: key.answers.len() as u32,
            max_marks: marked.max_marks,
            manual_total: req.manual_total,
            marks_match,
            discrepancy,
            requires_investigation,
            is_perfect_evaluation,
            question_results: marked.question_results,
            evaluated_at: utc_now_iso(),
        };

        let mut data = payload;
        data.insert("automated_total".into(), json!(evaluation.automated_total));
        data.insert("automated_grade".into(), json!(evaluation.automated_grade));
        data.insert("marks_match".into(), json!(marks_match));
        data.insert("discrepancy".into(), json!(discrepancy));
        data.insert(
            "is_perfect_evaluation".into(),
            json!(is_perfect_evaluation),
        );
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let event_data = Value::Object(data.clone());
        let evaluation_for_rows = evaluation.clone();
        let block = self.append_block(BlockType::Evaluation, data, Vec::new(), |conn, block| {
            SqliteStore::insert_evaluation(conn, &evaluation_for_rows)?;

            if requires_investigation {
                let causes = analyze_discrepancy(&evaluation_for_rows.question_results);
                let intervention = HumanIntervention {
                    intervention_id: new_id(),
                    sheet_id: req.sheet_id.clone(),
                    intervention_type: InterventionType::MarksMismatch,
                    pipeline_stage: "evaluation".to_string(),
                    reason: format!(
                        "automated total {} differs from manual total {} by {}; suspected: {}",
                        evaluation_for_rows.automated_total,
                        req.manual_total.unwrap_or_default(),
                        discrepancy.unwrap_or_default(),
                        causes
                            .iter()
                            .map(|c| c.cause.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    priority: InterventionPriority::High,
                    status: InterventionStatus::Pending,
                    resolution: None,
                    resolved_by: None,
                    created_at: utc_now_iso(),
                    resolved_at: None,
                };
                SqliteStore::insert_intervention(conn, &intervention)?;
            }

            SqliteStore::insert_event(
                conn,
                &Self::event_record(
                    &req.sheet_id,
                    "evaluation_completed",
                    event_data.clone(),
                    content_hash.clone(),
                    block.index,
                    "system",
                ),
            )?;
            SqliteStore::insert_action_log(
                conn,
                "evaluation_block_created",
                "sheet",
                &req.sheet_id,
                "system",
                Some(&block.hash),
            )
        })?;

        self.audit_event(
            &req.sheet_id,
            "evaluation_completed",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            "system",
        );

        tracing::info!(
            sheet_id = %req.sheet_id,
            total = evaluation.automated_total,
            grade = %evaluation.automated_grade,
            perfect = is_perfect_evaluation,
            "evaluation completed"
        );

        Ok((
            StageOutcome {
                sheet_id: req.sheet_id,
                block,
                content_hash,
                status: Some(sheet.status),
                idempotent_replay: false,
            },
            evaluation,
        ))
    }
}
