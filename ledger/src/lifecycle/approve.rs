//! Verification, result commitment, rechecks, and intervention
//! resolution.
//!
//! `create_verify` collects the three required approvals through the
//! multi-signature engine; a complete set produces the `verify` block
//! with the signatures embedded, an incomplete one fails with the
//! missing roles enumerated and appends nothing. `commit_result`
//! publishes the final result: it re-validates the chain, appends the
//! `result` block, renders the verification QR code, and caches the
//! result for roll-number lookup.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::LedgerError;
use crate::hashing::{self, ZkpEngine};
use crate::signing::SignatureSet;
use crate::store::SqliteStore;
use crate::types::{
    BlockType, FinalResult, HumanIntervention, InterventionStatus, RecheckRequest, RecheckStatus,
    SheetStatus, SignerType, Stage, new_id, utc_now_iso,
};

use super::machine::{LifecycleMachine, ResultRequest, StageOutcome, store_err};
use super::status::Command;

/// One submitted approval.
#[derive(Clone, Debug, Deserialize)]
pub struct SignerSubmission {
    pub signer_type: SignerType,
    pub signer_key: String,
}

/// Input to [`LifecycleMachine::create_verify`].
#[derive(Clone, Debug, Deserialize)]
pub struct VerifyRequest {
    pub sheet_id: String,
    /// The payload every signer endorses (scores, totals, hashes).
    pub verification_data: Value,
    pub signatures: Vec<SignerSubmission>,
}

/// Input to [`LifecycleMachine::request_recheck`].
#[derive(Clone, Debug, Deserialize)]
pub struct RecheckInput {
    pub sheet_id: String,
    pub requested_by: String,
    pub reason: String,
    #[serde(default)]
    pub questions: Vec<u32>,
}

/// Input to [`LifecycleMachine::resolve_intervention`].
#[derive(Clone, Debug, Deserialize)]
pub struct ResolveRequest {
    pub intervention_id: String,
    pub resolved_by: String,
    pub resolution: String,
}

impl LifecycleMachine {
    /// Collects the multi-party approvals and appends the `verify`
    /// block.
    ///
    /// All three signer roles must submit with their authorized keys;
    /// otherwise the command fails with `signatures_incomplete`
    /// listing the absent roles and no block is produced. A rejected
    /// attempt leaves no signature residue: the next call starts a
    /// fresh set.
    pub fn create_verify(&self, req: VerifyRequest) -> Result<StageOutcome, LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let mut sheet = self.load_sheet(&req.sheet_id)?;

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(req.sheet_id));
        payload.insert("verification_data".into(), req.verification_data.clone());
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        if let Some(block) = self.check_stage_idempotency(&sheet, Stage::Verify, &content_hash)? {
            return Ok(StageOutcome {
                sheet_id: req.sheet_id,
                block,
                content_hash,
                status: Some(sheet.status),
                idempotent_replay: true,
            });
        }
        self.ensure_downstream_open(&sheet)?;
        self.ensure_allowed(&sheet, Command::CreateVerify)?;

        // Fresh signature set per verification attempt.
        let mut set = SignatureSet::new(self.config.signers.clone(), &req.verification_data);
        for submission in &req.signatures {
            set.add_signature(submission.signer_type, &submission.signer_key)?;
        }

        // Fails with the missing signer roles enumerated; nothing has
        // been appended or persisted at this point.
        let proof = set.approval_proof()?;
        let signatures = set.signatures();

        let mut data = payload;
        data.insert("signed_data_hash".into(), json!(set.payload_hash().as_str()));
        data.insert("approval_proof".into(), json!(proof.proof_hash.as_str()));
        data.insert("approval_timestamp".into(), json!(proof.timestamp));
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let event_data = Value::Object(data.clone());
        let signatures_for_rows = signatures.clone();
        let block = self.append_block(
            BlockType::Verify,
            data,
            signatures,
            |conn, block| {
                for sig in &signatures_for_rows {
                    SqliteStore::insert_signature(conn, &req.sheet_id, sig)?;
                }

                sheet.status = SheetStatus::Verified;
                sheet.record_stage(Stage::Verify, content_hash.clone(), block.index);
                SqliteStore::update_sheet(conn, &sheet)?;
                SqliteStore::insert_event(
                    conn,
                    &Self::event_record(
                        &req.sheet_id,
                        "verification",
                        event_data.clone(),
                        content_hash.clone(),
                        block.index,
                        "multi_signature",
                    ),
                )?;
                SqliteStore::upsert_pipeline_stage(
                    conn,
                    &req.sheet_id,
                    SheetStatus::Verified.as_str(),
                    5,
                    "in_progress",
                )?;
                SqliteStore::insert_action_log(
                    conn,
                    "verification_block_created",
                    "sheet",
                    &req.sheet_id,
                    "multi_signature_system",
                    Some(&block.hash),
                )
            },
        )?;

        self.audit_event(
            &req.sheet_id,
            "verification_block_created",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            "multi_signature_system",
        );

        tracing::info!(
            sheet_id = %req.sheet_id,
            block_index = block.index,
            "verification block created with three approvals"
        );

        Ok(StageOutcome {
            sheet_id: req.sheet_id,
            block,
            content_hash,
            status: Some(SheetStatus::Verified),
            idempotent_replay: false,
        })
    }

    /// Publishes the final result of a verified sheet.
    ///
    /// Re-validates the chain first (an invalid chain is fatal for
    /// the sheet and still leaves an `integrity_violation` audit
    /// entry), then appends the `result` block, renders the QR
    /// payload, stores the ZKP commitment, and caches the result for
    /// roll-number lookup.
    pub fn commit_result(
        &self,
        req: ResultRequest,
    ) -> Result<(StageOutcome, FinalResult), LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let mut sheet = self.load_sheet(&req.sheet_id)?;

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(req.sheet_id));
        payload.insert("roll_number".into(), json!(sheet.roll_number));
        payload.insert("total_questions".into(), json!(req.total_questions));
        payload.insert("correct_answers".into(), json!(req.correct_answers));
        payload.insert("incorrect_answers".into(), json!(req.incorrect_answers));
        payload.insert("unanswered".into(), json!(req.unanswered));
        payload.insert("total_marks".into(), json!(req.total_marks));
        payload.insert("percentage".into(), json!(req.percentage));
        payload.insert("grade".into(), json!(req.grade));
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        if let Some(block) = self.check_stage_idempotency(&sheet, Stage::Result, &content_hash)? {
            let result = self
                .store
                .get_result_by_roll(&sheet.roll_number)
                .map_err(store_err)?
                .ok_or_else(|| LedgerError::IntegrityViolation {
                    context: format!(
                        "sheet {} has a result block but no result row",
                        req.sheet_id
                    ),
                })?;
            return Ok((
                StageOutcome {
                    sheet_id: req.sheet_id,
                    block,
                    content_hash,
                    status: Some(sheet.status),
                    idempotent_replay: true,
                },
                result,
            ));
        }
        self.ensure_downstream_open(&sheet)?;
        self.ensure_allowed(&sheet, Command::CommitResult)?;

        // The result must never land on a chain that no longer
        // verifies. The failed command still leaves an audit trace.
        let report = self.engine.validate();
        if !report.is_valid {
            let context = report
                .error
                .unwrap_or_else(|| "chain validation failed".to_string());
            self.metrics.integrity_violations.inc();
            self.audit_event(
                &req.sheet_id,
                "integrity_violation",
                json!({ "sheet_id": req.sheet_id, "error": context }),
                None,
                "system",
            );
            return Err(LedgerError::IntegrityViolation { context });
        }

        let mut data = payload;
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let verify_url = format!(
            "{}/{}",
            self.config.verify_url_base.trim_end_matches('/'),
            sheet.roll_number
        );
        let zkp_proof = self.zkp.generate(&content_hash);

        let event_data = Value::Object(data.clone());
        let mut committed: Option<FinalResult> = None;
        let block = self.append_block(BlockType::Result, data, Vec::new(), |conn, block| {
            let qr_payload = hashing::canonical_json(&json!({
                "roll_number": sheet.roll_number,
                "result_hash": content_hash.as_str(),
                "blockchain_hash": block.hash.as_str(),
                "verify_url": verify_url,
            }));
            let qr_png_base64 = render_qr_png(&qr_payload)
                .map_err(|e| crate::store::StoreError::Corrupted(format!("qr render: {e}")))?;

            let result = FinalResult {
                result_id: new_id(),
                sheet_id: req.sheet_id.clone(),
                roll_number: sheet.roll_number.clone(),
                total_questions: req.total_questions,
                correct_answers: req.correct_answers,
                incorrect_answers: req.incorrect_answers,
                unanswered: req.unanswered,
                total_marks: req.total_marks,
                percentage: req.percentage,
                grade: req.grade.clone(),
                result_hash: content_hash.clone(),
                block_hash: block.hash.clone(),
                qr_payload,
                qr_png_base64,
                zkp_commitment: Some(zkp_proof.commitment.clone()),
                published_at: utc_now_iso(),
            };

            SqliteStore::insert_result(conn, &result)?;

            sheet.status = SheetStatus::Completed;
            sheet.record_stage(Stage::Result, content_hash.clone(), block.index);
            SqliteStore::update_sheet(conn, &sheet)?;
            SqliteStore::insert_event(
                conn,
                &Self::event_record(
                    &req.sheet_id,
                    "result_committed",
                    event_data.clone(),
                    content_hash.clone(),
                    block.index,
                    "system",
                ),
            )?;
            SqliteStore::upsert_pipeline_stage(
                conn,
                &req.sheet_id,
                SheetStatus::Completed.as_str(),
                7,
                "completed",
            )?;
            SqliteStore::insert_action_log(
                conn,
                "result_committed",
                "sheet",
                &req.sheet_id,
                "system",
                Some(&block.hash),
            )?;

            committed = Some(result);
            Ok(())
        })?;

        let result = committed.expect("result built inside the append transaction");

        self.audit_event(
            &req.sheet_id,
            "result_committed",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            "system",
        );

        tracing::info!(
            sheet_id = %req.sheet_id,
            roll_number = %result.roll_number,
            grade = %result.grade,
            "result committed and published"
        );

        Ok((
            StageOutcome {
                sheet_id: req.sheet_id,
                block,
                content_hash,
                status: Some(SheetStatus::Completed),
                idempotent_replay: false,
            },
            result,
        ))
    }

    /// Files a recheck request against a completed sheet.
    ///
    /// The original sheet and its result are retained untouched; the
    /// recheck is its own block layered on top, and the sheet status
    /// stays `completed`.
    pub fn request_recheck(
        &self,
        req: RecheckInput,
    ) -> Result<(StageOutcome, RecheckRequest), LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let sheet = self.load_sheet(&req.sheet_id)?;

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(req.sheet_id));
        payload.insert("requested_by".into(), json!(req.requested_by));
        payload.insert("reason".into(), json!(req.reason));
        payload.insert("questions".into(), json!(req.questions));
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        if let Some(block) = self.find_block_by_content(BlockType::Recheck, &content_hash) {
            let existing = self
                .store
                .rechecks_for_sheet(&req.sheet_id)
                .map_err(store_err)?
                .into_iter()
                .find(|r| r.recheck_hash.as_ref() == Some(&content_hash))
                .ok_or_else(|| LedgerError::IntegrityViolation {
                    context: format!(
                        "recheck block exists for sheet {} but no request row",
                        req.sheet_id
                    ),
                })?;
            return Ok((
                StageOutcome {
                    sheet_id: req.sheet_id,
                    block,
                    content_hash,
                    status: Some(sheet.status),
                    idempotent_replay: true,
                },
                existing,
            ));
        }
        self.ensure_allowed(&sheet, Command::RequestRecheck)?;

        let mut data = payload;
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let mut recheck = RecheckRequest {
            request_id: new_id(),
            sheet_id: req.sheet_id.clone(),
            requested_by: req.requested_by.clone(),
            reason: req.reason.clone(),
            questions: req.questions.clone(),
            status: RecheckStatus::Pending,
            recheck_hash: Some(content_hash.clone()),
            recheck_block: None,
            requested_at: utc_now_iso(),
        };

        let event_data = Value::Object(data.clone());
        let block = self.append_block(BlockType::Recheck, data, Vec::new(), |conn, block| {
            recheck.recheck_block = Some(block.index);
            SqliteStore::insert_recheck(conn, &recheck)?;
            SqliteStore::insert_event(
                conn,
                &Self::event_record(
                    &req.sheet_id,
                    "recheck_requested",
                    event_data.clone(),
                    content_hash.clone(),
                    block.index,
                    &req.requested_by,
                ),
            )?;
            SqliteStore::insert_action_log(
                conn,
                "recheck_requested",
                "sheet",
                &req.sheet_id,
                &req.requested_by,
                Some(&block.hash),
            )
        })?;

        self.audit_event(
            &req.sheet_id,
            "recheck_requested",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            &req.requested_by,
        );

        let stored = self
            .store
            .rechecks_for_sheet(&req.sheet_id)
            .map_err(store_err)?
            .into_iter()
            .find(|r| r.recheck_hash.as_ref() == Some(&content_hash))
            .unwrap_or(recheck);

        Ok((
            StageOutcome {
                sheet_id: req.sheet_id,
                block,
                content_hash,
                // Rechecks do not move the sheet out of `completed`.
                status: Some(sheet.status),
                idempotent_replay: false,
            },
            stored,
        ))
    }

    /// Records an operator's resolution of a pending intervention on
    /// the chain.
    pub fn resolve_intervention(
        &self,
        req: ResolveRequest,
    ) -> Result<(StageOutcome, HumanIntervention), LedgerError> {
        let mut intervention = self
            .store
            .get_intervention(&req.intervention_id)
            .map_err(store_err)?
            .ok_or_else(|| {
                LedgerError::not_found(format!("intervention {}", req.intervention_id))
            })?;

        let lock = self.locks.for_sheet(&intervention.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        if intervention.status != InterventionStatus::Pending {
            return Err(LedgerError::already_exists(format!(
                "resolution for intervention {}",
                req.intervention_id
            )));
        }

        let mut data = Map::new();
        data.insert("intervention_id".into(), json!(req.intervention_id));
        data.insert("sheet_id".into(), json!(intervention.sheet_id));
        data.insert(
            "intervention_type".into(),
            json!(intervention.intervention_type.as_str()),
        );
        data.insert("resolution".into(), json!(req.resolution));
        data.insert("resolved_by".into(), json!(req.resolved_by));
        let content_hash = hashing::hash_value(&Value::Object(data.clone()));
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        intervention.status = InterventionStatus::Resolved;
        intervention.resolution = Some(req.resolution.clone());
        intervention.resolved_by = Some(req.resolved_by.clone());
        intervention.resolved_at = Some(utc_now_iso());

        let sheet_id = intervention.sheet_id.clone();
        let intervention_for_rows = intervention.clone();
        let event_data = Value::Object(data.clone());
        let block = self.append_block(
            BlockType::HumanIntervention,
            data,
            Vec::new(),
            |conn, block| {
                SqliteStore::update_intervention(conn, &intervention_for_rows)?;

                // Key-level interventions have no sheet row to hang
                // an event on.
                if SqliteStore::get_sheet_tx(conn, &sheet_id)?.is_some() {
                    SqliteStore::insert_event(
                        conn,
                        &Self::event_record(
                            &sheet_id,
                            "intervention_resolved",
                            event_data.clone(),
                            content_hash.clone(),
                            block.index,
                            &req.resolved_by,
                        ),
                    )?;
                }
                SqliteStore::insert_action_log(
                    conn,
                    "intervention_resolved",
                    "intervention",
                    &req.intervention_id,
                    &req.resolved_by,
                    Some(&block.hash),
                )
            },
        )?;

        self.audit_event(
            &sheet_id,
            "intervention_resolved",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            &req.resolved_by,
        );

        Ok((
            StageOutcome {
                sheet_id,
                block,
                content_hash,
                status: None,
                idempotent_replay: false,
            },
            intervention,
        ))
    }

    /// Published-result lookup by roll number.
    pub fn lookup_result(&self, roll_number: &str) -> Result<Option<FinalResult>, LedgerError> {
        self.store.get_result_by_roll(roll_number).map_err(store_err)
    }
}

/// Renders the QR payload into a base64-encoded PNG.
fn render_qr_png(payload: &str) -> Result<String, String> {
    const SCALE: u32 = 8;
    const QUIET_ZONE: u32 = 4;

    let code = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|e| format!("payload does not fit a QR code: {e}"))?;

    let width = code.width() as u32;
    let size = (width + 2 * QUIET_ZONE) * SCALE;
    let mut img = image::GrayImage::from_pixel(size, size, image::Luma([255u8]));

    for (i, color) in code.to_colors().into_iter().enumerate() {
        if color == qrcode::Color::Dark {
            let x0 = (i as u32 % width + QUIET_ZONE) * SCALE;
            let y0 = (i as u32 / width + QUIET_ZONE) * SCALE;
            for dy in 0..SCALE {
                for dx in 0..SCALE {
                    img.put_pixel(x0 + dx, y0 + dy, image::Luma([0u8]));
                }
            }
        }
    }

    let mut png = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(
            &mut std::io::Cursor::new(&mut png),
            image::ImageOutputFormat::Png,
        )
        .map_err(|e| format!("png encoding failed: {e}"))?;

    Ok(base64::encode(&png))
}

#[cfg(test)]
mod qr_tests {
    use super::render_qr_png;

    #[test]
    fn qr_payload_renders_to_png() {
        let b64 = render_qr_png(r#"{"roll_number":"ROLL_1"}"#).expect("renders");
        let bytes = base64::decode(&b64).expect("valid base64");
        // PNG magic header.
        assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }
}
