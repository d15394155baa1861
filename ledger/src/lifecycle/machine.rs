//! The lifecycle machine and the scan/bubble/score commands.
//!
//! [`LifecycleMachine`] wires together the ledger engine, the SQLite
//! store, the audit logger, the signer keys, and the external
//! providers. Every command follows the same shape:
//!
//! 1. take the per-sheet lock,
//! 2. check the transition table and idempotency,
//! 3. append exactly one block, committing the block and all
//!    relational rows in one store transaction,
//! 4. write the audit entry,
//! 5. return the block and the new status.
//!
//! The quality, answer-key, evaluation, and approval commands live in
//! the sibling modules and hang off the same struct.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::audit::AuditLogger;
use crate::chain::LedgerEngine;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::hashing::{self, HashCommitmentZkp};
use crate::metrics::MetricsRegistry;
use crate::providers::{AiProvider, ObjectStore, object_key};
use crate::store::sqlite::EventRecord;
use crate::store::{SqliteStore, StoreError};
use crate::types::{
    Block, BlockType, HexHash, Sheet, SheetStatus, SignatureRecord, Stage, new_id, utc_now_iso,
};

use super::locks::SheetLocks;
use super::status::{Command, allowed, expected_states};

/// Result of a block-producing command.
#[derive(Clone, Debug)]
pub struct StageOutcome {
    pub sheet_id: String,
    pub block: Block,
    /// Canonical hash of the stage payload (excludes wall-clock time,
    /// so identical repeats hash identically).
    pub content_hash: HexHash,
    /// Sheet status after the command; `None` for exam-level commands
    /// (question papers, answer keys) that have no sheet.
    pub status: Option<SheetStatus>,
    /// True when this call returned the block of an earlier identical
    /// call instead of appending a new one.
    pub idempotent_replay: bool,
}

/// Input to [`LifecycleMachine::create_scan`].
#[derive(Clone, Debug, Deserialize)]
pub struct ScanRequest {
    pub sheet_id: String,
    pub roll_number: String,
    pub exam_id: String,
    pub student_name: Option<String>,
    /// Declared SHA-256 of the uploaded file.
    pub file_hash: String,
    /// Raw file bytes, base64-encoded. When present the declared hash
    /// is verified and the bytes go to the object store.
    pub file_content_base64: Option<String>,
}

/// Input to [`LifecycleMachine::create_bubble`].
#[derive(Clone, Debug, Deserialize)]
pub struct BubbleRequest {
    pub sheet_id: String,
    /// Question number (`"1"` or `"Q1"`) to detected answer.
    pub detected_answers: BTreeMap<String, String>,
    #[serde(default)]
    pub detection_confidence: BTreeMap<String, f64>,
}

/// Input to [`LifecycleMachine::create_score`].
#[derive(Clone, Debug, Deserialize)]
pub struct ScoreRequest {
    pub sheet_id: String,
    pub model_name: String,
    pub predictions: Value,
    pub confidence: f64,
}

/// Input to [`LifecycleMachine::commit_result`].
#[derive(Clone, Debug, Deserialize)]
pub struct ResultRequest {
    pub sheet_id: String,
    pub total_questions: u32,
    pub correct_answers: u32,
    pub incorrect_answers: u32,
    pub unanswered: u32,
    pub total_marks: f64,
    pub percentage: f64,
    pub grade: String,
}

/// The lifecycle state machine.
pub struct LifecycleMachine {
    pub(crate) engine: Arc<LedgerEngine<Arc<SqliteStore>>>,
    pub(crate) store: Arc<SqliteStore>,
    pub(crate) audit: Arc<AuditLogger>,
    pub(crate) config: LedgerConfig,
    pub(crate) zkp: HashCommitmentZkp,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) ai: Arc<dyn AiProvider>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) locks: SheetLocks,
}

impl LifecycleMachine {
    /// Builds the machine, starting the chain fresh or replaying it
    /// from the store.
    ///
    /// A store with zero blocks gets a new genesis; anything else is
    /// replayed and re-validated, surfacing `integrity_violation` if
    /// the persisted chain disagrees with its own hashes.
    pub fn bootstrap(
        config: LedgerConfig,
        store: Arc<SqliteStore>,
        object_store: Arc<dyn ObjectStore>,
        ai: Arc<dyn AiProvider>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, LedgerError> {
        let audit = Arc::new(AuditLogger::new(&config.audit_log_dir)?);

        let persisted = store.load_blocks().map_err(|e| {
            LedgerError::PersistenceFailed {
                source: format!("load persisted chain: {e}"),
            }
        })?;

        let engine = if persisted.is_empty() {
            tracing::info!("no persisted blocks, creating fresh genesis");
            LedgerEngine::new(config.chain.clone(), store.clone())?
        } else {
            tracing::info!(blocks = persisted.len(), "replaying persisted chain");
            LedgerEngine::replay(config.chain.clone(), persisted, store.clone())?
        };
        metrics.chain_length.set(engine.len() as i64);

        Ok(Self {
            engine: Arc::new(engine),
            store,
            audit,
            config,
            zkp: HashCommitmentZkp,
            object_store,
            ai,
            metrics,
            locks: SheetLocks::new(),
        })
    }

    /// The underlying ledger engine (read-side queries).
    pub fn engine(&self) -> &LedgerEngine<Arc<SqliteStore>> {
        &self.engine
    }

    /// The relational store (read-side queries).
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// The audit logger (read-side queries).
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    pub(crate) fn load_sheet(&self, sheet_id: &str) -> Result<Sheet, LedgerError> {
        self.store
            .get_sheet(sheet_id)
            .map_err(store_err)?
            .ok_or_else(|| LedgerError::not_found(format!("sheet {sheet_id}")))
    }

    pub(crate) fn ensure_allowed(
        &self,
        sheet: &Sheet,
        command: Command,
    ) -> Result<(), LedgerError> {
        if allowed(sheet.status, command) {
            Ok(())
        } else {
            Err(LedgerError::InvalidState {
                entity: format!("sheet {}", sheet.sheet_id),
                state: sheet.status.as_str().to_string(),
                expected: expected_states(command),
            })
        }
    }

    /// Downstream gate: rejected sheets and sheets with pending human
    /// interventions accept no further pipeline commands.
    pub(crate) fn ensure_downstream_open(&self, sheet: &Sheet) -> Result<(), LedgerError> {
        if sheet.status == SheetStatus::QualityRejected {
            let reason = self
                .store
                .get_quality(&sheet.sheet_id)
                .map_err(store_err)?
                .and_then(|q| q.flag_reason)
                .unwrap_or_else(|| "quality gate failed".to_string());
            return Err(LedgerError::QualityRejected {
                sheet_id: sheet.sheet_id.clone(),
                reason,
            });
        }

        let pending = self
            .store
            .pending_interventions_for_sheet(&sheet.sheet_id)
            .map_err(store_err)?;
        if !pending.is_empty() {
            return Err(LedgerError::InvalidState {
                entity: format!("sheet {}", sheet.sheet_id),
                state: sheet.status.as_str().to_string(),
                expected: "resolution of pending human interventions",
            });
        }
        Ok(())
    }

    /// Appends a block and commits it with its relational rows in one
    /// store transaction, updating metrics on the way out.
    pub(crate) fn append_block<F>(
        &self,
        block_type: BlockType,
        data: Map<String, Value>,
        signatures: Vec<SignatureRecord>,
        rows: F,
    ) -> Result<Block, LedgerError>
    where
        F: FnOnce(&Connection, &Block) -> Result<(), StoreError>,
    {
        let started = Instant::now();
        let block = self.engine.append_with(block_type, data, signatures, |block| {
            self.store
                .with_tx(|conn| {
                    SqliteStore::insert_block(conn, block)?;
                    rows(conn, block)
                })
                .map_err(|e| e.to_string())
        })?;

        let metrics = &self.metrics;
        metrics
            .block_mining_seconds
            .observe(started.elapsed().as_secs_f64());
        metrics.blocks_appended.inc();
        metrics.chain_length.set(self.engine.len() as i64);

        Ok(block)
    }

    /// Writes the mirrored audit entry for a committed command.
    ///
    /// The block and rows are already durable here, so an audit write
    /// failure is logged rather than unwinding the command.
    pub(crate) fn audit_event(
        &self,
        sheet_id: &str,
        event_type: &str,
        event_data: Value,
        block_hash: Option<HexHash>,
        actor: &str,
    ) {
        match self
            .audit
            .append(sheet_id, event_type, event_data, block_hash, actor)
        {
            Ok(_) => self.metrics.audit_entries.inc(),
            Err(e) => {
                tracing::error!(sheet_id, event_type, error = %e, "audit append failed");
            }
        }
    }

    /// Builds the relational event row mirroring a block.
    pub(crate) fn event_record(
        sheet_id: &str,
        event_type: &str,
        event_data: Value,
        event_hash: HexHash,
        block_index: u64,
        triggered_by: &str,
    ) -> EventRecord {
        EventRecord {
            event_id: new_id(),
            event_type: event_type.to_string(),
            sheet_id: sheet_id.to_string(),
            block_index: Some(block_index),
            event_data,
            event_hash,
            triggered_by: triggered_by.to_string(),
            timestamp: utc_now_iso(),
        }
    }

    /// Finds an already-appended block of `block_type` carrying the
    /// given payload content hash. Used for idempotent replays of
    /// commands without a stage slot on the sheet.
    pub(crate) fn find_block_by_content(
        &self,
        block_type: BlockType,
        content_hash: &HexHash,
    ) -> Option<Block> {
        self.engine
            .find_by_type(block_type)
            .into_iter()
            .find(|b| {
                b.data
                    .get("content_hash")
                    .and_then(Value::as_str)
                    .is_some_and(|h| h == content_hash.as_str())
            })
    }

    /// Stage-slot idempotency: `Ok(Some(block))` replays an identical
    /// earlier call, `Err` reports a divergent duplicate, `Ok(None)`
    /// means the stage has not run yet.
    pub(crate) fn check_stage_idempotency(
        &self,
        sheet: &Sheet,
        stage: Stage,
        content_hash: &HexHash,
    ) -> Result<Option<Block>, LedgerError> {
        let (existing_hash, existing_block) = sheet.stage_record(stage);
        match existing_hash {
            None => Ok(None),
            Some(h) if h == content_hash => {
                let index = existing_block.ok_or_else(|| LedgerError::IntegrityViolation {
                    context: format!(
                        "sheet {} has a {} hash but no block reference",
                        sheet.sheet_id,
                        stage.as_str()
                    ),
                })?;
                let block = self.engine.get(index).ok_or_else(|| {
                    LedgerError::IntegrityViolation {
                        context: format!(
                            "sheet {} references missing block {index}",
                            sheet.sheet_id
                        ),
                    }
                })?;
                Ok(Some(block))
            }
            Some(_) => Err(LedgerError::already_exists(format!(
                "{} stage for sheet {} (divergent payload)",
                stage.as_str(),
                sheet.sheet_id
            ))),
        }
    }

    // ------------------------------------------------------------------
    // createScan
    // ------------------------------------------------------------------

    /// Registers an uploaded sheet: verifies the declared file hash,
    /// stores the raw image, and appends the `scan` block that brings
    /// the sheet into existence.
    pub fn create_scan(&self, req: ScanRequest) -> Result<StageOutcome, LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let file_hash = HexHash::parse(&req.file_hash).ok_or_else(|| {
            LedgerError::HashMismatch {
                context: "declared file hash is not a valid SHA-256 hex digest".to_string(),
            }
        })?;

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(req.sheet_id));
        payload.insert("roll_number".into(), json!(req.roll_number));
        payload.insert("exam_id".into(), json!(req.exam_id));
        payload.insert("student_name".into(), json!(req.student_name));
        payload.insert("file_hash".into(), json!(file_hash.as_str()));
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        // Idempotency and duplicate detection before any side effect.
        if let Some(existing) = self.store.get_sheet(&req.sheet_id).map_err(store_err)? {
            return match self.check_stage_idempotency(&existing, Stage::Scan, &content_hash)? {
                Some(block) => Ok(StageOutcome {
                    sheet_id: req.sheet_id,
                    block,
                    content_hash,
                    status: Some(existing.status),
                    idempotent_replay: true,
                }),
                None => Err(LedgerError::already_exists(format!(
                    "sheet {}",
                    req.sheet_id
                ))),
            };
        }

        // Verify and store the raw image when provided.
        let mut object_url = None;
        let mut stored_key = None;
        if let Some(content_b64) = &req.file_content_base64 {
            let bytes = base64::decode(content_b64).map_err(|e| LedgerError::HashMismatch {
                context: format!("file content is not valid base64: {e}"),
            })?;

            let actual = hashing::hash_bytes(&bytes);
            if actual != file_hash {
                return Err(LedgerError::HashMismatch {
                    context: format!(
                        "declared file hash {} does not match computed {}",
                        file_hash.as_str(),
                        actual.as_str()
                    ),
                });
            }

            let key = object_key(
                chrono::Utc::now(),
                &file_hash,
                &format!("{}.jpg", req.sheet_id),
            );
            let mut metadata = BTreeMap::new();
            metadata.insert("sheet_id".to_string(), req.sheet_id.clone());
            metadata.insert("roll_number".to_string(), req.roll_number.clone());
            metadata.insert("exam_id".to_string(), req.exam_id.clone());
            let url = self.object_store.put(&key, &bytes, &metadata)?;
            object_url = Some(url);
            stored_key = Some(key);
        }

        let mut data = payload;
        if let Some(key) = &stored_key {
            data.insert("object_key".into(), json!(key));
        }
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let now = utc_now_iso();
        let mut sheet = Sheet {
            sheet_id: req.sheet_id.clone(),
            roll_number: req.roll_number.clone(),
            exam_id: req.exam_id.clone(),
            student_name: req.student_name.clone(),
            original_file_hash: file_hash,
            object_store_url: object_url,
            status: SheetStatus::Scanned,
            scan_hash: None,
            bubble_hash: None,
            score_hash: None,
            verify_hash: None,
            result_hash: None,
            scan_block: None,
            bubble_block: None,
            score_block: None,
            verify_block: None,
            result_block: None,
            created_at: now.clone(),
            updated_at: now,
        };

        let event_data = Value::Object(data.clone());
        let block = self.append_block(BlockType::Scan, data, Vec::new(), |conn, block| {
            sheet.record_stage(Stage::Scan, content_hash.clone(), block.index);
            SqliteStore::insert_sheet(conn, &sheet)?;
            SqliteStore::insert_event(
                conn,
                &Self::event_record(
                    &sheet.sheet_id,
                    "scan_created",
                    event_data.clone(),
                    content_hash.clone(),
                    block.index,
                    "system",
                ),
            )?;
            SqliteStore::upsert_pipeline_stage(
                conn,
                &sheet.sheet_id,
                SheetStatus::Scanned.as_str(),
                1,
                "in_progress",
            )?;
            SqliteStore::insert_action_log(
                conn,
                "scan_block_created",
                "sheet",
                &sheet.sheet_id,
                "system",
                Some(&block.hash),
            )
        })?;

        self.audit_event(
            &req.sheet_id,
            "scan_block_created",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            "system",
        );

        tracing::info!(
            sheet_id = %req.sheet_id,
            block_index = block.index,
            "scan block created"
        );

        Ok(StageOutcome {
            sheet_id: req.sheet_id,
            block,
            content_hash,
            status: Some(SheetStatus::Scanned),
            idempotent_replay: false,
        })
    }

    // ------------------------------------------------------------------
    // createBubble
    // ------------------------------------------------------------------

    /// Records the detected bubble answers for a quality-approved
    /// sheet.
    pub fn create_bubble(&self, req: BubbleRequest) -> Result<StageOutcome, LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let mut sheet = self.load_sheet(&req.sheet_id)?;

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(req.sheet_id));
        payload.insert("detected_answers".into(), json!(req.detected_answers));
        payload.insert(
            "detection_confidence".into(),
            json!(req.detection_confidence),
        );
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        if let Some(block) = self.check_stage_idempotency(&sheet, Stage::Bubble, &content_hash)? {
            return Ok(StageOutcome {
                sheet_id: req.sheet_id,
                block,
                content_hash,
                status: Some(sheet.status),
                idempotent_replay: true,
            });
        }
        self.ensure_downstream_open(&sheet)?;
        self.ensure_allowed(&sheet, Command::CreateBubble)?;

        let mut data = payload;
        data.insert("answer_count".into(), json!(req.detected_answers.len()));
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let event_data = Value::Object(data.clone());
        let block = self.append_block(BlockType::Bubble, data, Vec::new(), |conn, block| {
            sheet.status = SheetStatus::BubbleDetected;
            sheet.record_stage(Stage::Bubble, content_hash.clone(), block.index);
            SqliteStore::update_sheet(conn, &sheet)?;
            SqliteStore::insert_event(
                conn,
                &Self::event_record(
                    &sheet.sheet_id,
                    "bubble_detected",
                    event_data.clone(),
                    content_hash.clone(),
                    block.index,
                    "system",
                ),
            )?;
            SqliteStore::upsert_pipeline_stage(
                conn,
                &sheet.sheet_id,
                SheetStatus::BubbleDetected.as_str(),
                3,
                "in_progress",
            )?;
            SqliteStore::insert_action_log(
                conn,
                "bubble_block_created",
                "sheet",
                &sheet.sheet_id,
                "system",
                Some(&block.hash),
            )
        })?;

        self.audit_event(
            &req.sheet_id,
            "bubble_block_created",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            "system",
        );

        Ok(StageOutcome {
            sheet_id: req.sheet_id,
            block,
            content_hash,
            status: Some(SheetStatus::BubbleDetected),
            idempotent_replay: false,
        })
    }

    /// AI-driven variant of [`create_bubble`]: fetches the stored scan
    /// image, runs bubble detection, and records the detected answers.
    ///
    /// [`create_bubble`]: LifecycleMachine::create_bubble
    pub fn detect_bubbles_with_ai(&self, sheet_id: &str) -> Result<StageOutcome, LedgerError> {
        let image = self.fetch_sheet_image(sheet_id)?;
        let response = self
            .ai
            .detect_bubbles(&image)
            .map_err(|e| LedgerError::ExternalFailed {
                source: e.to_string(),
            })?;

        let mut detected = BTreeMap::new();
        if let Some(answers) = response.output.get("answers").and_then(Value::as_object) {
            for (question, answer) in answers {
                if let Some(a) = answer.as_str() {
                    detected.insert(question.clone(), a.to_string());
                }
            }
        }

        let mut confidence = BTreeMap::new();
        for question in detected.keys() {
            confidence.insert(question.clone(), response.confidence);
        }

        self.create_bubble(BubbleRequest {
            sheet_id: sheet_id.to_string(),
            detected_answers: detected,
            detection_confidence: confidence,
        })
    }

    /// Reads the sheet's raw image back from the object store, using
    /// the key recorded in the scan block.
    pub(crate) fn fetch_sheet_image(&self, sheet_id: &str) -> Result<Vec<u8>, LedgerError> {
        let sheet = self.load_sheet(sheet_id)?;
        let scan_block = sheet
            .scan_block
            .and_then(|index| self.engine.get(index))
            .ok_or_else(|| LedgerError::not_found(format!("scan block for sheet {sheet_id}")))?;

        let key = scan_block
            .data
            .get("object_key")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LedgerError::not_found(format!("stored image for sheet {sheet_id}"))
            })?;

        self.object_store.get(key)
    }

    // ------------------------------------------------------------------
    // createScore
    // ------------------------------------------------------------------

    /// Records the AI scoring pass over the detected answers.
    pub fn create_score(&self, req: ScoreRequest) -> Result<StageOutcome, LedgerError> {
        let lock = self.locks.for_sheet(&req.sheet_id);
        let _guard = lock.lock().expect("sheet lock poisoned");

        let mut sheet = self.load_sheet(&req.sheet_id)?;

        let mut payload = Map::new();
        payload.insert("sheet_id".into(), json!(req.sheet_id));
        payload.insert("model".into(), json!(req.model_name));
        payload.insert("predictions".into(), req.predictions.clone());
        payload.insert("confidence".into(), json!(req.confidence));
        let content_hash = hashing::hash_value(&Value::Object(payload.clone()));

        if let Some(block) = self.check_stage_idempotency(&sheet, Stage::Score, &content_hash)? {
            return Ok(StageOutcome {
                sheet_id: req.sheet_id,
                block,
                content_hash,
                status: Some(sheet.status),
                idempotent_replay: true,
            });
        }
        self.ensure_downstream_open(&sheet)?;
        self.ensure_allowed(&sheet, Command::CreateScore)?;

        let mut data = payload;
        data.insert("content_hash".into(), json!(content_hash.as_str()));

        let event_data = Value::Object(data.clone());
        let block = self.append_block(BlockType::Score, data, Vec::new(), |conn, block| {
            sheet.status = SheetStatus::Scored;
            sheet.record_stage(Stage::Score, content_hash.clone(), block.index);
            SqliteStore::update_sheet(conn, &sheet)?;
            SqliteStore::insert_event(
                conn,
                &Self::event_record(
                    &sheet.sheet_id,
                    "score_created",
                    event_data.clone(),
                    content_hash.clone(),
                    block.index,
                    "system",
                ),
            )?;
            SqliteStore::upsert_pipeline_stage(
                conn,
                &sheet.sheet_id,
                SheetStatus::Scored.as_str(),
                4,
                "in_progress",
            )?;
            SqliteStore::insert_action_log(
                conn,
                "score_block_created",
                "sheet",
                &sheet.sheet_id,
                "system",
                Some(&block.hash),
            )
        })?;

        self.audit_event(
            &req.sheet_id,
            "score_block_created",
            Value::Object(block.data.clone()),
            Some(block.hash.clone()),
            "system",
        );

        Ok(StageOutcome {
            sheet_id: req.sheet_id,
            block,
            content_hash,
            status: Some(SheetStatus::Scored),
            idempotent_replay: false,
        })
    }
}

/// Store errors surface as `persistence_failed` at the lifecycle
/// boundary.
pub(crate) fn store_err(e: StoreError) -> LedgerError {
    LedgerError::PersistenceFailed {
        source: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::approve::{RecheckInput, ResolveRequest, SignerSubmission, VerifyRequest};
    use crate::lifecycle::evaluate::EvaluateRequest;
    use crate::lifecycle::keys::{KeyApproveRequest, KeyVerifyRequest, PaperRequest};
    use crate::lifecycle::quality::{QualityDecision, QualityReport, ReviewRequest};
    use crate::providers::{AiError, AiResponse, FsObjectStore};
    use crate::types::{InterventionStatus, InterventionType, KeyEntry, SignerType};
    use tempfile::TempDir;

    /// Deterministic provider for lifecycle tests.
    struct StubAi;

    impl crate::providers::AiProvider for StubAi {
        fn solve_question(&self, _q: &str, _s: &str) -> Result<AiResponse, AiError> {
            // Agrees with any key answer (empty answer means "no
            // opinion") at high confidence.
            Ok(AiResponse {
                output: json!({"answer": ""}),
                confidence: 0.95,
                flags: Vec::new(),
            })
        }
        fn verify_answer(&self, _q: &str, _p: &str, _o: &str) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({"match_status": "match"}),
                confidence: 0.95,
                flags: Vec::new(),
            })
        }
        fn evaluate_objection(&self, _q: &str, _o: &str, _a: &str) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({"verdict": "rejected"}),
                confidence: 0.9,
                flags: Vec::new(),
            })
        }
        fn detect_bubbles(&self, _i: &[u8]) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({"answers": {"1": "A", "2": "B"}}),
                confidence: 0.92,
                flags: Vec::new(),
            })
        }
        fn detect_damage(&self, _i: &[u8]) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({
                    "has_damage": false,
                    "overall_quality_score": 0.95,
                    "is_recoverable": true,
                    "total_count": 0,
                    "severe_count": 0,
                }),
                confidence: 0.95,
                flags: Vec::new(),
            })
        }
        fn reconstruct_sheet(&self, _i: &[u8]) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({"reconstruction_quality": 0.9}),
                confidence: 0.9,
                flags: Vec::new(),
            })
        }
    }

    struct Harness {
        _tmp: TempDir,
        store: Arc<SqliteStore>,
        object_store: Arc<FsObjectStore>,
        machine: LifecycleMachine,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().expect("temp dir");
        let mut config = LedgerConfig::default();
        config.chain.difficulty = 1;
        config.audit_log_dir = tmp.path().join("audit").display().to_string();
        config.object_store_root = tmp.path().join("objects").display().to_string();

        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let object_store =
            Arc::new(FsObjectStore::new(&config.object_store_root).expect("object store"));
        let machine = LifecycleMachine::bootstrap(
            config,
            store.clone(),
            object_store.clone(),
            Arc::new(StubAi),
            Arc::new(MetricsRegistry::new().expect("metrics")),
        )
        .expect("bootstrap");

        Harness {
            _tmp: tmp,
            store,
            object_store,
            machine,
        }
    }

    fn scan_request(sheet_id: &str, roll: &str) -> ScanRequest {
        let bytes = format!("image bytes of {sheet_id}");
        ScanRequest {
            sheet_id: sheet_id.to_string(),
            roll_number: roll.to_string(),
            exam_id: "EXAM_1".to_string(),
            student_name: Some("A. Student".to_string()),
            file_hash: hashing::hash_str(&bytes).as_str().to_string(),
            file_content_base64: Some(base64::encode(bytes.as_bytes())),
        }
    }

    fn good_quality() -> QualityReport {
        QualityReport {
            has_damage: false,
            damage_types: Vec::new(),
            overall_quality_score: 0.95,
            is_recoverable: true,
            total_damage_count: 0,
            severe_damage_count: 0,
            assessment_model: Some("vision-test".to_string()),
        }
    }

    fn detected_answers(n: u32) -> BTreeMap<String, String> {
        (1..=n).map(|i| (i.to_string(), "A".to_string())).collect()
    }

    fn all_signatures(machine: &LifecycleMachine) -> Vec<SignerSubmission> {
        crate::types::REQUIRED_SIGNERS
            .iter()
            .map(|s| SignerSubmission {
                signer_type: *s,
                signer_key: machine.config.signers.key_for(*s).to_string(),
            })
            .collect()
    }

    /// Drives a sheet from scan through scoring.
    fn drive_to_scored(h: &Harness, sheet_id: &str, roll: &str) {
        h.machine.create_scan(scan_request(sheet_id, roll)).expect("scan");
        h.machine
            .assess_quality(sheet_id, good_quality())
            .expect("quality");
        h.machine
            .create_bubble(BubbleRequest {
                sheet_id: sheet_id.to_string(),
                detected_answers: detected_answers(50),
                detection_confidence: BTreeMap::new(),
            })
            .expect("bubble");
        h.machine
            .create_score(ScoreRequest {
                sheet_id: sheet_id.to_string(),
                model_name: "model-a".to_string(),
                predictions: json!({"total": 68}),
                confidence: 0.95,
            })
            .expect("score");
    }

    fn verify_sheet(h: &Harness, sheet_id: &str) {
        h.machine
            .create_verify(VerifyRequest {
                sheet_id: sheet_id.to_string(),
                verification_data: json!({"total": 68.0, "grade": "B"}),
                signatures: all_signatures(&h.machine),
            })
            .expect("verify");
    }

    #[test]
    fn happy_path_result_commit() {
        let h = harness();
        drive_to_scored(&h, "SHEET_1", "ROLL_1");
        verify_sheet(&h, "SHEET_1");

        let (outcome, result) = h
            .machine
            .commit_result(ResultRequest {
                sheet_id: "SHEET_1".to_string(),
                total_questions: 50,
                correct_answers: 34,
                incorrect_answers: 10,
                unanswered: 6,
                total_marks: 68.0,
                percentage: 68.0,
                grade: "B".to_string(),
            })
            .expect("commit");

        // Genesis + scan + quality + bubble + score + verify + result.
        assert_eq!(h.machine.engine().len(), 7);
        assert_eq!(outcome.status, Some(SheetStatus::Completed));
        assert!(h.machine.engine().validate().is_valid);

        let sheet = h.machine.load_sheet("SHEET_1").expect("sheet");
        assert_eq!(sheet.status, SheetStatus::Completed);

        // Result lookup by roll, with QR payload bound to the block.
        let found = h
            .machine
            .lookup_result("ROLL_1")
            .expect("lookup")
            .expect("result published");
        assert_eq!(found.grade, "B");
        assert_eq!(found.block_hash, outcome.block.hash);
        assert!(found.qr_payload.contains("ROLL_1"));
        assert!(found.qr_payload.contains(result.result_hash.as_str()));
        assert!(!found.qr_png_base64.is_empty());

        // The verify block embeds the three approvals over the
        // verification payload.
        let verify_block = h
            .machine
            .engine()
            .find_by_type(BlockType::Verify)
            .pop()
            .expect("verify block");
        assert_eq!(verify_block.signatures.len(), 3);
        let payload_hash = hashing::hash_value(&json!({"total": 68.0, "grade": "B"}));
        for sig in &verify_block.signatures {
            assert_eq!(sig.signed_data_hash, payload_hash);
        }

        // Audit trail mirrors every stage and verifies.
        h.machine.audit().verify_integrity("SHEET_1").expect("audit ok");
        let timeline = h.machine.audit().timeline("SHEET_1").expect("timeline");
        assert_eq!(timeline.len(), 6);
    }

    #[test]
    fn missing_signature_rejects_verification() {
        let h = harness();
        drive_to_scored(&h, "SHEET_1", "ROLL_1");

        let mut sigs = all_signatures(&h.machine);
        sigs.retain(|s| s.signer_type != SignerType::AdminController);

        let before = h.machine.engine().len();
        let err = h
            .machine
            .create_verify(VerifyRequest {
                sheet_id: "SHEET_1".to_string(),
                verification_data: json!({"total": 68.0}),
                signatures: sigs,
            })
            .unwrap_err();

        match err {
            LedgerError::SignaturesIncomplete { missing } => {
                assert_eq!(missing, vec![SignerType::AdminController]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // No verify block was appended and the sheet did not move.
        assert_eq!(h.machine.engine().len(), before);
        let sheet = h.machine.load_sheet("SHEET_1").expect("sheet");
        assert_eq!(sheet.status, SheetStatus::Scored);

        // A fresh, complete attempt succeeds afterwards.
        verify_sheet(&h, "SHEET_1");
        let sheet = h.machine.load_sheet("SHEET_1").expect("sheet");
        assert_eq!(sheet.status, SheetStatus::Verified);
    }

    #[test]
    fn quality_rejection_blocks_downstream_and_files_intervention() {
        let h = harness();
        h.machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("scan");

        let outcome = h
            .machine
            .assess_quality(
                "SHEET_1",
                QualityReport {
                    has_damage: true,
                    damage_types: vec!["tear".to_string(), "stain".to_string()],
                    overall_quality_score: 0.42,
                    is_recoverable: true,
                    total_damage_count: 8,
                    severe_damage_count: 5,
                    assessment_model: None,
                },
            )
            .expect("assessment still produces a block");

        assert_eq!(outcome.status, Some(SheetStatus::QualityRejected));

        let pending = h
            .store
            .pending_interventions_for_sheet("SHEET_1")
            .expect("query");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].intervention_type, InterventionType::QualityReview);
        assert_eq!(
            pending[0].priority,
            crate::types::InterventionPriority::High
        );
        assert_eq!(pending[0].status, InterventionStatus::Pending);

        // Downstream commands fail with the quality_rejected tag.
        let err = h
            .machine
            .create_bubble(BubbleRequest {
                sheet_id: "SHEET_1".to_string(),
                detected_answers: detected_answers(10),
                detection_confidence: BTreeMap::new(),
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::QualityRejected { .. }));
    }

    #[test]
    fn human_review_reopens_a_rejected_sheet() {
        let h = harness();
        h.machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("scan");
        h.machine
            .assess_quality(
                "SHEET_1",
                QualityReport {
                    has_damage: true,
                    damage_types: vec!["tear".to_string()],
                    overall_quality_score: 0.42,
                    is_recoverable: true,
                    total_damage_count: 2,
                    severe_damage_count: 0,
                    assessment_model: None,
                },
            )
            .expect("assessment");

        let outcome = h
            .machine
            .review_quality(ReviewRequest {
                sheet_id: "SHEET_1".to_string(),
                reviewer: "qa-lead".to_string(),
                decision: QualityDecision::Approve,
                notes: Some("legible under manual inspection".to_string()),
            })
            .expect("review");
        assert_eq!(outcome.status, Some(SheetStatus::QualityAssessed));
        assert_eq!(outcome.block.block_type, BlockType::QualityHumanReview);

        // The intervention is resolved and the pipeline reopens.
        assert!(
            h.store
                .pending_interventions_for_sheet("SHEET_1")
                .expect("query")
                .is_empty()
        );
        h.machine
            .create_bubble(BubbleRequest {
                sheet_id: "SHEET_1".to_string(),
                detected_answers: detected_answers(10),
                detection_confidence: BTreeMap::new(),
            })
            .expect("bubble after approval");
    }

    #[test]
    fn reconstruction_reopens_recoverable_sheet() {
        let h = harness();
        h.machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("scan");
        // Damaged, below approval but above the intervention floor:
        // rejected with the reconstruction flag, no human required.
        h.machine
            .assess_quality(
                "SHEET_1",
                QualityReport {
                    has_damage: true,
                    damage_types: vec!["fold".to_string()],
                    overall_quality_score: 0.6,
                    is_recoverable: true,
                    total_damage_count: 2,
                    severe_damage_count: 0,
                    assessment_model: None,
                },
            )
            .expect("assessment");

        let sheet = h.machine.load_sheet("SHEET_1").expect("sheet");
        assert_eq!(sheet.status, SheetStatus::QualityRejected);

        // Stub reconstruction reports 0.9 quality: approved.
        let quality = h.machine.reconstruct("SHEET_1").expect("reconstruct");
        assert!(quality.reconstruction_performed);
        assert_eq!(quality.reconstruction_quality, Some(0.9));

        let sheet = h.machine.load_sheet("SHEET_1").expect("sheet");
        assert_eq!(sheet.status, SheetStatus::ReconstructedApproved);

        h.machine
            .create_bubble(BubbleRequest {
                sheet_id: "SHEET_1".to_string(),
                detected_answers: detected_answers(10),
                detection_confidence: BTreeMap::new(),
            })
            .expect("bubble after reconstruction");
    }

    /// Stub whose reconstruction comes back below the approval bar.
    struct PoorReconstructionAi;

    impl crate::providers::AiProvider for PoorReconstructionAi {
        fn solve_question(&self, q: &str, s: &str) -> Result<AiResponse, AiError> {
            StubAi.solve_question(q, s)
        }
        fn verify_answer(&self, q: &str, p: &str, o: &str) -> Result<AiResponse, AiError> {
            StubAi.verify_answer(q, p, o)
        }
        fn evaluate_objection(&self, q: &str, o: &str, a: &str) -> Result<AiResponse, AiError> {
            StubAi.evaluate_objection(q, o, a)
        }
        fn detect_bubbles(&self, i: &[u8]) -> Result<AiResponse, AiError> {
            StubAi.detect_bubbles(i)
        }
        fn detect_damage(&self, i: &[u8]) -> Result<AiResponse, AiError> {
            StubAi.detect_damage(i)
        }
        fn reconstruct_sheet(&self, _i: &[u8]) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({"reconstruction_quality": 0.55}),
                confidence: 0.55,
                flags: Vec::new(),
            })
        }
    }

    #[test]
    fn poor_reconstruction_keeps_sheet_unapproved() {
        let tmp = TempDir::new().expect("temp dir");
        let mut config = LedgerConfig::default();
        config.chain.difficulty = 1;
        config.audit_log_dir = tmp.path().join("audit").display().to_string();
        config.object_store_root = tmp.path().join("objects").display().to_string();

        let machine = LifecycleMachine::bootstrap(
            config.clone(),
            Arc::new(SqliteStore::open_in_memory().expect("store")),
            Arc::new(FsObjectStore::new(&config.object_store_root).expect("object store")),
            Arc::new(PoorReconstructionAi),
            Arc::new(MetricsRegistry::new().expect("metrics")),
        )
        .expect("bootstrap");

        machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("scan");
        machine
            .assess_quality(
                "SHEET_1",
                QualityReport {
                    has_damage: true,
                    damage_types: vec!["fold".to_string()],
                    overall_quality_score: 0.6,
                    is_recoverable: true,
                    total_damage_count: 2,
                    severe_damage_count: 0,
                    assessment_model: None,
                },
            )
            .expect("assessment");

        let quality = machine.reconstruct("SHEET_1").expect("reconstruct runs");
        assert!(quality.reconstruction_performed);
        assert_eq!(quality.reconstruction_quality, Some(0.55));
        assert!(!quality.approved_for_evaluation);

        // Below 0.7: the sheet stays rejected and the pipeline closed.
        let sheet = machine.load_sheet("SHEET_1").expect("sheet");
        assert_eq!(sheet.status, SheetStatus::QualityRejected);
        assert!(
            machine
                .create_bubble(BubbleRequest {
                    sheet_id: "SHEET_1".to_string(),
                    detected_answers: detected_answers(10),
                    detection_confidence: BTreeMap::new(),
                })
                .is_err()
        );
    }

    #[test]
    fn marks_discrepancy_requires_investigation() {
        let h = harness();

        // Exam setup: paper + verified + approved key (Q1/Q2, 40+40).
        h.machine
            .upload_question_paper(PaperRequest {
                paper_id: "PAPER_1".to_string(),
                exam_id: "EXAM_1".to_string(),
                subject: "Physics".to_string(),
                title: None,
                total_questions: 2,
                max_marks: 80.0,
                file_hash: hashing::hash_str("paper").as_str().to_string(),
            })
            .expect("paper");

        let answers: BTreeMap<String, KeyEntry> = [
            ("Q1", "A", 40.0),
            ("Q2", "A", 40.0),
        ]
        .into_iter()
        .map(|(q, a, m)| {
            (
                q.to_string(),
                KeyEntry {
                    answer: a.to_string(),
                    marks: m,
                },
            )
        })
        .collect();

        let (_, key) = h
            .machine
            .verify_answer_key(KeyVerifyRequest {
                key_id: "KEY_1".to_string(),
                paper_id: "PAPER_1".to_string(),
                exam_id: "EXAM_1".to_string(),
                answers,
                subject: Some("Physics".to_string()),
            })
            .expect("verify key");
        assert_eq!(key.status, crate::types::AnswerKeyStatus::Verified);

        h.machine
            .approve_answer_key(KeyApproveRequest {
                key_id: "KEY_1".to_string(),
                approver: "chief-examiner".to_string(),
                corrections: BTreeMap::new(),
            })
            .expect("approve key");

        // Sheet answers both questions correctly: automated total 80.
        drive_to_scored(&h, "SHEET_1", "ROLL_1");

        let (_, evaluation) = h
            .machine
            .evaluate(EvaluateRequest {
                sheet_id: "SHEET_1".to_string(),
                key_id: "KEY_1".to_string(),
                manual_total: Some(78.0),
            })
            .expect("evaluate");

        assert_eq!(evaluation.automated_total, 80.0);
        assert_eq!(evaluation.marks_match, Some(false));
        assert_eq!(evaluation.discrepancy, Some(2.0));
        assert!(evaluation.requires_investigation);
        assert!(!evaluation.is_perfect_evaluation);

        let pending = h
            .store
            .pending_interventions_for_sheet("SHEET_1")
            .expect("query");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].intervention_type, InterventionType::MarksMismatch);
        assert_eq!(
            pending[0].priority,
            crate::types::InterventionPriority::High
        );

        // Verification is blocked until the mismatch is resolved.
        let err = h
            .machine
            .create_verify(VerifyRequest {
                sheet_id: "SHEET_1".to_string(),
                verification_data: json!({"total": 80.0}),
                signatures: all_signatures(&h.machine),
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));

        // Resolving the intervention produces its own block and
        // reopens the pipeline.
        h.machine
            .resolve_intervention(ResolveRequest {
                intervention_id: pending[0].intervention_id.clone(),
                resolved_by: "chief-examiner".to_string(),
                resolution: "manual entry error, automated total stands".to_string(),
            })
            .expect("resolve");
        verify_sheet(&h, "SHEET_1");
    }

    #[test]
    fn perfect_evaluation_when_totals_tally() {
        let h = harness();
        h.machine
            .upload_question_paper(PaperRequest {
                paper_id: "PAPER_1".to_string(),
                exam_id: "EXAM_1".to_string(),
                subject: "Physics".to_string(),
                title: None,
                total_questions: 1,
                max_marks: 50.0,
                file_hash: hashing::hash_str("paper").as_str().to_string(),
            })
            .expect("paper");
        let answers: BTreeMap<String, KeyEntry> = [(
            "Q1".to_string(),
            KeyEntry {
                answer: "A".to_string(),
                marks: 50.0,
            },
        )]
        .into_iter()
        .collect();
        h.machine
            .verify_answer_key(KeyVerifyRequest {
                key_id: "KEY_1".to_string(),
                paper_id: "PAPER_1".to_string(),
                exam_id: "EXAM_1".to_string(),
                answers,
                subject: None,
            })
            .expect("verify key");
        h.machine
            .approve_answer_key(KeyApproveRequest {
                key_id: "KEY_1".to_string(),
                approver: "chief-examiner".to_string(),
                corrections: BTreeMap::new(),
            })
            .expect("approve key");

        drive_to_scored(&h, "SHEET_1", "ROLL_1");
        let (_, evaluation) = h
            .machine
            .evaluate(EvaluateRequest {
                sheet_id: "SHEET_1".to_string(),
                key_id: "KEY_1".to_string(),
                manual_total: Some(50.0),
            })
            .expect("evaluate");

        assert!(evaluation.is_perfect_evaluation);
        assert!(!evaluation.requires_investigation);
        assert_eq!(evaluation.marks_match, Some(true));
    }

    #[test]
    fn chain_survives_restart_from_persistence() {
        let h = harness();
        drive_to_scored(&h, "SHEET_1", "ROLL_1");
        verify_sheet(&h, "SHEET_1");
        h.machine
            .commit_result(ResultRequest {
                sheet_id: "SHEET_1".to_string(),
                total_questions: 50,
                correct_answers: 34,
                incorrect_answers: 10,
                unanswered: 6,
                total_marks: 68.0,
                percentage: 68.0,
                grade: "B".to_string(),
            })
            .expect("commit");

        let stats_before = h.machine.engine().stats();

        // Tear down the in-memory chain, rebuild from the same store.
        let rebuilt = LifecycleMachine::bootstrap(
            h.machine.config.clone(),
            h.store.clone(),
            h.object_store.clone(),
            Arc::new(StubAi),
            Arc::new(MetricsRegistry::new().expect("metrics")),
        )
        .expect("re-bootstrap from persistence");

        let stats_after = rebuilt.engine().stats();
        assert_eq!(stats_after.total_blocks, stats_before.total_blocks);
        assert_eq!(stats_after.latest_block_hash, stats_before.latest_block_hash);
        assert!(rebuilt.engine().validate().is_valid);

        let found = rebuilt
            .lookup_result("ROLL_1")
            .expect("lookup")
            .expect("result survives restart");
        assert_eq!(found.grade, "B");
    }

    #[test]
    fn duplicate_scan_is_idempotent() {
        let h = harness();
        let first = h
            .machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("first scan");
        let second = h
            .machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("identical repeat");

        assert!(!first.idempotent_replay);
        assert!(second.idempotent_replay);
        assert_eq!(first.block.hash, second.block.hash);
        assert_eq!(h.machine.engine().len(), 2);

        // A divergent payload for the same sheet conflicts.
        let mut divergent = scan_request("SHEET_1", "ROLL_1");
        divergent.roll_number = "ROLL_2".to_string();
        divergent.file_content_base64 = None;
        let err = h.machine.create_scan(divergent).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists { .. }));
    }

    #[test]
    fn lifecycle_commands_are_idempotent_per_stage() {
        let h = harness();
        drive_to_scored(&h, "SHEET_1", "ROLL_1");

        let before = h.machine.engine().len();
        let replay = h
            .machine
            .create_score(ScoreRequest {
                sheet_id: "SHEET_1".to_string(),
                model_name: "model-a".to_string(),
                predictions: json!({"total": 68}),
                confidence: 0.95,
            })
            .expect("identical repeat");
        assert!(replay.idempotent_replay);
        assert_eq!(h.machine.engine().len(), before);

        let err = h
            .machine
            .create_score(ScoreRequest {
                sheet_id: "SHEET_1".to_string(),
                model_name: "model-b".to_string(),
                predictions: json!({"total": 61}),
                confidence: 0.8,
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists { .. }));
    }

    #[test]
    fn scan_rejects_hash_mismatch() {
        let h = harness();
        let mut req = scan_request("SHEET_1", "ROLL_1");
        req.file_hash = hashing::hash_str("different bytes").as_str().to_string();
        let err = h.machine.create_scan(req).unwrap_err();
        assert!(matches!(err, LedgerError::HashMismatch { .. }));
        assert!(h.machine.store().get_sheet("SHEET_1").expect("query").is_none());
    }

    #[test]
    fn out_of_order_command_reports_invalid_state() {
        let h = harness();
        h.machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("scan");

        let err = h
            .machine
            .create_score(ScoreRequest {
                sheet_id: "SHEET_1".to_string(),
                model_name: "model-a".to_string(),
                predictions: json!({}),
                confidence: 0.9,
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
        assert_eq!(err.tag(), "invalid_state");
    }

    #[test]
    fn ai_driven_quality_and_bubble_detection() {
        let h = harness();
        h.machine
            .create_scan(scan_request("SHEET_1", "ROLL_1"))
            .expect("scan");

        let outcome = h
            .machine
            .assess_quality_with_ai("SHEET_1")
            .expect("ai assessment");
        assert_eq!(outcome.status, Some(SheetStatus::QualityAssessed));

        let bubble = h
            .machine
            .detect_bubbles_with_ai("SHEET_1")
            .expect("ai bubbles");
        assert_eq!(bubble.status, Some(SheetStatus::BubbleDetected));
        assert_eq!(
            bubble.block.data["detected_answers"]["1"],
            json!("A")
        );
    }

    #[test]
    fn recheck_layers_on_completed_sheet() {
        let h = harness();
        drive_to_scored(&h, "SHEET_1", "ROLL_1");
        verify_sheet(&h, "SHEET_1");
        h.machine
            .commit_result(ResultRequest {
                sheet_id: "SHEET_1".to_string(),
                total_questions: 50,
                correct_answers: 34,
                incorrect_answers: 10,
                unanswered: 6,
                total_marks: 68.0,
                percentage: 68.0,
                grade: "B".to_string(),
            })
            .expect("commit");

        let (outcome, recheck) = h
            .machine
            .request_recheck(RecheckInput {
                sheet_id: "SHEET_1".to_string(),
                requested_by: "ROLL_1".to_string(),
                reason: "question 7 disputed".to_string(),
                questions: vec![7],
            })
            .expect("recheck");

        assert_eq!(outcome.block.block_type, BlockType::Recheck);
        // The sheet stays completed; the recheck is layered on top.
        assert_eq!(outcome.status, Some(SheetStatus::Completed));
        assert_eq!(recheck.status, crate::types::RecheckStatus::Pending);
        assert_eq!(recheck.recheck_block, Some(outcome.block.index));

        // Identical repeat replays the same block.
        let (again, _) = h
            .machine
            .request_recheck(RecheckInput {
                sheet_id: "SHEET_1".to_string(),
                requested_by: "ROLL_1".to_string(),
                reason: "question 7 disputed".to_string(),
                questions: vec![7],
            })
            .expect("repeat recheck");
        assert!(again.idempotent_replay);
        assert_eq!(again.block.hash, outcome.block.hash);
    }

    #[test]
    fn per_sheet_events_stay_ordered_under_interleaving() {
        use std::thread;

        let h = Arc::new(harness());
        let mut handles = Vec::new();

        for t in 0..3 {
            let h = h.clone();
            handles.push(thread::spawn(move || {
                let sheet_id = format!("SHEET_{t}");
                let roll = format!("ROLL_{t}");
                drive_to_scored(&h, &sheet_id, &roll);
                verify_sheet(&h, &sheet_id);
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        // Genesis + 3 sheets x 5 blocks.
        assert_eq!(h.machine.engine().len(), 16);
        assert!(h.machine.engine().validate().is_valid);

        // Each sheet's relational events follow the pipeline order
        // regardless of cross-sheet interleaving.
        let expected = [
            "scan_created",
            "quality_assessed",
            "bubble_detected",
            "score_created",
            "verification",
        ];
        for t in 0..3 {
            let events = h
                .store
                .events_for_sheet(&format!("SHEET_{t}"))
                .expect("events");
            let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
            assert_eq!(kinds, expected);
        }
    }
}
