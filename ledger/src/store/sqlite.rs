//! SQLite-backed relational store.
//!
//! One embedded database holds everything the chain relates to:
//! blocks, sheets, events, signatures, results and their cache,
//! recheck requests, question papers, answer keys, quality
//! assessments, evaluation results, human interventions, pipeline
//! stages, and the relational action log. Constraints mirror the
//! domain invariants: unique `block_index`, `block_hash`, and
//! `sheet_id`; at most one approved signature per `(sheet_id,
//! signer_type)`; foreign keys from dependent rows to sheets and
//! blocks.
//!
//! The connection sits behind a mutex: the ledger is single-writer by
//! design and rusqlite connections are not `Sync`. Lifecycle commands
//! use [`SqliteStore::with_tx`] so a block and its relational rows
//! commit or roll back together.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::StoreError;
use crate::chain::BlockSink;
use crate::types::{
    AnswerKey, AnswerKeyStatus, Block, BlockType, DamageSeverity, Evaluation, FinalResult,
    HexHash, HumanIntervention, InterventionPriority, InterventionStatus, InterventionType,
    KeyEntry, QualityAssessment, QuestionPaper, QuestionResult, RecheckRequest, RecheckStatus,
    Sheet, SheetStatus, SignatureRecord, SignatureStatus, SignerType, utc_now_iso,
};

/// Relational row of the `events` table.
#[derive(Clone, Debug, serde::Serialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub sheet_id: String,
    pub block_index: Option<u64>,
    pub event_data: Value,
    pub event_hash: HexHash,
    pub triggered_by: String,
    pub timestamp: String,
}

/// Embedded SQLite store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    block_index   INTEGER PRIMARY KEY,
    timestamp     TEXT NOT NULL,
    block_type    TEXT NOT NULL,
    data          TEXT NOT NULL,
    previous_hash TEXT NOT NULL,
    nonce         INTEGER NOT NULL,
    block_hash    TEXT NOT NULL UNIQUE,
    merkle_root   TEXT NOT NULL,
    signatures    TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_blocks_type ON blocks (block_type);

CREATE TABLE IF NOT EXISTS sheets (
    sheet_id           TEXT PRIMARY KEY,
    roll_number        TEXT NOT NULL,
    exam_id            TEXT NOT NULL,
    student_name       TEXT,
    original_file_hash TEXT NOT NULL,
    object_store_url   TEXT,
    status             TEXT NOT NULL,
    scan_hash          TEXT,
    bubble_hash        TEXT,
    score_hash         TEXT,
    verify_hash        TEXT,
    result_hash        TEXT,
    scan_block         INTEGER REFERENCES blocks (block_index),
    bubble_block       INTEGER REFERENCES blocks (block_index),
    score_block        INTEGER REFERENCES blocks (block_index),
    verify_block       INTEGER REFERENCES blocks (block_index),
    result_block       INTEGER REFERENCES blocks (block_index),
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sheets_roll ON sheets (roll_number);
CREATE INDEX IF NOT EXISTS idx_sheets_exam ON sheets (exam_id);

CREATE TABLE IF NOT EXISTS events (
    event_id     TEXT PRIMARY KEY,
    event_type   TEXT NOT NULL,
    sheet_id     TEXT NOT NULL REFERENCES sheets (sheet_id),
    block_index  INTEGER REFERENCES blocks (block_index),
    event_data   TEXT NOT NULL,
    event_hash   TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    timestamp    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_sheet ON events (sheet_id);

CREATE TABLE IF NOT EXISTS signatures (
    signature_id     TEXT PRIMARY KEY,
    sheet_id         TEXT NOT NULL REFERENCES sheets (sheet_id),
    signer_type      TEXT NOT NULL,
    signer_key       TEXT NOT NULL,
    signature_hash   TEXT NOT NULL,
    signed_data_hash TEXT NOT NULL,
    status           TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    signed_at        TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_signatures_unique_approved
    ON signatures (sheet_id, signer_type) WHERE status = 'approved';

CREATE TABLE IF NOT EXISTS results (
    result_id         TEXT PRIMARY KEY,
    sheet_id          TEXT NOT NULL UNIQUE REFERENCES sheets (sheet_id),
    roll_number       TEXT NOT NULL,
    total_questions   INTEGER NOT NULL,
    correct_answers   INTEGER NOT NULL,
    incorrect_answers INTEGER NOT NULL,
    unanswered        INTEGER NOT NULL,
    total_marks       REAL NOT NULL,
    percentage        REAL NOT NULL,
    grade             TEXT NOT NULL,
    result_hash       TEXT NOT NULL,
    block_hash        TEXT NOT NULL,
    qr_payload        TEXT NOT NULL,
    qr_png_base64     TEXT NOT NULL,
    zkp_commitment    TEXT,
    published_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_roll ON results (roll_number);

CREATE TABLE IF NOT EXISTS result_cache (
    roll_number     TEXT PRIMARY KEY,
    result_data     TEXT NOT NULL,
    blockchain_hash TEXT NOT NULL,
    cached_at       TEXT NOT NULL,
    is_valid        INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS recheck_requests (
    request_id    TEXT PRIMARY KEY,
    sheet_id      TEXT NOT NULL REFERENCES sheets (sheet_id),
    requested_by  TEXT NOT NULL,
    reason        TEXT NOT NULL,
    questions     TEXT NOT NULL,
    status        TEXT NOT NULL,
    recheck_hash  TEXT,
    recheck_block INTEGER REFERENCES blocks (block_index),
    requested_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recheck_sheet ON recheck_requests (sheet_id);

CREATE TABLE IF NOT EXISTS question_papers (
    paper_id        TEXT PRIMARY KEY,
    exam_id         TEXT NOT NULL,
    subject         TEXT NOT NULL,
    title           TEXT,
    total_questions INTEGER NOT NULL,
    max_marks       REAL NOT NULL,
    file_hash       TEXT NOT NULL,
    uploaded_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS answer_keys (
    key_id            TEXT PRIMARY KEY,
    paper_id          TEXT NOT NULL REFERENCES question_papers (paper_id),
    exam_id           TEXT NOT NULL,
    answers           TEXT NOT NULL,
    status            TEXT NOT NULL,
    key_hash          TEXT NOT NULL,
    ai_confidence     REAL,
    flagged_questions TEXT NOT NULL DEFAULT '[]',
    created_at        TEXT NOT NULL,
    verified_at       TEXT
);

CREATE TABLE IF NOT EXISTS quality_assessments (
    assessment_id               TEXT PRIMARY KEY,
    sheet_id                    TEXT NOT NULL UNIQUE REFERENCES sheets (sheet_id),
    has_damage                  INTEGER NOT NULL,
    damage_types                TEXT NOT NULL DEFAULT '[]',
    damage_severity             TEXT,
    overall_quality_score       REAL NOT NULL,
    is_recoverable              INTEGER NOT NULL,
    requires_reconstruction     INTEGER NOT NULL,
    reconstruction_performed    INTEGER NOT NULL DEFAULT 0,
    reconstruction_quality      REAL,
    approved_for_evaluation     INTEGER NOT NULL,
    flagged_for_review          INTEGER NOT NULL,
    flag_reason                 TEXT,
    requires_human_intervention INTEGER NOT NULL,
    total_damage_count          INTEGER NOT NULL,
    severe_damage_count         INTEGER NOT NULL,
    assessment_model            TEXT,
    assessed_at                 TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluation_results (
    evaluation_id          TEXT PRIMARY KEY,
    sheet_id               TEXT NOT NULL UNIQUE REFERENCES sheets (sheet_id),
    key_id                 TEXT NOT NULL REFERENCES answer_keys (key_id),
    roll_number            TEXT NOT NULL,
    exam_id                TEXT NOT NULL,
    detected_answers       TEXT NOT NULL,
    automated_total        REAL NOT NULL,
    automated_correct      INTEGER NOT NULL,
    automated_incorrect    INTEGER NOT NULL,
    automated_unanswered   INTEGER NOT NULL,
    automated_percentage   REAL NOT NULL,
    automated_grade        TEXT NOT NULL,
    total_questions        INTEGER NOT NULL,
    max_marks              REAL NOT NULL,
    manual_total           REAL,
    marks_match            INTEGER,
    discrepancy            REAL,
    requires_investigation INTEGER NOT NULL,
    is_perfect_evaluation  INTEGER NOT NULL,
    question_results       TEXT NOT NULL,
    evaluated_at           TEXT NOT NULL
);

-- sheet_id is not a foreign key: interventions can also reference
-- exam-level entities (flagged answer keys) that have no sheet row.
CREATE TABLE IF NOT EXISTS human_interventions (
    intervention_id   TEXT PRIMARY KEY,
    sheet_id          TEXT NOT NULL,
    intervention_type TEXT NOT NULL,
    pipeline_stage    TEXT NOT NULL,
    reason            TEXT NOT NULL,
    priority          TEXT NOT NULL,
    status            TEXT NOT NULL,
    resolution        TEXT,
    resolved_by       TEXT,
    created_at        TEXT NOT NULL,
    resolved_at       TEXT
);
CREATE INDEX IF NOT EXISTS idx_interventions_sheet ON human_interventions (sheet_id);

CREATE TABLE IF NOT EXISTS pipeline_stages (
    sheet_id         TEXT PRIMARY KEY REFERENCES sheets (sheet_id),
    current_stage    TEXT NOT NULL,
    completed_stages INTEGER NOT NULL,
    total_stages     INTEGER NOT NULL DEFAULT 7,
    overall_status   TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    last_updated     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
    log_id          TEXT PRIMARY KEY,
    action          TEXT NOT NULL,
    entity_type     TEXT,
    entity_id       TEXT,
    actor           TEXT NOT NULL,
    blockchain_hash TEXT,
    timestamp       TEXT NOT NULL
);
"#;

fn parse_hash(s: String, what: &str) -> Result<HexHash, StoreError> {
    HexHash::parse(&s).ok_or_else(|| StoreError::Corrupted(format!("{what}: bad hash '{s}'")))
}

fn parse_opt_hash(s: Option<String>, what: &str) -> Result<Option<HexHash>, StoreError> {
    s.map(|h| parse_hash(h, what)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(s: String, what: &str) -> Result<T, StoreError> {
    s.parse()
        .map_err(|e| StoreError::Corrupted(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: String, what: &str) -> Result<T, StoreError> {
    serde_json::from_str(&s).map_err(|e| StoreError::Corrupted(format!("{what}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("domain types serialize to JSON")
}

impl SqliteStore {
    /// Opens (or creates) the store at the given path and applies the
    /// schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupted(format!("create db directory: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens a fresh in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Runs `f` inside one transaction; commits on `Ok`, rolls back on
    /// `Err`. Lifecycle commands use this so the block insert and its
    /// relational rows land atomically.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Inserts a block row. Usable inside [`SqliteStore::with_tx`].
    pub fn insert_block(conn: &Connection, block: &Block) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO blocks (block_index, timestamp, block_type, data, previous_hash,
                                 nonce, block_hash, merkle_root, signatures)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                block.index,
                block.timestamp,
                block.block_type.as_str(),
                to_json(&block.data),
                block.previous_hash.as_str(),
                block.nonce,
                block.hash.as_str(),
                block.merkle_root.as_str(),
                to_json(&block.signatures),
            ],
        )?;
        Ok(())
    }

    /// Loads the whole chain ordered by index, for replay at startup.
    pub fn load_blocks(&self) -> Result<Vec<Block>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT block_index, timestamp, block_type, data, previous_hash,
                    nonce, block_hash, merkle_root, signatures
             FROM blocks ORDER BY block_index",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            let (index, timestamp, block_type, data, previous_hash, nonce, hash, merkle, sigs) =
                row?;
            blocks.push(Block {
                index,
                timestamp,
                block_type: parse_enum(block_type, "blocks.block_type")?,
                data: from_json(data, "blocks.data")?,
                previous_hash: parse_hash(previous_hash, "blocks.previous_hash")?,
                nonce,
                hash: parse_hash(hash, "blocks.block_hash")?,
                merkle_root: parse_hash(merkle, "blocks.merkle_root")?,
                signatures: from_json(sigs, "blocks.signatures")?,
            });
        }
        Ok(blocks)
    }

    /// Number of persisted blocks.
    pub fn block_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM blocks", [], |r| r.get(0))?)
    }

    // ------------------------------------------------------------------
    // Sheets
    // ------------------------------------------------------------------

    pub fn insert_sheet(conn: &Connection, sheet: &Sheet) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO sheets (sheet_id, roll_number, exam_id, student_name,
                                 original_file_hash, object_store_url, status,
                                 scan_hash, bubble_hash, score_hash, verify_hash, result_hash,
                                 scan_block, bubble_block, score_block, verify_block, result_block,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                     ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                sheet.sheet_id,
                sheet.roll_number,
                sheet.exam_id,
                sheet.student_name,
                sheet.original_file_hash.as_str(),
                sheet.object_store_url,
                sheet.status.as_str(),
                sheet.scan_hash.as_ref().map(HexHash::as_str),
                sheet.bubble_hash.as_ref().map(HexHash::as_str),
                sheet.score_hash.as_ref().map(HexHash::as_str),
                sheet.verify_hash.as_ref().map(HexHash::as_str),
                sheet.result_hash.as_ref().map(HexHash::as_str),
                sheet.scan_block,
                sheet.bubble_block,
                sheet.score_block,
                sheet.verify_block,
                sheet.result_block,
                sheet.created_at,
                sheet.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_sheet(conn: &Connection, sheet: &Sheet) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE sheets SET status = ?2, object_store_url = ?3,
                    scan_hash = ?4, bubble_hash = ?5, score_hash = ?6,
                    verify_hash = ?7, result_hash = ?8,
                    scan_block = ?9, bubble_block = ?10, score_block = ?11,
                    verify_block = ?12, result_block = ?13, updated_at = ?14
             WHERE sheet_id = ?1",
            params![
                sheet.sheet_id,
                sheet.status.as_str(),
                sheet.object_store_url,
                sheet.scan_hash.as_ref().map(HexHash::as_str),
                sheet.bubble_hash.as_ref().map(HexHash::as_str),
                sheet.score_hash.as_ref().map(HexHash::as_str),
                sheet.verify_hash.as_ref().map(HexHash::as_str),
                sheet.result_hash.as_ref().map(HexHash::as_str),
                sheet.scan_block,
                sheet.bubble_block,
                sheet.score_block,
                sheet.verify_block,
                sheet.result_block,
                utc_now_iso(),
            ],
        )?;
        Ok(())
    }

    fn row_to_sheet(row: &rusqlite::Row<'_>) -> Result<Sheet, rusqlite::Error> {
        Ok(Sheet {
            sheet_id: row.get(0)?,
            roll_number: row.get(1)?,
            exam_id: row.get(2)?,
            student_name: row.get(3)?,
            // Hash/status parsing happens after the rusqlite layer; the
            // raw strings are stashed in a temporary sheet below.
            original_file_hash: HexHash::zero(),
            object_store_url: row.get(5)?,
            status: SheetStatus::Uploaded,
            scan_hash: None,
            bubble_hash: None,
            score_hash: None,
            verify_hash: None,
            result_hash: None,
            scan_block: row.get(12)?,
            bubble_block: row.get(13)?,
            score_block: row.get(14)?,
            verify_block: row.get(15)?,
            result_block: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn query_sheet(
        conn: &Connection,
        where_clause: &str,
        param: &str,
    ) -> Result<Option<Sheet>, StoreError> {
        let sql = format!(
            "SELECT sheet_id, roll_number, exam_id, student_name, original_file_hash,
                    object_store_url, status, scan_hash, bubble_hash, score_hash,
                    verify_hash, result_hash, scan_block, bubble_block, score_block,
                    verify_block, result_block, created_at, updated_at
             FROM sheets WHERE {where_clause}"
        );

        let raw = conn
            .query_row(&sql, params![param], |row| {
                let sheet = Self::row_to_sheet(row)?;
                let file_hash: String = row.get(4)?;
                let status: String = row.get(6)?;
                let hashes: [Option<String>; 5] = [
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ];
                Ok((sheet, file_hash, status, hashes))
            })
            .optional()?;

        let Some((mut sheet, file_hash, status, hashes)) = raw else {
            return Ok(None);
        };

        sheet.original_file_hash = parse_hash(file_hash, "sheets.original_file_hash")?;
        sheet.status = parse_enum(status, "sheets.status")?;
        let [scan, bubble, score, verify, result] = hashes;
        sheet.scan_hash = parse_opt_hash(scan, "sheets.scan_hash")?;
        sheet.bubble_hash = parse_opt_hash(bubble, "sheets.bubble_hash")?;
        sheet.score_hash = parse_opt_hash(score, "sheets.score_hash")?;
        sheet.verify_hash = parse_opt_hash(verify, "sheets.verify_hash")?;
        sheet.result_hash = parse_opt_hash(result, "sheets.result_hash")?;
        Ok(Some(sheet))
    }

    pub fn get_sheet(&self, sheet_id: &str) -> Result<Option<Sheet>, StoreError> {
        Self::query_sheet(&self.lock(), "sheet_id = ?1", sheet_id)
    }

    /// Sheet lookup inside a transaction.
    pub fn get_sheet_tx(conn: &Connection, sheet_id: &str) -> Result<Option<Sheet>, StoreError> {
        Self::query_sheet(conn, "sheet_id = ?1", sheet_id)
    }

    /// Most recently created sheet for a roll number.
    pub fn get_sheet_by_roll(&self, roll_number: &str) -> Result<Option<Sheet>, StoreError> {
        Self::query_sheet(
            &self.lock(),
            "roll_number = ?1 ORDER BY created_at DESC LIMIT 1",
            roll_number,
        )
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn insert_event(conn: &Connection, event: &EventRecord) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO events (event_id, event_type, sheet_id, block_index,
                                 event_data, event_hash, triggered_by, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id,
                event.event_type,
                event.sheet_id,
                event.block_index,
                to_json(&event.event_data),
                event.event_hash.as_str(),
                event.triggered_by,
                event.timestamp,
            ],
        )?;
        Ok(())
    }

    /// Events for a sheet, in timestamp order.
    pub fn events_for_sheet(&self, sheet_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, event_type, sheet_id, block_index, event_data,
                    event_hash, triggered_by, timestamp
             FROM events WHERE sheet_id = ?1 ORDER BY timestamp",
        )?;

        let rows = stmt.query_map(params![sheet_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<u64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (event_id, event_type, sheet_id, block_index, data, hash, by, ts) = row?;
            events.push(EventRecord {
                event_id,
                event_type,
                sheet_id,
                block_index,
                event_data: from_json(data, "events.event_data")?,
                event_hash: parse_hash(hash, "events.event_hash")?,
                triggered_by: by,
                timestamp: ts,
            });
        }
        Ok(events)
    }

    // ------------------------------------------------------------------
    // Signatures
    // ------------------------------------------------------------------

    pub fn insert_signature(
        conn: &Connection,
        sheet_id: &str,
        sig: &SignatureRecord,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO signatures (signature_id, sheet_id, signer_type, signer_key,
                                     signature_hash, signed_data_hash, status,
                                     created_at, signed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                sig.signature_id,
                sheet_id,
                sig.signer_type.as_str(),
                sig.signer_key,
                sig.signature_hash.as_str(),
                sig.signed_data_hash.as_str(),
                sig.status.as_str(),
                sig.created_at,
                sig.signed_at,
            ],
        )?;
        Ok(())
    }

    pub fn signatures_for_sheet(
        &self,
        sheet_id: &str,
    ) -> Result<Vec<SignatureRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT signature_id, signer_type, signer_key, signature_hash,
                    signed_data_hash, status, created_at, signed_at
             FROM signatures WHERE sheet_id = ?1 ORDER BY created_at",
        )?;

        let rows = stmt.query_map(params![sheet_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut sigs = Vec::new();
        for row in rows {
            let (id, signer_type, key, sig_hash, data_hash, status, created_at, signed_at) = row?;
            sigs.push(SignatureRecord {
                signature_id: id,
                signer_type: parse_enum::<SignerType>(signer_type, "signatures.signer_type")?,
                signer_key: key,
                signature_hash: parse_hash(sig_hash, "signatures.signature_hash")?,
                signed_data_hash: parse_hash(data_hash, "signatures.signed_data_hash")?,
                status: parse_enum::<SignatureStatus>(status, "signatures.status")?,
                created_at,
                signed_at,
            });
        }
        Ok(sigs)
    }

    // ------------------------------------------------------------------
    // Results + cache
    // ------------------------------------------------------------------

    pub fn insert_result(conn: &Connection, result: &FinalResult) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO results (result_id, sheet_id, roll_number, total_questions,
                                  correct_answers, incorrect_answers, unanswered,
                                  total_marks, percentage, grade, result_hash, block_hash,
                                  qr_payload, qr_png_base64, zkp_commitment, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                result.result_id,
                result.sheet_id,
                result.roll_number,
                result.total_questions,
                result.correct_answers,
                result.incorrect_answers,
                result.unanswered,
                result.total_marks,
                result.percentage,
                result.grade,
                result.result_hash.as_str(),
                result.block_hash.as_str(),
                result.qr_payload,
                result.qr_png_base64,
                result.zkp_commitment,
                result.published_at,
            ],
        )?;

        // Refresh the quick-lookup cache in the same transaction.
        conn.execute(
            "INSERT INTO result_cache (roll_number, result_data, blockchain_hash, cached_at, is_valid)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT (roll_number) DO UPDATE SET
                 result_data = excluded.result_data,
                 blockchain_hash = excluded.blockchain_hash,
                 cached_at = excluded.cached_at,
                 is_valid = 1",
            params![
                result.roll_number,
                to_json(result),
                result.block_hash.as_str(),
                utc_now_iso(),
            ],
        )?;
        Ok(())
    }

    pub fn get_result_by_roll(&self, roll_number: &str) -> Result<Option<FinalResult>, StoreError> {
        let conn = self.lock();
        let cached: Option<String> = conn
            .query_row(
                "SELECT result_data FROM result_cache WHERE roll_number = ?1 AND is_valid = 1",
                params![roll_number],
                |row| row.get(0),
            )
            .optional()?;

        match cached {
            Some(data) => Ok(Some(from_json(data, "result_cache.result_data")?)),
            None => {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT result_id FROM results WHERE roll_number = ?1
                         ORDER BY published_at DESC LIMIT 1",
                        params![roll_number],
                        |row| row.get(0),
                    )
                    .optional()?;
                match raw {
                    Some(result_id) => Self::get_result_by_id(&conn, &result_id),
                    None => Ok(None),
                }
            }
        }
    }

    fn get_result_by_id(
        conn: &Connection,
        result_id: &str,
    ) -> Result<Option<FinalResult>, StoreError> {
        let row = conn
            .query_row(
                "SELECT result_id, sheet_id, roll_number, total_questions, correct_answers,
                        incorrect_answers, unanswered, total_marks, percentage, grade,
                        result_hash, block_hash, qr_payload, qr_png_base64, zkp_commitment,
                        published_at
                 FROM results WHERE result_id = ?1",
                params![result_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, String>(11)?,
                        row.get::<_, String>(12)?,
                        row.get::<_, String>(13)?,
                        row.get::<_, Option<String>>(14)?,
                        row.get::<_, String>(15)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            result_id,
            sheet_id,
            roll_number,
            total_questions,
            correct_answers,
            incorrect_answers,
            unanswered,
            total_marks,
            percentage,
            grade,
            result_hash,
            block_hash,
            qr_payload,
            qr_png_base64,
            zkp_commitment,
            published_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(FinalResult {
            result_id,
            sheet_id,
            roll_number,
            total_questions,
            correct_answers,
            incorrect_answers,
            unanswered,
            total_marks,
            percentage,
            grade,
            result_hash: parse_hash(result_hash, "results.result_hash")?,
            block_hash: parse_hash(block_hash, "results.block_hash")?,
            qr_payload,
            qr_png_base64,
            zkp_commitment,
            published_at,
        }))
    }

    pub fn result_exists(conn: &Connection, sheet_id: &str) -> Result<bool, StoreError> {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM results WHERE sheet_id = ?1",
            params![sheet_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Recheck requests
    // ------------------------------------------------------------------

    pub fn insert_recheck(conn: &Connection, recheck: &RecheckRequest) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO recheck_requests (request_id, sheet_id, requested_by, reason,
                                           questions, status, recheck_hash, recheck_block,
                                           requested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                recheck.request_id,
                recheck.sheet_id,
                recheck.requested_by,
                recheck.reason,
                to_json(&recheck.questions),
                recheck.status.as_str(),
                recheck.recheck_hash.as_ref().map(HexHash::as_str),
                recheck.recheck_block,
                recheck.requested_at,
            ],
        )?;
        Ok(())
    }

    pub fn rechecks_for_sheet(&self, sheet_id: &str) -> Result<Vec<RecheckRequest>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT request_id, sheet_id, requested_by, reason, questions, status,
                    recheck_hash, recheck_block, requested_at
             FROM recheck_requests WHERE sheet_id = ?1 ORDER BY requested_at",
        )?;

        let rows = stmt.query_map(params![sheet_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<u64>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut rechecks = Vec::new();
        for row in rows {
            let (id, sheet_id, by, reason, questions, status, hash, block, at) = row?;
            rechecks.push(RecheckRequest {
                request_id: id,
                sheet_id,
                requested_by: by,
                reason,
                questions: from_json(questions, "recheck_requests.questions")?,
                status: parse_enum::<RecheckStatus>(status, "recheck_requests.status")?,
                recheck_hash: parse_opt_hash(hash, "recheck_requests.recheck_hash")?,
                recheck_block: block,
                requested_at: at,
            });
        }
        Ok(rechecks)
    }

    // ------------------------------------------------------------------
    // Question papers and answer keys
    // ------------------------------------------------------------------

    pub fn insert_question_paper(
        conn: &Connection,
        paper: &QuestionPaper,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO question_papers (paper_id, exam_id, subject, title,
                                          total_questions, max_marks, file_hash, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                paper.paper_id,
                paper.exam_id,
                paper.subject,
                paper.title,
                paper.total_questions,
                paper.max_marks,
                paper.file_hash.as_str(),
                paper.uploaded_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_question_paper(&self, paper_id: &str) -> Result<Option<QuestionPaper>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT paper_id, exam_id, subject, title, total_questions, max_marks,
                        file_hash, uploaded_at
                 FROM question_papers WHERE paper_id = ?1",
                params![paper_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((paper_id, exam_id, subject, title, total_questions, max_marks, hash, at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(QuestionPaper {
            paper_id,
            exam_id,
            subject,
            title,
            total_questions,
            max_marks,
            file_hash: parse_hash(hash, "question_papers.file_hash")?,
            uploaded_at: at,
        }))
    }

    pub fn insert_answer_key(conn: &Connection, key: &AnswerKey) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO answer_keys (key_id, paper_id, exam_id, answers, status, key_hash,
                                      ai_confidence, flagged_questions, created_at, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                key.key_id,
                key.paper_id,
                key.exam_id,
                to_json(&key.answers),
                key.status.as_str(),
                key.key_hash.as_str(),
                key.ai_confidence,
                to_json(&key.flagged_questions),
                key.created_at,
                key.verified_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_answer_key(conn: &Connection, key: &AnswerKey) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE answer_keys SET answers = ?2, status = ?3, key_hash = ?4,
                    ai_confidence = ?5, flagged_questions = ?6, verified_at = ?7
             WHERE key_id = ?1",
            params![
                key.key_id,
                to_json(&key.answers),
                key.status.as_str(),
                key.key_hash.as_str(),
                key.ai_confidence,
                to_json(&key.flagged_questions),
                key.verified_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_answer_key(&self, key_id: &str) -> Result<Option<AnswerKey>, StoreError> {
        Self::get_answer_key_tx(&self.lock(), key_id)
    }

    pub fn get_answer_key_tx(
        conn: &Connection,
        key_id: &str,
    ) -> Result<Option<AnswerKey>, StoreError> {
        let row = conn
            .query_row(
                "SELECT key_id, paper_id, exam_id, answers, status, key_hash,
                        ai_confidence, flagged_questions, created_at, verified_at
                 FROM answer_keys WHERE key_id = ?1",
                params![key_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            key_id,
            paper_id,
            exam_id,
            answers,
            status,
            key_hash,
            ai_confidence,
            flagged,
            created_at,
            verified_at,
        )) = row
        else {
            return Ok(None);
        };

        let answers: BTreeMap<String, KeyEntry> = from_json(answers, "answer_keys.answers")?;
        Ok(Some(AnswerKey {
            key_id,
            paper_id,
            exam_id,
            answers,
            status: parse_enum::<AnswerKeyStatus>(status, "answer_keys.status")?,
            key_hash: parse_hash(key_hash, "answer_keys.key_hash")?,
            ai_confidence,
            flagged_questions: from_json(flagged, "answer_keys.flagged_questions")?,
            created_at,
            verified_at,
        }))
    }

    // ------------------------------------------------------------------
    // Quality assessments
    // ------------------------------------------------------------------

    pub fn insert_quality(
        conn: &Connection,
        quality: &QualityAssessment,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO quality_assessments (assessment_id, sheet_id, has_damage, damage_types,
                     damage_severity, overall_quality_score, is_recoverable,
                     requires_reconstruction, reconstruction_performed, reconstruction_quality,
                     approved_for_evaluation, flagged_for_review, flag_reason,
                     requires_human_intervention, total_damage_count, severe_damage_count,
                     assessment_model, assessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                quality.assessment_id,
                quality.sheet_id,
                quality.has_damage,
                to_json(&quality.damage_types),
                quality.damage_severity.map(|s| s.as_str()),
                quality.overall_quality_score,
                quality.is_recoverable,
                quality.requires_reconstruction,
                quality.reconstruction_performed,
                quality.reconstruction_quality,
                quality.approved_for_evaluation,
                quality.flagged_for_review,
                quality.flag_reason,
                quality.requires_human_intervention,
                quality.total_damage_count,
                quality.severe_damage_count,
                quality.assessment_model,
                quality.assessed_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_quality(
        conn: &Connection,
        quality: &QualityAssessment,
    ) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE quality_assessments SET
                    reconstruction_performed = ?2, reconstruction_quality = ?3,
                    approved_for_evaluation = ?4, flagged_for_review = ?5,
                    flag_reason = ?6, requires_human_intervention = ?7
             WHERE sheet_id = ?1",
            params![
                quality.sheet_id,
                quality.reconstruction_performed,
                quality.reconstruction_quality,
                quality.approved_for_evaluation,
                quality.flagged_for_review,
                quality.flag_reason,
                quality.requires_human_intervention,
            ],
        )?;
        Ok(())
    }

    pub fn get_quality(&self, sheet_id: &str) -> Result<Option<QualityAssessment>, StoreError> {
        Self::get_quality_tx(&self.lock(), sheet_id)
    }

    pub fn get_quality_tx(
        conn: &Connection,
        sheet_id: &str,
    ) -> Result<Option<QualityAssessment>, StoreError> {
        let row = conn
            .query_row(
                "SELECT assessment_id, sheet_id, has_damage, damage_types, damage_severity,
                        overall_quality_score, is_recoverable, requires_reconstruction,
                        reconstruction_performed, reconstruction_quality,
                        approved_for_evaluation, flagged_for_review, flag_reason,
                        requires_human_intervention, total_damage_count, severe_damage_count,
                        assessment_model, assessed_at
                 FROM quality_assessments WHERE sheet_id = ?1",
                params![sheet_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, bool>(8)?,
                        row.get::<_, Option<f64>>(9)?,
                        row.get::<_, bool>(10)?,
                        row.get::<_, bool>(11)?,
                        row.get::<_, Option<String>>(12)?,
                        row.get::<_, bool>(13)?,
                        row.get::<_, u32>(14)?,
                        row.get::<_, u32>(15)?,
                        row.get::<_, Option<String>>(16)?,
                        row.get::<_, String>(17)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            assessment_id,
            sheet_id,
            has_damage,
            damage_types,
            severity,
            score,
            is_recoverable,
            requires_reconstruction,
            reconstruction_performed,
            reconstruction_quality,
            approved,
            flagged,
            flag_reason,
            requires_human,
            total_count,
            severe_count,
            model,
            assessed_at,
        )) = row
        else {
            return Ok(None);
        };

        let damage_severity = severity
            .map(|s| match s.as_str() {
                "low" => Ok(DamageSeverity::Low),
                "medium" => Ok(DamageSeverity::Medium),
                "high" => Ok(DamageSeverity::High),
                "severe" => Ok(DamageSeverity::Severe),
                other => Err(StoreError::Corrupted(format!(
                    "quality_assessments.damage_severity: {other}"
                ))),
            })
            .transpose()?;

        Ok(Some(QualityAssessment {
            assessment_id,
            sheet_id,
            has_damage,
            damage_types: from_json(damage_types, "quality_assessments.damage_types")?,
            damage_severity,
            overall_quality_score: score,
            is_recoverable,
            requires_reconstruction,
            reconstruction_performed,
            reconstruction_quality,
            approved_for_evaluation: approved,
            flagged_for_review: flagged,
            flag_reason,
            requires_human_intervention: requires_human,
            total_damage_count: total_count,
            severe_damage_count: severe_count,
            assessment_model: model,
            assessed_at,
        }))
    }

    // ------------------------------------------------------------------
    // Evaluation results
    // ------------------------------------------------------------------

    pub fn insert_evaluation(conn: &Connection, eval: &Evaluation) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO evaluation_results (evaluation_id, sheet_id, key_id, roll_number,
                     exam_id, detected_answers, automated_total, automated_correct,
                     automated_incorrect, automated_unanswered, automated_percentage,
                     automated_grade, total_questions, max_marks, manual_total, marks_match,
                     discrepancy, requires_investigation, is_perfect_evaluation,
                     question_results, evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)",
            params![
                eval.evaluation_id,
                eval.sheet_id,
                eval.key_id,
                eval.roll_number,
                eval.exam_id,
                to_json(&eval.detected_answers),
                eval.automated_total,
                eval.automated_correct,
                eval.automated_incorrect,
                eval.automated_unanswered,
                eval.automated_percentage,
                eval.automated_grade,
                eval.total_questions,
                eval.max_marks,
                eval.manual_total,
                eval.marks_match,
                eval.discrepancy,
                eval.requires_investigation,
                eval.is_perfect_evaluation,
                to_json(&eval.question_results),
                eval.evaluated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_evaluation(&self, sheet_id: &str) -> Result<Option<Evaluation>, StoreError> {
        Self::get_evaluation_tx(&self.lock(), sheet_id)
    }

    pub fn get_evaluation_tx(
        conn: &Connection,
        sheet_id: &str,
    ) -> Result<Option<Evaluation>, StoreError> {
        let row = conn
            .query_row(
                "SELECT evaluation_id, sheet_id, key_id, roll_number, exam_id,
                        detected_answers, automated_total, automated_correct,
                        automated_incorrect, automated_unanswered, automated_percentage,
                        automated_grade, total_questions, max_marks, manual_total,
                        marks_match, discrepancy, requires_investigation,
                        is_perfect_evaluation, question_results, evaluated_at
                 FROM evaluation_results WHERE sheet_id = ?1",
                params![sheet_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, u32>(7)?,
                        row.get::<_, u32>(8)?,
                        row.get::<_, u32>(9)?,
                        row.get::<_, f64>(10)?,
                        row.get::<_, String>(11)?,
                        row.get::<_, u32>(12)?,
                        row.get::<_, f64>(13)?,
                        row.get::<_, Option<f64>>(14)?,
                        row.get::<_, Option<bool>>(15)?,
                        row.get::<_, Option<f64>>(16)?,
                        row.get::<_, bool>(17)?,
                        row.get::<_, bool>(18)?,
                        row.get::<_, String>(19)?,
                        row.get::<_, String>(20)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            evaluation_id,
            sheet_id,
            key_id,
            roll_number,
            exam_id,
            detected,
            total,
            correct,
            incorrect,
            unanswered,
            percentage,
            grade,
            total_questions,
            max_marks,
            manual_total,
            marks_match,
            discrepancy,
            requires_investigation,
            is_perfect,
            question_results,
            evaluated_at,
        )) = row
        else {
            return Ok(None);
        };

        let detected_answers: BTreeMap<String, String> =
            from_json(detected, "evaluation_results.detected_answers")?;
        let question_results: Vec<QuestionResult> =
            from_json(question_results, "evaluation_results.question_results")?;

        Ok(Some(Evaluation {
            evaluation_id,
            sheet_id,
            key_id,
            roll_number,
            exam_id,
            detected_answers,
            automated_total: total,
            automated_correct: correct,
            automated_incorrect: incorrect,
            automated_unanswered: unanswered,
            automated_percentage: percentage,
            automated_grade: grade,
            total_questions,
            max_marks,
            manual_total,
            marks_match,
            discrepancy,
            requires_investigation,
            is_perfect_evaluation: is_perfect,
            question_results,
            evaluated_at,
        }))
    }

    // ------------------------------------------------------------------
    // Human interventions
    // ------------------------------------------------------------------

    pub fn insert_intervention(
        conn: &Connection,
        intervention: &HumanIntervention,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO human_interventions (intervention_id, sheet_id, intervention_type,
                     pipeline_stage, reason, priority, status, resolution, resolved_by,
                     created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                intervention.intervention_id,
                intervention.sheet_id,
                intervention.intervention_type.as_str(),
                intervention.pipeline_stage,
                intervention.reason,
                intervention.priority.as_str(),
                intervention.status.as_str(),
                intervention.resolution,
                intervention.resolved_by,
                intervention.created_at,
                intervention.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_intervention(
        conn: &Connection,
        intervention: &HumanIntervention,
    ) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE human_interventions SET status = ?2, resolution = ?3,
                    resolved_by = ?4, resolved_at = ?5
             WHERE intervention_id = ?1",
            params![
                intervention.intervention_id,
                intervention.status.as_str(),
                intervention.resolution,
                intervention.resolved_by,
                intervention.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_intervention(
        &self,
        intervention_id: &str,
    ) -> Result<Option<HumanIntervention>, StoreError> {
        Self::get_intervention_tx(&self.lock(), intervention_id)
    }

    pub fn get_intervention_tx(
        conn: &Connection,
        intervention_id: &str,
    ) -> Result<Option<HumanIntervention>, StoreError> {
        let mut found = Self::query_interventions(
            conn,
            "intervention_id = ?1",
            params![intervention_id],
        )?;
        Ok(found.pop())
    }

    /// Pending interventions, most urgent first.
    pub fn pending_interventions(&self) -> Result<Vec<HumanIntervention>, StoreError> {
        Self::query_interventions(
            &self.lock(),
            "status = 'pending' ORDER BY
                 CASE priority
                     WHEN 'critical' THEN 0
                     WHEN 'high' THEN 1
                     WHEN 'medium' THEN 2
                     ELSE 3
                 END, created_at",
            params![],
        )
    }

    pub fn pending_interventions_for_sheet(
        &self,
        sheet_id: &str,
    ) -> Result<Vec<HumanIntervention>, StoreError> {
        Self::query_interventions(
            &self.lock(),
            "sheet_id = ?1 AND status = 'pending'",
            params![sheet_id],
        )
    }

    fn query_interventions(
        conn: &Connection,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<HumanIntervention>, StoreError> {
        let sql = format!(
            "SELECT intervention_id, sheet_id, intervention_type, pipeline_stage, reason,
                    priority, status, resolution, resolved_by, created_at, resolved_at
             FROM human_interventions WHERE {where_clause}"
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;

        let mut interventions = Vec::new();
        for row in rows {
            let (id, sheet_id, itype, stage, reason, priority, status, resolution, by, at, rat) =
                row?;
            interventions.push(HumanIntervention {
                intervention_id: id,
                sheet_id,
                intervention_type: parse_enum::<InterventionType>(
                    itype,
                    "human_interventions.intervention_type",
                )?,
                pipeline_stage: stage,
                reason,
                priority: parse_enum::<InterventionPriority>(
                    priority,
                    "human_interventions.priority",
                )?,
                status: parse_enum::<InterventionStatus>(status, "human_interventions.status")?,
                resolution,
                resolved_by: by,
                created_at: at,
                resolved_at: rat,
            });
        }
        Ok(interventions)
    }

    // ------------------------------------------------------------------
    // Pipeline stages + action log
    // ------------------------------------------------------------------

    /// Records the sheet's current pipeline position.
    pub fn upsert_pipeline_stage(
        conn: &Connection,
        sheet_id: &str,
        current_stage: &str,
        completed_stages: u32,
        overall_status: &str,
    ) -> Result<(), StoreError> {
        let now = utc_now_iso();
        conn.execute(
            "INSERT INTO pipeline_stages (sheet_id, current_stage, completed_stages,
                                          total_stages, overall_status, started_at, last_updated)
             VALUES (?1, ?2, ?3, 7, ?4, ?5, ?5)
             ON CONFLICT (sheet_id) DO UPDATE SET
                 current_stage = excluded.current_stage,
                 completed_stages = excluded.completed_stages,
                 overall_status = excluded.overall_status,
                 last_updated = excluded.last_updated",
            params![sheet_id, current_stage, completed_stages, overall_status, now],
        )?;
        Ok(())
    }

    /// Appends a row to the relational action log.
    pub fn insert_action_log(
        conn: &Connection,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        actor: &str,
        blockchain_hash: Option<&HexHash>,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO audit_logs (log_id, action, entity_type, entity_id, actor,
                                     blockchain_hash, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                crate::types::new_id(),
                action,
                entity_type,
                entity_id,
                actor,
                blockchain_hash.map(HexHash::as_str),
                utc_now_iso(),
            ],
        )?;
        Ok(())
    }
}

impl BlockSink for SqliteStore {
    fn persist_block(&self, block: &Block) -> Result<(), String> {
        self.with_tx(|conn| Self::insert_block(conn, block))
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockSink;
    use serde_json::json;

    fn scan_block(index: u64, prev: HexHash) -> Block {
        let mut data = serde_json::Map::new();
        data.insert("sheet_id".into(), json!("SHEET_1"));
        let merkle = Block::payload_merkle_root(&data);
        let mut block = Block {
            index,
            timestamp: utc_now_iso(),
            block_type: BlockType::Scan,
            data,
            previous_hash: prev,
            nonce: 0,
            hash: HexHash::zero(),
            merkle_root: merkle,
            signatures: Vec::new(),
        };
        block.mine(0, 10).expect("difficulty 0");
        block
    }

    fn sample_sheet(sheet_id: &str) -> Sheet {
        Sheet {
            sheet_id: sheet_id.to_string(),
            roll_number: "ROLL_1".into(),
            exam_id: "EXAM_1".into(),
            student_name: Some("A. Student".into()),
            original_file_hash: crate::hashing::hash_str("file"),
            object_store_url: None,
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
            created_at: utc_now_iso(),
            updated_at: utc_now_iso(),
        }
    }

    #[test]
    fn blocks_round_trip_in_index_order() {
        let store = SqliteStore::open_in_memory().expect("open");
        let b0 = scan_block(0, HexHash::zero());
        let b1 = scan_block(1, b0.hash.clone());

        store.persist_block(&b0).expect("persist b0");
        store.persist_block(&b1).expect("persist b1");

        let blocks = store.load_blocks().expect("load");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].index, 0);
        assert_eq!(blocks[1].previous_hash, blocks[0].hash);
        assert_eq!(store.block_count().expect("count"), 2);
    }

    #[test]
    fn duplicate_block_index_is_rejected() {
        let store = SqliteStore::open_in_memory().expect("open");
        let b0 = scan_block(0, HexHash::zero());
        store.persist_block(&b0).expect("persist");
        assert!(store.persist_block(&b0).is_err());
    }

    #[test]
    fn sheet_insert_update_round_trip() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut sheet = sample_sheet("SHEET_1");

        store
            .with_tx(|conn| SqliteStore::insert_sheet(conn, &sheet))
            .expect("insert");

        sheet.status = SheetStatus::BubbleDetected;
        sheet.record_stage(
            crate::types::Stage::Bubble,
            crate::hashing::hash_str("bubble"),
            4,
        );
        store
            .with_tx(|conn| SqliteStore::update_sheet(conn, &sheet))
            .expect("update");

        let loaded = store
            .get_sheet("SHEET_1")
            .expect("query")
            .expect("sheet exists");
        assert_eq!(loaded.status, SheetStatus::BubbleDetected);
        assert_eq!(loaded.bubble_block, Some(4));
        assert_eq!(loaded.bubble_hash, Some(crate::hashing::hash_str("bubble")));
        assert!(store.get_sheet("SHEET_MISSING").expect("query").is_none());
    }

    #[test]
    fn sheet_lookup_by_roll_returns_latest() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .with_tx(|conn| SqliteStore::insert_sheet(conn, &sample_sheet("SHEET_1")))
            .expect("insert");

        let found = store
            .get_sheet_by_roll("ROLL_1")
            .expect("query")
            .expect("found");
        assert_eq!(found.sheet_id, "SHEET_1");
    }

    #[test]
    fn approved_signature_per_signer_is_unique() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .with_tx(|conn| SqliteStore::insert_sheet(conn, &sample_sheet("SHEET_1")))
            .expect("insert sheet");

        let sig = SignatureRecord {
            signature_id: crate::types::new_id(),
            signer_type: SignerType::AiVerifier,
            signer_key: "k".into(),
            signed_data_hash: crate::hashing::hash_str("d"),
            signature_hash: crate::hashing::hash_str("s"),
            status: SignatureStatus::Approved,
            created_at: utc_now_iso(),
            signed_at: Some(utc_now_iso()),
        };

        store
            .with_tx(|conn| SqliteStore::insert_signature(conn, "SHEET_1", &sig))
            .expect("first signature");

        let mut dup = sig.clone();
        dup.signature_id = crate::types::new_id();
        let err = store.with_tx(|conn| SqliteStore::insert_signature(conn, "SHEET_1", &dup));
        assert!(err.is_err(), "duplicate approved signer must violate index");
    }

    #[test]
    fn failed_transaction_rolls_back_all_rows() {
        let store = SqliteStore::open_in_memory().expect("open");
        let b0 = scan_block(0, HexHash::zero());

        let result = store.with_tx(|conn| {
            SqliteStore::insert_block(conn, &b0)?;
            // Sheet references a block; now force a failure.
            Err::<(), _>(StoreError::Corrupted("simulated".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.block_count().expect("count"), 0);
    }

    #[test]
    fn result_round_trip_uses_cache() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .with_tx(|conn| SqliteStore::insert_sheet(conn, &sample_sheet("SHEET_1")))
            .expect("insert sheet");

        let result = FinalResult {
            result_id: crate::types::new_id(),
            sheet_id: "SHEET_1".into(),
            roll_number: "ROLL_1".into(),
            total_questions: 50,
            correct_answers: 34,
            incorrect_answers: 10,
            unanswered: 6,
            total_marks: 68.0,
            percentage: 68.0,
            grade: "B".into(),
            result_hash: crate::hashing::hash_str("result"),
            block_hash: crate::hashing::hash_str("block"),
            qr_payload: "{}".into(),
            qr_png_base64: String::new(),
            zkp_commitment: None,
            published_at: utc_now_iso(),
        };

        store
            .with_tx(|conn| SqliteStore::insert_result(conn, &result))
            .expect("insert result");

        let loaded = store
            .get_result_by_roll("ROLL_1")
            .expect("query")
            .expect("cached result");
        assert_eq!(loaded.total_marks, 68.0);
        assert_eq!(loaded.grade, "B");

        let exists = store
            .with_tx(|conn| SqliteStore::result_exists(conn, "SHEET_1"))
            .expect("query");
        assert!(exists);
    }

    #[test]
    fn answer_key_round_trip() {
        let store = SqliteStore::open_in_memory().expect("open");
        let paper = QuestionPaper {
            paper_id: "PAPER_1".into(),
            exam_id: "EXAM_1".into(),
            subject: "Physics".into(),
            title: None,
            total_questions: 2,
            max_marks: 40.0,
            file_hash: crate::hashing::hash_str("paper"),
            uploaded_at: utc_now_iso(),
        };

        let mut answers = BTreeMap::new();
        answers.insert(
            "Q1".to_string(),
            KeyEntry {
                answer: "A".into(),
                marks: 20.0,
            },
        );
        answers.insert(
            "Q2".to_string(),
            KeyEntry {
                answer: "C".into(),
                marks: 20.0,
            },
        );

        let mut key = AnswerKey {
            key_id: "KEY_1".into(),
            paper_id: "PAPER_1".into(),
            exam_id: "EXAM_1".into(),
            answers,
            status: AnswerKeyStatus::PendingVerification,
            key_hash: crate::hashing::hash_str("key"),
            ai_confidence: None,
            flagged_questions: Vec::new(),
            created_at: utc_now_iso(),
            verified_at: None,
        };

        store
            .with_tx(|conn| {
                SqliteStore::insert_question_paper(conn, &paper)?;
                SqliteStore::insert_answer_key(conn, &key)
            })
            .expect("insert");

        key.status = AnswerKeyStatus::Approved;
        key.ai_confidence = Some(0.95);
        store
            .with_tx(|conn| SqliteStore::update_answer_key(conn, &key))
            .expect("update");

        let loaded = store
            .get_answer_key("KEY_1")
            .expect("query")
            .expect("key exists");
        assert_eq!(loaded.status, AnswerKeyStatus::Approved);
        assert_eq!(loaded.answers.len(), 2);
        assert_eq!(loaded.ai_confidence, Some(0.95));

        let loaded_paper = store
            .get_question_paper("PAPER_1")
            .expect("query")
            .expect("paper exists");
        assert_eq!(loaded_paper.subject, "Physics");
    }

    #[test]
    fn interventions_query_pending_by_priority() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .with_tx(|conn| SqliteStore::insert_sheet(conn, &sample_sheet("SHEET_1")))
            .expect("insert sheet");

        let mk = |id: &str, priority: InterventionPriority| HumanIntervention {
            intervention_id: id.to_string(),
            sheet_id: "SHEET_1".into(),
            intervention_type: InterventionType::QualityReview,
            pipeline_stage: "quality_assessment".into(),
            reason: "damaged".into(),
            priority,
            status: InterventionStatus::Pending,
            resolution: None,
            resolved_by: None,
            created_at: utc_now_iso(),
            resolved_at: None,
        };

        store
            .with_tx(|conn| {
                SqliteStore::insert_intervention(conn, &mk("I1", InterventionPriority::Medium))?;
                SqliteStore::insert_intervention(conn, &mk("I2", InterventionPriority::High))
            })
            .expect("insert interventions");

        let pending = store.pending_interventions().expect("query");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].intervention_id, "I2");

        let mut resolved = pending[0].clone();
        resolved.status = InterventionStatus::Resolved;
        resolved.resolution = Some("approved after review".into());
        resolved.resolved_at = Some(utc_now_iso());
        store
            .with_tx(|conn| SqliteStore::update_intervention(conn, &resolved))
            .expect("update");

        let remaining = store
            .pending_interventions_for_sheet("SHEET_1")
            .expect("query");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].intervention_id, "I1");
    }

    #[test]
    fn events_preserve_per_sheet_order() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .with_tx(|conn| SqliteStore::insert_sheet(conn, &sample_sheet("SHEET_1")))
            .expect("insert sheet");

        for (i, event_type) in ["scan_created", "bubble_created"].iter().enumerate() {
            let event = EventRecord {
                event_id: crate::types::new_id(),
                event_type: event_type.to_string(),
                sheet_id: "SHEET_1".into(),
                block_index: None,
                event_data: json!({"step": i}),
                event_hash: crate::hashing::hash_str(event_type),
                triggered_by: "system".into(),
                timestamp: format!("2026-01-01T00:00:0{i}.000000Z"),
            };
            store
                .with_tx(|conn| SqliteStore::insert_event(conn, &event))
                .expect("insert event");
        }

        let events = store.events_for_sheet("SHEET_1").expect("query");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "scan_created");
        assert_eq!(events[1].event_type, "bubble_created");
    }
}
