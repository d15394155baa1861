//! JSON audit log mirroring every ledger event.
//!
//! Each sheet gets an append-only document at
//! `<log_dir>/<sheet_id>.json`; a master log at
//! `<log_dir>/master_log.json` mirrors every append. Every entry
//! carries its own integrity hash over `{sheet_id, event_type,
//! event_data, timestamp}`, so a log file can be re-verified without
//! the chain.
//!
//! Writers serialize per sheet through a striped lock map and replace
//! files atomically (write to a temp file, then rename), so readers
//! never observe a half-written document. The logger is independent
//! of the chain's append lock: audit writes do not block mining.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::LedgerError;
use crate::hashing;
use crate::types::{HexHash, new_id, utc_now_iso};

/// One audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub log_id: String,
    pub sheet_id: String,
    pub event_type: String,
    pub event_data: Value,
    /// Hash of the chain block this event mirrors, when one exists.
    pub block_hash: Option<HexHash>,
    pub actor: String,
    pub timestamp: String,
    /// `SHA256(canonical_json({sheet_id, event_type, event_data,
    /// timestamp}))`.
    pub event_hash: HexHash,
}

impl AuditLogEntry {
    /// Recomputes the integrity hash from the entry's own fields.
    pub fn expected_hash(&self) -> HexHash {
        entry_hash(
            &self.sheet_id,
            &self.event_type,
            &self.event_data,
            &self.timestamp,
        )
    }
}

fn entry_hash(sheet_id: &str, event_type: &str, event_data: &Value, timestamp: &str) -> HexHash {
    hashing::hash_value(&json!({
        "sheet_id": sheet_id,
        "event_type": event_type,
        "event_data": event_data,
        "timestamp": timestamp,
    }))
}

/// On-disk shape of one sheet's audit document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogFile {
    pub sheet_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub entry_count: usize,
    pub entries: Vec<AuditLogEntry>,
}

/// Per-sheet JSON audit logger.
pub struct AuditLogger {
    log_dir: PathBuf,
    /// One lock per log file, keyed by sheet id. The master log uses
    /// its own fixed key.
    file_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

const MASTER_LOG: &str = "master_log";

impl AuditLogger {
    /// Creates the logger, ensuring the log directory exists.
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self, LedgerError> {
        fs::create_dir_all(&log_dir).map_err(|e| LedgerError::PersistenceFailed {
            source: format!("create audit log directory: {e}"),
        })?;
        Ok(Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.json"))
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().expect("file lock map poisoned");
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Appends an event to the sheet's log and mirrors it into the
    /// master log. Returns the entry as written.
    pub fn append(
        &self,
        sheet_id: &str,
        event_type: &str,
        event_data: Value,
        block_hash: Option<HexHash>,
        actor: &str,
    ) -> Result<AuditLogEntry, LedgerError> {
        let timestamp = utc_now_iso();
        let entry = AuditLogEntry {
            log_id: new_id(),
            sheet_id: sheet_id.to_string(),
            event_type: event_type.to_string(),
            event_hash: entry_hash(sheet_id, event_type, &event_data, &timestamp),
            event_data,
            block_hash,
            actor: actor.to_string(),
            timestamp,
        };

        self.append_to_file(sheet_id, &entry)?;
        self.append_to_file(MASTER_LOG, &entry)?;

        tracing::debug!(sheet_id, event_type, "audit entry appended");
        Ok(entry)
    }

    fn append_to_file(&self, name: &str, entry: &AuditLogEntry) -> Result<(), LedgerError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().expect("audit file lock poisoned");

        let path = self.log_path(name);
        let mut doc = match self.read_file(&path)? {
            Some(doc) => doc,
            None => AuditLogFile {
                sheet_id: name.to_string(),
                created_at: utc_now_iso(),
                updated_at: utc_now_iso(),
                entry_count: 0,
                entries: Vec::new(),
            },
        };

        doc.entries.push(entry.clone());
        doc.entry_count = doc.entries.len();
        doc.updated_at = utc_now_iso();

        self.write_atomic(&path, &doc)
    }

    fn read_file(&self, path: &Path) -> Result<Option<AuditLogFile>, LedgerError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let doc = serde_json::from_str(&text).map_err(|e| {
                    LedgerError::IntegrityViolation {
                        context: format!("audit log {} is not valid JSON: {e}", path.display()),
                    }
                })?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LedgerError::PersistenceFailed {
                source: format!("read audit log {}: {e}", path.display()),
            }),
        }
    }

    /// Pretty-printed write through a temp file plus rename, so
    /// concurrent readers always see a complete document.
    fn write_atomic(&self, path: &Path, doc: &AuditLogFile) -> Result<(), LedgerError> {
        let text =
            serde_json::to_string_pretty(doc).expect("audit documents serialize to JSON");
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, text).map_err(|e| LedgerError::PersistenceFailed {
            source: format!("write audit log {}: {e}", tmp.display()),
        })?;
        fs::rename(&tmp, path).map_err(|e| LedgerError::PersistenceFailed {
            source: format!("replace audit log {}: {e}", path.display()),
        })?;
        Ok(())
    }

    /// Reads a sheet's full audit document.
    pub fn read_sheet(&self, sheet_id: &str) -> Result<Option<AuditLogFile>, LedgerError> {
        self.read_file(&self.log_path(sheet_id))
    }

    /// Chronological event timeline for a sheet.
    pub fn timeline(&self, sheet_id: &str) -> Result<Vec<AuditLogEntry>, LedgerError> {
        let Some(doc) = self.read_sheet(sheet_id)? else {
            return Ok(Vec::new());
        };
        let mut entries = doc.entries;
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Entries of one event type for a sheet.
    pub fn read_by_type(
        &self,
        sheet_id: &str,
        event_type: &str,
    ) -> Result<Vec<AuditLogEntry>, LedgerError> {
        let Some(doc) = self.read_sheet(sheet_id)? else {
            return Ok(Vec::new());
        };
        Ok(doc
            .entries
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect())
    }

    /// Master-log entries that reference a block hash.
    pub fn read_by_block_hash(&self, block_hash: &HexHash) -> Result<Vec<AuditLogEntry>, LedgerError> {
        let Some(doc) = self.read_file(&self.log_path(MASTER_LOG))? else {
            return Ok(Vec::new());
        };
        Ok(doc
            .entries
            .into_iter()
            .filter(|e| e.block_hash.as_ref() == Some(block_hash))
            .collect())
    }

    /// Re-hashes every entry of a sheet's log and compares.
    ///
    /// Returns `integrity_violation` naming the first bad entry; a
    /// missing log is `not_found`.
    pub fn verify_integrity(&self, sheet_id: &str) -> Result<(), LedgerError> {
        let doc = self
            .read_sheet(sheet_id)?
            .ok_or_else(|| LedgerError::not_found(format!("audit log for sheet {sheet_id}")))?;

        for entry in &doc.entries {
            if entry.event_hash != entry.expected_hash() {
                return Err(LedgerError::IntegrityViolation {
                    context: format!(
                        "audit entry {} of sheet {sheet_id} fails its hash",
                        entry.log_id
                    ),
                });
            }
        }
        Ok(())
    }

    /// Exports a sheet's log to `output_path` as pretty JSON.
    pub fn export(&self, sheet_id: &str, output_path: &Path) -> Result<(), LedgerError> {
        let doc = self
            .read_sheet(sheet_id)?
            .ok_or_else(|| LedgerError::not_found(format!("audit log for sheet {sheet_id}")))?;
        self.write_atomic(output_path, &doc)
    }
}
