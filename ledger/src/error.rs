//! Domain error taxonomy.
//!
//! Every user-visible failure maps to one of these variants so the
//! HTTP layer can translate outcomes to status codes without string
//! matching. Lower layers keep their own error types ([`StoreError`](crate::store::StoreError),
//! [`AiError`](crate::providers::AiError)) and convert into this one at
//! the lifecycle boundary.

use std::fmt;

use crate::types::SignerType;

/// Errors surfaced by ledger operations and lifecycle commands.
#[derive(Debug)]
pub enum LedgerError {
    /// Sheet, key, block, or result unknown.
    NotFound { what: String },
    /// Duplicate sheet, stage, or signer; includes divergent repeats
    /// of an already-completed stage.
    AlreadyExists { what: String },
    /// Command called in the wrong lifecycle state. `entity` is the
    /// sheet or answer-key id, `state` its current state name.
    InvalidState {
        entity: String,
        state: String,
        expected: &'static str,
    },
    /// Declared hash does not match the computed one, or a stored
    /// block no longer hashes to itself.
    HashMismatch { context: String },
    /// Verification is missing one or more signer approvals.
    SignaturesIncomplete { missing: Vec<SignerType> },
    /// The quality gate rejected the sheet; an intervention was filed.
    QualityRejected { sheet_id: String, reason: String },
    /// Mining gave up after the configured attempt budget.
    MiningBudgetExceeded { attempts: u64, difficulty: u32 },
    /// AI provider or object store failed after retries.
    ExternalFailed { source: String },
    /// Durable write failed; the in-memory append was rolled back.
    PersistenceFailed { source: String },
    /// Chain or audit replay disagreed with stored hashes.
    IntegrityViolation { context: String },
}

impl LedgerError {
    /// Stable machine-readable tag for the error kind.
    pub fn tag(&self) -> &'static str {
        match self {
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::AlreadyExists { .. } => "already_exists",
            LedgerError::InvalidState { .. } => "invalid_state",
            LedgerError::HashMismatch { .. } => "hash_mismatch",
            LedgerError::SignaturesIncomplete { .. } => "signatures_incomplete",
            LedgerError::QualityRejected { .. } => "quality_rejected",
            LedgerError::MiningBudgetExceeded { .. } => "mining_budget_exceeded",
            LedgerError::ExternalFailed { .. } => "external_failed",
            LedgerError::PersistenceFailed { .. } => "persistence_failed",
            LedgerError::IntegrityViolation { .. } => "integrity_violation",
        }
    }

    /// Convenience constructor for [`LedgerError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        LedgerError::NotFound { what: what.into() }
    }

    /// Convenience constructor for [`LedgerError::AlreadyExists`].
    pub fn already_exists(what: impl Into<String>) -> Self {
        LedgerError::AlreadyExists { what: what.into() }
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::NotFound { what } => write!(f, "not found: {what}"),
            LedgerError::AlreadyExists { what } => write!(f, "already exists: {what}"),
            LedgerError::InvalidState {
                entity,
                state,
                expected,
            } => write!(
                f,
                "{entity} is in state '{state}', command requires {expected}"
            ),
            LedgerError::HashMismatch { context } => write!(f, "hash mismatch: {context}"),
            LedgerError::SignaturesIncomplete { missing } => {
                let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
                write!(f, "verification incomplete, missing: {}", names.join(", "))
            }
            LedgerError::QualityRejected { sheet_id, reason } => {
                write!(f, "sheet {sheet_id} rejected by quality gate: {reason}")
            }
            LedgerError::MiningBudgetExceeded {
                attempts,
                difficulty,
            } => write!(
                f,
                "mining budget exceeded after {attempts} attempts at difficulty {difficulty}"
            ),
            LedgerError::ExternalFailed { source } => write!(f, "external call failed: {source}"),
            LedgerError::PersistenceFailed { source } => {
                write!(f, "durable write failed: {source}")
            }
            LedgerError::IntegrityViolation { context } => {
                write!(f, "integrity violation: {context}")
            }
        }
    }
}

impl std::error::Error for LedgerError {}
