//! Core domain types used by the evaluation ledger.
//!
//! This module defines the strongly-typed hash wrapper shared by every
//! integrity-bearing field, plus the block, sheet, signature, and
//! evaluation records that flow between the chain, the state machine,
//! and persistence. The goal is to avoid "naked" strings in public
//! APIs wherever a value has structure worth enforcing.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod block;
pub mod evaluation;
pub mod sheet;
pub mod signature;

pub use block::{Block, BlockType};
pub use evaluation::{
    AnswerKey, AnswerKeyStatus, DamageSeverity, Evaluation, FinalResult, HumanIntervention,
    InterventionPriority, InterventionStatus, InterventionType, KeyEntry, QualityAssessment,
    QuestionPaper, QuestionResult, RecheckRequest, RecheckStatus,
};
pub use sheet::{Sheet, SheetStatus, Stage};
pub use signature::{REQUIRED_SIGNERS, SignatureRecord, SignatureStatus, SignerType};

/// Length in characters of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Hex-encoded SHA-256 digest.
///
/// All hashes in the system travel as lowercase hex strings: block
/// hashes, Merkle roots, file hashes, signature hashes, event hashes.
/// Wrapping the string keeps hash-valued and free-text fields apart in
/// public APIs and centralizes the difficulty-prefix check used by
/// proof-of-work validation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexHash(String);

impl HexHash {
    /// Wraps a raw 32-byte digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        HexHash(hex::encode(digest))
    }

    /// The all-zero hash used as `previous_hash` of the genesis block.
    pub fn zero() -> Self {
        HexHash("0".repeat(HASH_HEX_LEN))
    }

    /// Parses a hex digest, checking length and character set.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(HexHash(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Returns the hex digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the digest starts with `difficulty` zero hex digits.
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        let prefix = difficulty as usize;
        prefix <= self.0.len() && self.0.bytes().take(prefix).all(|b| b == b'0')
    }
}

impl fmt::Display for HexHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for HexHash {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Current UTC time as an ISO-8601 string with microsecond precision.
///
/// All timestamps the ledger writes (block timestamps, audit entries,
/// signature times) come from here so they share one format.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Fresh v4 UUID string for log/event/signature identifiers.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_is_64_zeros() {
        let z = HexHash::zero();
        assert_eq!(z.as_str().len(), HASH_HEX_LEN);
        assert!(z.as_str().bytes().all(|b| b == b'0'));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(HexHash::parse("abc").is_none());
        assert!(HexHash::parse(&"g".repeat(64)).is_none());
        assert!(HexHash::parse(&"a".repeat(64)).is_some());
    }

    #[test]
    fn parse_normalizes_case() {
        let h = HexHash::parse(&"AB".repeat(32)).expect("valid hex");
        assert_eq!(h.as_str(), "ab".repeat(32));
    }

    #[test]
    fn difficulty_prefix_check() {
        let h = HexHash::parse(&format!("0000{}", "a".repeat(60))).expect("valid");
        assert!(h.meets_difficulty(0));
        assert!(h.meets_difficulty(4));
        assert!(!h.meets_difficulty(5));
    }

    #[test]
    fn timestamps_are_utc_with_suffix() {
        let ts = utc_now_iso();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }
}
