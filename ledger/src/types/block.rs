//! Block types and hashing.
//!
//! A block is one immutable ledger entry: a lifecycle event for a
//! sheet (scan, bubble detection, scoring, verification, result) or an
//! exam-level event (question paper upload, answer key verification).
//! Its hash covers index, timestamp, type, payload, predecessor hash,
//! nonce, and Merkle root via the canonical JSON routine in
//! [`crate::hashing`], so the same logical block always hashes the
//! same way on every node and on every replay.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::signature::SignatureRecord;
use super::HexHash;
use crate::error::LedgerError;
use crate::hashing::{self, merkle_root};

/// Closed set of block types recorded on the chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Genesis,
    Scan,
    Bubble,
    Score,
    Verify,
    Result,
    Recheck,
    QualityAssessment,
    QualityHumanReview,
    QuestionPaperUpload,
    AnswerKeyVerified,
    AnswerKeyApproved,
    Evaluation,
    HumanIntervention,
}

impl BlockType {
    /// Stable wire/storage name of the block type.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Genesis => "genesis",
            BlockType::Scan => "scan",
            BlockType::Bubble => "bubble",
            BlockType::Score => "score",
            BlockType::Verify => "verify",
            BlockType::Result => "result",
            BlockType::Recheck => "recheck",
            BlockType::QualityAssessment => "quality_assessment",
            BlockType::QualityHumanReview => "quality_human_review",
            BlockType::QuestionPaperUpload => "question_paper_upload",
            BlockType::AnswerKeyVerified => "answer_key_verified",
            BlockType::AnswerKeyApproved => "answer_key_approved",
            BlockType::Evaluation => "evaluation",
            BlockType::HumanIntervention => "human_intervention",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "genesis" => Ok(BlockType::Genesis),
            "scan" => Ok(BlockType::Scan),
            "bubble" => Ok(BlockType::Bubble),
            "score" => Ok(BlockType::Score),
            "verify" => Ok(BlockType::Verify),
            "result" => Ok(BlockType::Result),
            "recheck" => Ok(BlockType::Recheck),
            "quality_assessment" => Ok(BlockType::QualityAssessment),
            "quality_human_review" => Ok(BlockType::QualityHumanReview),
            "question_paper_upload" => Ok(BlockType::QuestionPaperUpload),
            "answer_key_verified" => Ok(BlockType::AnswerKeyVerified),
            "answer_key_approved" => Ok(BlockType::AnswerKeyApproved),
            "evaluation" => Ok(BlockType::Evaluation),
            "human_intervention" => Ok(BlockType::HumanIntervention),
            other => Err(format!("unknown block type: {other}")),
        }
    }
}

/// One entry of the append-only chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain, monotonic from 0 (genesis).
    pub index: u64,
    /// ISO-8601 UTC creation time.
    pub timestamp: String,
    /// What lifecycle event this block records.
    pub block_type: BlockType,
    /// Opaque payload; key insertion order drives the Merkle leaves.
    pub data: Map<String, Value>,
    /// Hash of the predecessor block (all zeros for genesis).
    pub previous_hash: HexHash,
    /// Proof-of-work counter.
    pub nonce: u64,
    /// Block hash; covers all fields above plus the Merkle root.
    pub hash: HexHash,
    /// Merkle root over the payload's string-coerced values.
    pub merkle_root: HexHash,
    /// Approval signatures embedded in verify blocks (empty elsewhere).
    pub signatures: Vec<SignatureRecord>,
}

/// Coerces a payload value into the string form used as a Merkle leaf.
///
/// Strings are used verbatim; everything else is rendered as canonical
/// JSON so the leaf text is stable across serializations.
pub fn leaf_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => hashing::canonical_json(other),
    }
}

impl Block {
    /// Computes the Merkle root over `data`'s values in insertion order.
    pub fn payload_merkle_root(data: &Map<String, Value>) -> HexHash {
        let leaves: Vec<String> = data.values().map(leaf_string).collect();
        merkle_root(&leaves)
    }

    /// Recomputes this block's hash from its current fields.
    ///
    /// The hash covers `{index, timestamp, block_type, data,
    /// previous_hash, nonce, merkle_root}` in canonical JSON form.
    /// Embedded signatures are not part of the hash; they are bound by
    /// the payload's approval proof instead.
    pub fn compute_hash(&self) -> HexHash {
        let body = json!({
            "index": self.index,
            "timestamp": self.timestamp,
            "block_type": self.block_type.as_str(),
            "data": Value::Object(self.data.clone()),
            "previous_hash": self.previous_hash.as_str(),
            "nonce": self.nonce,
            "merkle_root": self.merkle_root.as_str(),
        });
        hashing::hash_value(&body)
    }

    /// Mines the block: increments `nonce` from its current value until
    /// the hash carries `difficulty` leading zeros, bounded by `budget`
    /// attempts.
    ///
    /// Mining is a deterministic structural marker, not a security
    /// property; the budget keeps a mis-tuned difficulty from pinning a
    /// CPU forever.
    pub fn mine(&mut self, difficulty: u32, budget: u64) -> Result<(), LedgerError> {
        let mut attempts: u64 = 0;

        loop {
            self.hash = self.compute_hash();
            if self.hash.meets_difficulty(difficulty) {
                return Ok(());
            }

            attempts += 1;
            if attempts >= budget {
                return Err(LedgerError::MiningBudgetExceeded {
                    attempts,
                    difficulty,
                });
            }
            self.nonce += 1;
        }
    }

    /// Checks this block's self-contained invariants: stored hash
    /// matches the recomputed hash, the Merkle root matches the
    /// payload, and the difficulty prefix holds.
    ///
    /// Genesis is exempt from the Merkle and difficulty checks: its
    /// root is the fixed `merkle_root(["genesis"])` marker and it is
    /// never mined, so only its hash is re-verified.
    pub fn check_integrity(&self, difficulty: u32) -> Result<(), LedgerError> {
        if self.hash != self.compute_hash() {
            return Err(LedgerError::HashMismatch {
                context: format!("block {} hash does not match its contents", self.index),
            });
        }

        if self.block_type == BlockType::Genesis {
            return Ok(());
        }

        if self.merkle_root != Self::payload_merkle_root(&self.data) {
            return Err(LedgerError::HashMismatch {
                context: format!("block {} merkle root does not match payload", self.index),
            });
        }

        if !self.hash.meets_difficulty(difficulty) {
            return Err(LedgerError::HashMismatch {
                context: format!(
                    "block {} does not meet difficulty {difficulty}",
                    self.index
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("sheet_id".into(), json!("SHEET_1"));
        data.insert("roll_number".into(), json!("ROLL_1"));
        data.insert("file_hash".into(), json!("a".repeat(64)));
        data
    }

    fn unmined_block(data: Map<String, Value>) -> Block {
        let merkle = Block::payload_merkle_root(&data);
        Block {
            index: 1,
            timestamp: "2026-01-01T00:00:00.000000Z".to_string(),
            block_type: BlockType::Scan,
            data,
            previous_hash: HexHash::zero(),
            nonce: 0,
            hash: HexHash::zero(),
            merkle_root: merkle,
            signatures: Vec::new(),
        }
    }

    #[test]
    fn block_hash_is_deterministic() {
        let block = unmined_block(payload());
        assert_eq!(block.compute_hash(), block.compute_hash());
    }

    #[test]
    fn mining_produces_difficulty_prefix() {
        let mut block = unmined_block(payload());
        block.mine(2, 1_000_000).expect("difficulty 2 mines quickly");
        assert!(block.hash.meets_difficulty(2));
        assert_eq!(block.hash, block.compute_hash());
    }

    #[test]
    fn mining_with_zero_difficulty_accepts_first_hash() {
        let mut block = unmined_block(payload());
        block.mine(0, 10).expect("no prefix requirement");
        assert_eq!(block.nonce, 0);
    }

    #[test]
    fn mining_budget_is_enforced() {
        let mut block = unmined_block(payload());
        // Difficulty 64 is unreachable; the budget must trip.
        let err = block.mine(64, 10).unwrap_err();
        assert!(matches!(err, LedgerError::MiningBudgetExceeded { .. }));
    }

    #[test]
    fn integrity_detects_tampered_payload() {
        let mut block = unmined_block(payload());
        block.mine(1, 1_000_000).expect("mines");
        assert!(block.check_integrity(1).is_ok());

        block.data.insert("roll_number".into(), json!("ROLL_2"));
        assert!(block.check_integrity(1).is_err());
    }

    #[test]
    fn genesis_skips_merkle_and_difficulty_checks() {
        let mut data = Map::new();
        data.insert("message".into(), json!("genesis message"));

        let mut genesis = Block {
            index: 0,
            timestamp: "2026-01-01T00:00:00.000000Z".to_string(),
            block_type: BlockType::Genesis,
            data,
            previous_hash: HexHash::zero(),
            nonce: 0,
            hash: HexHash::zero(),
            // Marker root unrelated to the payload, unmined hash.
            merkle_root: crate::hashing::merkle_root(&["genesis"]),
            signatures: Vec::new(),
        };
        genesis.hash = genesis.compute_hash();

        assert!(genesis.check_integrity(4).is_ok());

        // The hash itself is still verified.
        genesis.nonce = 1;
        assert!(genesis.check_integrity(4).is_err());
    }

    #[test]
    fn merkle_root_tracks_insertion_order() {
        let mut a = Map::new();
        a.insert("x".into(), json!("1"));
        a.insert("y".into(), json!("2"));

        let mut b = Map::new();
        b.insert("y".into(), json!("2"));
        b.insert("x".into(), json!("1"));

        // Same entries, different insertion order: different leaves.
        assert_ne!(Block::payload_merkle_root(&a), Block::payload_merkle_root(&b));
    }

    #[test]
    fn leaf_string_keeps_strings_verbatim() {
        assert_eq!(leaf_string(&json!("plain")), "plain");
        assert_eq!(leaf_string(&json!({"k": 1})), r#"{"k":1}"#);
        assert_eq!(leaf_string(&json!(4.5)), "4.5");
    }

    #[test]
    fn block_type_round_trips_through_str() {
        for t in [
            BlockType::Genesis,
            BlockType::Scan,
            BlockType::QualityAssessment,
            BlockType::AnswerKeyApproved,
            BlockType::HumanIntervention,
        ] {
            assert_eq!(t.as_str().parse::<BlockType>().expect("parses"), t);
        }
        assert!("bogus".parse::<BlockType>().is_err());
    }
}
