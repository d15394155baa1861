//! External collaborator interfaces: AI vision models and the blob
//! store for raw sheet images.
//!
//! The core never talks to a concrete AI backend directly; it goes
//! through the narrow [`AiProvider`] capability, usually wrapped in
//! the [`retry::RetryingProvider`] decorator that adds exponential
//! backoff on throttling and a mock fallback marked for human review.
//! Raw images live behind [`ObjectStore`] with content-addressed keys.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LedgerError;
use crate::types::HexHash;

pub mod fs_store;
pub mod http;
pub mod retry;

pub use fs_store::FsObjectStore;
pub use http::HttpAiProvider;
pub use retry::RetryingProvider;

/// Uniform response shape of every AI method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiResponse {
    /// Method-specific structured output.
    pub output: Value,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    /// Advisory flags, e.g. `"mock_fallback"`, `"requires_human_review"`.
    pub flags: Vec<String>,
}

impl AiResponse {
    /// Whether any flag asks for human review.
    pub fn needs_human_review(&self) -> bool {
        self.flags.iter().any(|f| f == "requires_human_review")
    }
}

/// Errors from an AI backend.
#[derive(Debug)]
pub enum AiError {
    /// Transport-level failure (connection refused, timeout).
    Transport(String),
    /// The service rate-limited the call; retryable.
    Throttled(String),
    /// The service answered but refused or errored.
    Service(String),
    /// The response could not be parsed.
    Protocol(String),
}

impl fmt::Display for AiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiError::Transport(msg) => write!(f, "AI transport error: {msg}"),
            AiError::Throttled(msg) => write!(f, "AI call throttled: {msg}"),
            AiError::Service(msg) => write!(f, "AI service error: {msg}"),
            AiError::Protocol(msg) => write!(f, "AI protocol error: {msg}"),
        }
    }
}

impl std::error::Error for AiError {}

/// Narrow capability over the external vision models.
///
/// Implementations talk to whatever backend hosts the models; the
/// lifecycle only sees these six methods and their uniform
/// [`AiResponse`].
pub trait AiProvider: Send + Sync {
    /// Solves a question independently, for answer-key verification.
    fn solve_question(&self, question_text: &str, subject: &str) -> Result<AiResponse, AiError>;

    /// Compares a proposed answer against the official key answer.
    fn verify_answer(
        &self,
        question_text: &str,
        proposed_answer: &str,
        official_answer: &str,
    ) -> Result<AiResponse, AiError>;

    /// Judges a student objection against the official answer.
    fn evaluate_objection(
        &self,
        question_text: &str,
        objection: &str,
        official_answer: &str,
    ) -> Result<AiResponse, AiError>;

    /// Detects filled bubbles on a scanned sheet image.
    fn detect_bubbles(&self, image: &[u8]) -> Result<AiResponse, AiError>;

    /// Detects physical damage on a scanned sheet image.
    fn detect_damage(&self, image: &[u8]) -> Result<AiResponse, AiError>;

    /// Reconstructs a damaged sheet image.
    fn reconstruct_sheet(&self, image: &[u8]) -> Result<AiResponse, AiError>;
}

/// Blob store for raw sheet images.
///
/// The chain stores only hashes; the bytes live here under
/// content-addressed keys (see [`object_key`]).
pub trait ObjectStore: Send + Sync {
    /// Stores bytes under `key` with optional metadata; returns the
    /// object's URL.
    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, LedgerError>;

    /// Fetches the bytes stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, LedgerError>;

    /// Produces a time-limited access URL for `key`.
    fn presign(&self, key: &str, ttl: Duration) -> Result<String, LedgerError>;

    /// Re-hashes the stored bytes and compares with `expected_hash`.
    fn verify(&self, key: &str, expected_hash: &HexHash) -> Result<bool, LedgerError>;
}

/// Builds the canonical object key for a sheet image:
/// `sheets/<yyyy>/<mm>/<dd>/<content_hash>_<name>`.
pub fn object_key(uploaded_at: DateTime<Utc>, content_hash: &HexHash, name: &str) -> String {
    format!(
        "sheets/{}/{}_{name}",
        uploaded_at.format("%Y/%m/%d"),
        content_hash.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn object_keys_are_date_partitioned() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        let hash = crate::hashing::hash_str("image");
        let key = object_key(at, &hash, "SHEET_1.jpg");

        assert!(key.starts_with("sheets/2026/03/07/"));
        assert!(key.ends_with("_SHEET_1.jpg"));
        assert!(key.contains(hash.as_str()));
    }

    #[test]
    fn response_flags_drive_review() {
        let r = AiResponse {
            output: serde_json::json!({}),
            confidence: 0.5,
            flags: vec!["mock_fallback".into(), "requires_human_review".into()],
        };
        assert!(r.needs_human_review());
    }
}
