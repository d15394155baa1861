//! Multi-signature approval engine.
//!
//! The verify→result transition is gated on three independently keyed
//! approvals: the AI verifier, a human verifier, and the admin
//! controller. This module collects signatures for one verification
//! attempt, enforces authorization and uniqueness per signer role, and
//! emits the approval proof that gets embedded into the verify block.
//!
//! Rejection is permanent for a given attempt; a new verification
//! attempt for the same sheet starts a fresh [`SignatureSet`].

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::config::SignerKeys;
use crate::error::LedgerError;
use crate::hashing;
use crate::types::{
    HexHash, REQUIRED_SIGNERS, SignatureRecord, SignatureStatus, SignerType, new_id, utc_now_iso,
};

/// Proof that all required approvals were collected.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ApprovalProof {
    pub proof_hash: HexHash,
    pub signature_hashes: Vec<HexHash>,
    pub timestamp: String,
}

/// Signature collection for one pending verification.
pub struct SignatureSet {
    authorized: SignerKeys,
    /// Canonical hash of the payload every signer must endorse.
    payload_hash: HexHash,
    signatures: BTreeMap<&'static str, SignatureRecord>,
}

impl SignatureSet {
    /// Starts a fresh collection over the given verification payload.
    pub fn new(authorized: SignerKeys, payload: &Value) -> Self {
        Self {
            authorized,
            payload_hash: hashing::hash_value(payload),
            signatures: BTreeMap::new(),
        }
    }

    /// Hash of the payload this set endorses.
    pub fn payload_hash(&self) -> &HexHash {
        &self.payload_hash
    }

    /// Accepts a signature from one signer.
    ///
    /// Checks, in order: the signer role is one of the three required
    /// types (guaranteed by the type), the submitted key matches the
    /// authorized key for that role, and no prior approved signature
    /// of that role exists in this set. On acceptance the signature
    /// hash is derived deterministically and the record is stored as
    /// approved.
    pub fn add_signature(
        &mut self,
        signer_type: SignerType,
        signer_key: &str,
    ) -> Result<SignatureRecord, LedgerError> {
        if self.authorized.key_for(signer_type) != signer_key {
            return Err(LedgerError::HashMismatch {
                context: format!("signer key for {signer_type} is not authorized"),
            });
        }

        if self.signatures.contains_key(signer_type.as_str()) {
            return Err(LedgerError::already_exists(format!(
                "signature from {signer_type}"
            )));
        }

        let created_at = utc_now_iso();
        let signature_hash = derive_signature_hash(
            signer_type,
            signer_key,
            &self.payload_hash,
            &created_at,
        );

        let record = SignatureRecord {
            signature_id: new_id(),
            signer_type,
            signer_key: signer_key.to_string(),
            signed_data_hash: self.payload_hash.clone(),
            signature_hash,
            status: SignatureStatus::Approved,
            created_at: created_at.clone(),
            signed_at: Some(created_at),
        };

        self.signatures.insert(signer_type.as_str(), record.clone());
        Ok(record)
    }

    /// Signer roles that have not signed yet, in canonical order.
    pub fn missing_signers(&self) -> Vec<SignerType> {
        REQUIRED_SIGNERS
            .iter()
            .filter(|s| !self.signatures.contains_key(s.as_str()))
            .copied()
            .collect()
    }

    /// A set is fully signed when all three roles are present,
    /// approved, and endorse the payload hash.
    pub fn is_fully_signed(&self) -> bool {
        REQUIRED_SIGNERS.iter().all(|s| {
            self.signatures.get(s.as_str()).is_some_and(|sig| {
                sig.status == SignatureStatus::Approved
                    && sig.signed_data_hash == self.payload_hash
            })
        })
    }

    /// All collected signatures, in canonical signer order.
    pub fn signatures(&self) -> Vec<SignatureRecord> {
        REQUIRED_SIGNERS
            .iter()
            .filter_map(|s| self.signatures.get(s.as_str()).cloned())
            .collect()
    }

    /// Emits the approval proof, or `signatures_incomplete` naming the
    /// absent roles.
    pub fn approval_proof(&self) -> Result<ApprovalProof, LedgerError> {
        if !self.is_fully_signed() {
            return Err(LedgerError::SignaturesIncomplete {
                missing: self.missing_signers(),
            });
        }

        let timestamp = utc_now_iso();
        let signatures = self.signatures();
        let proof_body = json!({
            "signatures": signatures,
            "timestamp": timestamp,
            "verified": true,
        });

        Ok(ApprovalProof {
            proof_hash: hashing::hash_value(&proof_body),
            signature_hashes: signatures.into_iter().map(|s| s.signature_hash).collect(),
            timestamp,
        })
    }
}

/// Deterministic signature derivation:
/// `SHA256(canonical_json({signer_type, signer_key, data_hash, timestamp}))`.
pub fn derive_signature_hash(
    signer_type: SignerType,
    signer_key: &str,
    data_hash: &HexHash,
    timestamp: &str,
) -> HexHash {
    let body = json!({
        "signer_type": signer_type.as_str(),
        "signer_key": signer_key,
        "data_hash": data_hash.as_str(),
        "timestamp": timestamp,
    });
    hashing::hash_value(&body)
}

/// Re-verifies a stored signature against an expected payload hash and
/// the configured authority keys.
pub fn verify_signature(
    authorized: &SignerKeys,
    signature: &SignatureRecord,
    expected_data_hash: &HexHash,
) -> bool {
    if &signature.signed_data_hash != expected_data_hash {
        return false;
    }
    if authorized.key_for(signature.signer_type) != signature.signer_key {
        return false;
    }
    if signature.status != SignatureStatus::Approved {
        return false;
    }

    let expected = derive_signature_hash(
        signature.signer_type,
        &signature.signer_key,
        &signature.signed_data_hash,
        &signature.created_at,
    );
    signature.signature_hash == expected
}
