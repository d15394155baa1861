//! Zero-knowledge proof seam.
//!
//! Result privacy is out of scope for the current system, but the
//! lifecycle reserves a place for it: a [`ZkpEngine`] produces a proof
//! for a data hash when a result is committed, and anyone can verify
//! the proof against the hash later. The shipped implementation,
//! [`HashCommitmentZkp`], is a hash-of-hashes commitment scheme, not a
//! real zero-knowledge construction; a SNARK/STARK backend can replace
//! it behind the same trait without touching the lifecycle.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::hashing::hash_str;
use crate::types::HexHash;

/// A generated proof, serializable for storage alongside results.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZkProof {
    /// Identifier of this proof instance.
    pub proof_id: String,
    /// The data hash the proof commits to.
    pub data_hash: HexHash,
    /// Commitment over the data hash and a random nonce.
    pub commitment: String,
    /// Random challenge bound into the response.
    pub challenge: String,
    /// Response hash tying commitment, challenge, and data together.
    pub response: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
}

/// Pluggable proof engine.
pub trait ZkpEngine: Send + Sync {
    /// Generates a proof of knowledge of `data_hash`.
    fn generate(&self, data_hash: &HexHash) -> ZkProof;

    /// Verifies `proof` against `data_hash`.
    fn verify(&self, proof: &ZkProof, data_hash: &HexHash) -> bool;
}

/// Hash-commitment placeholder implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashCommitmentZkp;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

impl ZkpEngine for HashCommitmentZkp {
    fn generate(&self, data_hash: &HexHash) -> ZkProof {
        let nonce = random_hex(32);
        let commitment = hash_str(&format!("{}:{nonce}", data_hash.as_str()))
            .as_str()
            .to_string();
        let challenge = random_hex(32);
        let response = hash_str(&format!("{commitment}:{challenge}:{}", data_hash.as_str()))
            .as_str()
            .to_string();

        ZkProof {
            proof_id: random_hex(16),
            data_hash: data_hash.clone(),
            commitment,
            challenge,
            response,
            created_at: crate::types::utc_now_iso(),
        }
    }

    fn verify(&self, proof: &ZkProof, data_hash: &HexHash) -> bool {
        if &proof.data_hash != data_hash {
            return false;
        }

        let expected = hash_str(&format!(
            "{}:{}:{}",
            proof.commitment,
            proof.challenge,
            data_hash.as_str()
        ));
        proof.response == expected.as_str()
    }
}
