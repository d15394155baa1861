//! Signature records for the multi-party approval scheme.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::HexHash;

/// The three signer roles that must approve a verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SignerType {
    #[serde(rename = "ai-verifier")]
    AiVerifier,
    #[serde(rename = "human-verifier")]
    HumanVerifier,
    #[serde(rename = "admin-controller")]
    AdminController,
}

/// All signer roles, in the order they are reported when missing.
pub const REQUIRED_SIGNERS: [SignerType; 3] = [
    SignerType::AiVerifier,
    SignerType::HumanVerifier,
    SignerType::AdminController,
];

impl SignerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerType::AiVerifier => "ai-verifier",
            SignerType::HumanVerifier => "human-verifier",
            SignerType::AdminController => "admin-controller",
        }
    }
}

impl fmt::Display for SignerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai-verifier" => Ok(SignerType::AiVerifier),
            "human-verifier" => Ok(SignerType::HumanVerifier),
            "admin-controller" => Ok(SignerType::AdminController),
            other => Err(format!("unknown signer type: {other}")),
        }
    }
}

/// Approval state of one signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    Pending,
    Approved,
    Rejected,
}

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureStatus::Pending => "pending",
            SignatureStatus::Approved => "approved",
            SignatureStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for SignatureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SignatureStatus::Pending),
            "approved" => Ok(SignatureStatus::Approved),
            "rejected" => Ok(SignatureStatus::Rejected),
            other => Err(format!("unknown signature status: {other}")),
        }
    }
}

/// One approval token.
///
/// `signature_hash` is derived deterministically from the signer role,
/// the signer key, the hash of the endorsed payload, and the creation
/// timestamp (see [`crate::signing`]); it is embedded into the verify
/// block alongside its peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub signature_id: String,
    pub signer_type: SignerType,
    pub signer_key: String,
    /// Canonical hash of the payload the signer endorsed.
    pub signed_data_hash: HexHash,
    /// Deterministic derivation binding signer and payload.
    pub signature_hash: HexHash,
    pub status: SignatureStatus,
    pub created_at: String,
    pub signed_at: Option<String>,
}
