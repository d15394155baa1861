//! Top-level configuration for a ledger node.
//!
//! This module aggregates configuration for:
//!
//! - the chain itself (mining difficulty, attempt budget),
//! - the multi-signature authority keys,
//! - persistence (SQLite path),
//! - the audit log directory,
//! - the AI provider client (endpoint, timeout, retry policy),
//! - the object store root and result verification URL,
//! - the Prometheus metrics exporter.
//!
//! The goal is a single `LedgerConfig` struct that binaries can build
//! from defaults, files, or environment variables as needed.

use std::net::SocketAddr;
use std::time::Duration;

use crate::types::SignerType;

/// Chain parameters fixed at genesis.
#[derive(Clone, Debug)]
pub struct ChainParams {
    /// Number of leading zero hex digits a mined hash must carry.
    pub difficulty: u32,
    /// Upper bound on nonce attempts per block before the append
    /// fails with `mining_budget_exceeded`.
    pub mining_budget: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            difficulty: 4,
            mining_budget: 10_000_000,
        }
    }
}

/// Authorized keys for the three signer roles.
#[derive(Clone, Debug)]
pub struct SignerKeys {
    pub ai_verifier: String,
    pub human_verifier: String,
    pub admin_controller: String,
}

impl SignerKeys {
    /// Returns the authorized key for a signer role.
    pub fn key_for(&self, signer: SignerType) -> &str {
        match signer {
            SignerType::AiVerifier => &self.ai_verifier,
            SignerType::HumanVerifier => &self.human_verifier,
            SignerType::AdminController => &self.admin_controller,
        }
    }
}

impl Default for SignerKeys {
    fn default() -> Self {
        Self {
            ai_verifier: "ai-verifier-public-key".to_string(),
            human_verifier: "human-verifier-public-key".to_string(),
            admin_controller: "admin-controller-public-key".to_string(),
        }
    }
}

/// Retry policy for external AI calls.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * self.factor.pow(attempt)
    }
}

/// Configuration for the AI provider HTTP client.
#[derive(Clone, Debug)]
pub struct AiClientConfig {
    /// Base URL of the AI vision service, e.g. `"http://127.0.0.1:8090"`.
    pub base_url: String,
    /// Request timeout for AI calls.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Top-level configuration for a ledger node.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub chain: ChainParams,
    pub signers: SignerKeys,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Directory holding per-sheet audit log files.
    pub audit_log_dir: String,
    /// Root directory of the filesystem object store.
    pub object_store_root: String,
    /// Base of the public verification URL embedded in result QR codes.
    pub verify_url_base: String,
    pub ai_client: AiClientConfig,
    pub metrics: MetricsConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            chain: ChainParams::default(),
            signers: SignerKeys::default(),
            database_path: "data/omr_ledger.db".to_string(),
            audit_log_dir: "audit_logs".to_string(),
            object_store_root: "data/object_store".to_string(),
            verify_url_base: "/api/result".to_string(),
            ai_client: AiClientConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_difficulty_is_four() {
        assert_eq!(ChainParams::default().difficulty, 4);
    }

    #[test]
    fn retry_delays_grow_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn signer_keys_resolve_by_role() {
        let keys = SignerKeys::default();
        assert_eq!(keys.key_for(SignerType::AiVerifier), "ai-verifier-public-key");
        assert_eq!(
            keys.key_for(SignerType::AdminController),
            "admin-controller-public-key"
        );
    }
}
