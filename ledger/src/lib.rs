//! Ledger library crate.
//!
//! This crate provides the core of the tamper-evident evaluation
//! ledger for OMR answer-sheet grading:
//!
//! - strongly-typed domain types (`types`),
//! - canonical hashing, Merkle trees, and the ZKP seam (`hashing`),
//! - the append-only chain engine with proof-of-work markers
//!   (`chain`),
//! - the per-sheet lifecycle state machine (`lifecycle`),
//! - the three-party multi-signature engine (`signing`),
//! - answer-key validation and mark tallying (`evaluation`),
//! - SQLite persistence with replay-on-startup (`store`),
//! - the per-sheet JSON audit log (`audit`),
//! - external AI and object-store adapters (`providers`),
//! - Prometheus metric handles (`metrics`; exposition is left to the
//!   embedding binary),
//! - and a top-level node configuration (`config`).
//!
//! Higher-level binaries (the API gateway) compose these pieces into
//! a running evaluation service.

pub mod audit;
pub mod chain;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod hashing;
pub mod lifecycle;
pub mod metrics;
pub mod providers;
pub mod signing;
pub mod store;
pub mod types;

// Re-export top-level configuration types.
pub use config::{
    AiClientConfig, ChainParams, LedgerConfig, MetricsConfig, RetryPolicy, SignerKeys,
};

// Re-export the engine and its read-side query types.
pub use chain::{
    BlockSink, ChainStats, InclusionProof, LedgerEngine, NullSink, ValidationReport,
};

// Re-export the lifecycle machine and command inputs.
pub use lifecycle::{
    BubbleRequest, EvaluateRequest, KeyApproveRequest, KeyVerifyRequest, LifecycleMachine,
    PaperRequest, QualityDecision, QualityReport, RecheckInput, ResolveRequest, ResultRequest,
    ReviewRequest, ScanRequest, ScoreRequest, SignerSubmission, StageOutcome, VerifyRequest,
};

// Re-export the multi-signature engine.
pub use signing::{ApprovalProof, SignatureSet};

// Re-export persistence backends.
pub use store::{SqliteStore, StoreError};

// Re-export the audit logger.
pub use audit::{AuditLogEntry, AuditLogFile, AuditLogger};

// Re-export provider interfaces and implementations.
pub use providers::{
    AiError, AiProvider, AiResponse, FsObjectStore, HttpAiProvider, ObjectStore, RetryingProvider,
};

// Re-export the metrics registry.
pub use metrics::MetricsRegistry;

// Re-export the error taxonomy.
pub use error::LedgerError;

// Re-export domain types at the crate root for convenience.
pub use types::*;

/// Type alias for the default AI provider stack used by a "typical"
/// node: the HTTP client wrapped in retry/backoff with mock fallback.
pub type DefaultAiProvider = RetryingProvider<HttpAiProvider>;

/// Type alias for the default ledger engine, persisting through the
/// shared SQLite store.
pub type DefaultLedgerEngine = LedgerEngine<std::sync::Arc<SqliteStore>>;
