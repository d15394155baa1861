//! Per-sheet lifecycle state machine.
//!
//! Every answer sheet moves through the pipeline as a sequence of
//! commands, each of which (in order): checks the transition table,
//! checks idempotency against the stage hash stored on the sheet,
//! appends exactly one block, commits the block and its relational
//! rows in one store transaction, writes an audit entry, and updates
//! the sheet's status.
//!
//! The [`LifecycleMachine`] owns the wiring (engine, store, audit
//! logger, signer keys, providers); commands take a per-sheet lock
//! from a striped map so work on unrelated sheets never serializes,
//! while events for one sheet stay strictly ordered.

pub mod approve;
pub mod evaluate;
pub mod keys;
pub mod locks;
pub mod machine;
pub mod quality;
pub mod status;

pub use approve::{RecheckInput, ResolveRequest, SignerSubmission, VerifyRequest};
pub use evaluate::EvaluateRequest;
pub use keys::{KeyApproveRequest, KeyVerifyRequest, PaperRequest};
pub use locks::SheetLocks;
pub use machine::{
    BubbleRequest, LifecycleMachine, ResultRequest, ScanRequest, ScoreRequest, StageOutcome,
};
pub use quality::{QualityDecision, QualityReport, ReviewRequest};
pub use status::{Command, allowed, expected_states};
