//! Explicit transition table for lifecycle commands.
//!
//! Every command names its admissible pre-states here; nothing else in
//! the crate checks `Sheet::status` directly. Refusing a transition is
//! a pure function of `(current_state, command)`, so the table is the
//! single place to read or change the machine's shape.

use crate::types::SheetStatus;

/// The lifecycle commands a sheet can receive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    CreateScan,
    AssessQuality,
    ReviewQuality,
    Reconstruct,
    CreateBubble,
    CreateScore,
    Evaluate,
    CreateVerify,
    CommitResult,
    RequestRecheck,
}

/// Whether `command` may run on a sheet in `status`.
///
/// `CreateScan` is absent: it creates the sheet and has no pre-state.
pub fn allowed(status: SheetStatus, command: Command) -> bool {
    use Command::*;
    use SheetStatus::*;

    match command {
        CreateScan => false,
        AssessQuality => matches!(status, Uploaded | Scanned),
        // Human review acts on sheets the quality gate flagged or
        // rejected.
        ReviewQuality => matches!(status, QualityAssessed | QualityRejected),
        Reconstruct => matches!(status, QualityRejected),
        CreateBubble => matches!(status, QualityAssessed | ReconstructedApproved),
        CreateScore => matches!(status, BubbleDetected),
        // Evaluation is computed after scoring and does not move the
        // sheet; verification still gates the result.
        Evaluate => matches!(status, Scored),
        CreateVerify => matches!(status, Scored),
        CommitResult => matches!(status, Verified),
        RequestRecheck => matches!(status, Completed),
    }
}

/// Human-readable pre-state description for error messages.
pub fn expected_states(command: Command) -> &'static str {
    use Command::*;
    match command {
        CreateScan => "no existing sheet",
        AssessQuality => "'scanned'",
        ReviewQuality => "'quality_assessed' or 'quality_rejected'",
        Reconstruct => "'quality_rejected' with a reconstruction flag",
        CreateBubble => "'quality_assessed' or 'reconstructed_approved'",
        CreateScore => "'bubble_detected'",
        Evaluate => "'scored'",
        CreateVerify => "'scored'",
        CommitResult => "'verified'",
        RequestRecheck => "'completed'",
    }
}
