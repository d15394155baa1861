//! The append-only ledger engine.
//!
//! This module owns the in-memory chain and the rules for growing and
//! validating it:
//!
//! - [`LedgerEngine`] appends blocks under a single writer lock,
//!   mining each one to the configured difficulty and persisting it
//!   through a [`BlockSink`] inside the same critical section,
//! - full-chain validation re-derives every hash and checks linkage,
//! - queries serve blocks by index, sheet, or type from read-only
//!   snapshots that never contend with the writer.

pub mod engine;

pub use engine::{ChainStats, InclusionProof, LedgerEngine, ValidationReport};

use crate::types::Block;

/// Durable destination for freshly mined blocks.
///
/// The engine calls this while still holding the append lock, so the
/// store never contains a block whose predecessor is absent. A failed
/// persist aborts the append: the in-memory chain is left untouched
/// and the caller sees `persistence_failed`.
pub trait BlockSink: Send + Sync {
    fn persist_block(&self, block: &Block) -> Result<(), String>;
}

impl<T: BlockSink + ?Sized> BlockSink for std::sync::Arc<T> {
    fn persist_block(&self, block: &Block) -> Result<(), String> {
        (**self).persist_block(block)
    }
}

/// Sink that drops blocks on the floor.
///
/// Useful for tests and tooling that only exercise in-memory chain
/// behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl BlockSink for NullSink {
    fn persist_block(&self, _block: &Block) -> Result<(), String> {
        Ok(())
    }
}
