//! Prometheus instrumentation for the ledger.
//!
//! The core stays transport-free: this module only owns the registry
//! and the gauges/counters/histograms the engine and lifecycle update.
//! Whoever embeds the ledger decides how to expose them; the API
//! gateway serves [`MetricsRegistry::gather_text`] on its `/metrics`
//! route.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
    exponential_buckets, register_histogram_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry,
};

/// Registry plus the ledger's metric handles.
///
/// Cheap to clone (every handle is reference-counted); share one
/// instance between the lifecycle machine and the exporter.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    /// Wall time spent mining a single block.
    pub block_mining_seconds: Histogram,
    /// Blocks appended since startup.
    pub blocks_appended: IntCounter,
    /// Audit log entries written since startup.
    pub audit_entries: IntCounter,
    /// Chain or audit integrity failures observed.
    pub integrity_violations: IntCounter,
    /// Current chain length, genesis included.
    pub chain_length: IntGauge,
}

impl MetricsRegistry {
    /// Creates the registry and registers every ledger metric.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("omr".to_string()), None)?;

        // Mining at the default difficulty lands in the low
        // milliseconds; geometric buckets from 0.5 ms to ~8 s cover
        // both that and badly tuned difficulties.
        let mining_buckets = exponential_buckets(0.0005, 4.0, 8)?;
        let block_mining_seconds = register_histogram_with_registry!(
            HistogramOpts::new(
                "ledger_block_mining_seconds",
                "Wall time spent mining a single block",
            )
            .buckets(mining_buckets),
            registry
        )?;

        let blocks_appended = register_int_counter_with_registry!(
            "ledger_blocks_appended_total",
            "Blocks appended to the chain since startup",
            registry
        )?;

        let audit_entries = register_int_counter_with_registry!(
            "ledger_audit_entries_total",
            "Audit log entries written since startup",
            registry
        )?;

        let integrity_violations = register_int_counter_with_registry!(
            "ledger_integrity_violations_total",
            "Chain or audit integrity failures observed",
            registry
        )?;

        let chain_length = register_int_gauge_with_registry!(
            "ledger_chain_length",
            "Current number of blocks in the chain, genesis included",
            registry
        )?;

        Ok(Self {
            registry,
            block_mining_seconds,
            blocks_appended,
            audit_entries,
            integrity_violations,
            chain_length,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        match TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
            Err(e) => {
                tracing::error!(error = %e, "metrics encoding failed");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_once() {
        let metrics = MetricsRegistry::new().expect("registry builds");
        metrics.block_mining_seconds.observe(0.002);
        metrics.blocks_appended.inc();
        metrics.audit_entries.inc();
        metrics.integrity_violations.inc();
        metrics.chain_length.set(7);

        let text = metrics.gather_text();
        for name in [
            "ledger_block_mining_seconds",
            "ledger_blocks_appended_total",
            "ledger_audit_entries_total",
            "ledger_integrity_violations_total",
            "ledger_chain_length",
        ] {
            assert!(text.contains(name), "missing metric {name}");
        }
    }

    #[test]
    fn gauge_tracks_latest_value() {
        let metrics = MetricsRegistry::new().expect("registry builds");
        metrics.chain_length.set(3);
        metrics.chain_length.set(12);
        assert_eq!(metrics.chain_length.get(), 12);
    }

    #[test]
    fn registries_are_independent() {
        // Each instance carries its own registry, so parallel tests
        // and restarts never collide on metric names.
        let a = MetricsRegistry::new().expect("first registry");
        let b = MetricsRegistry::new().expect("second registry");
        a.blocks_appended.inc();
        assert_eq!(b.blocks_appended.get(), 0);
    }
}
