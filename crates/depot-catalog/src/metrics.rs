//! Pipeline metrics.
//!
//! Counters and histograms for rebuilds, lease contention, and package updates.

use metrics::{counter, describe_counter, describe_histogram, histogram};

use crate::retry::Artifact;

// ============================================================================
// Rebuild Metrics
// ============================================================================

/// Rebuild attempts by artifact and outcome.
pub const REBUILD_TOTAL: &str = "depot_rebuild_total";

/// Lease contention events by artifact.
pub const LOCK_CONTENTION_TOTAL: &str = "depot_lock_contention_total";

/// Rebuild duration histogram.
pub const REBUILD_DURATION: &str = "depot_rebuild_duration_seconds";

/// Outcome label: artifact rebuilt.
pub const OUTCOME_REBUILT: &str = "rebuilt";
/// Outcome label: delayed invocation scheduled.
pub const OUTCOME_DEFERRED: &str = "deferred";
/// Outcome label: lease contended, retry scheduled.
pub const OUTCOME_CONTENDED: &str = "contended";
/// Outcome label: lease contended, no attempts left.
pub const OUTCOME_EXHAUSTED: &str = "exhausted";
/// Outcome label: rebuild failed.
pub const OUTCOME_FAILED: &str = "failed";

// ============================================================================
// Package Update Metrics
// ============================================================================

/// Package updates by outcome.
pub const PACKAGE_UPDATE_TOTAL: &str = "depot_package_update_total";

/// Outcome label: update applied.
pub const OUTCOME_APPLIED: &str = "applied";
/// Outcome label: update refused by validation.
pub const OUTCOME_REJECTED: &str = "rejected";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all pipeline metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(REBUILD_TOTAL, "Total artifact rebuild invocations by outcome");
    describe_counter!(LOCK_CONTENTION_TOTAL, "Total rebuild lease contention events");
    describe_histogram!(REBUILD_DURATION, "Duration of artifact rebuilds in seconds");
    describe_counter!(PACKAGE_UPDATE_TOTAL, "Total package updates by outcome");
}

/// Records a rebuild invocation.
pub fn record_rebuild(artifact: Artifact, outcome: &'static str) {
    counter!(REBUILD_TOTAL, "artifact" => artifact.as_str(), "outcome" => outcome).increment(1);
}

/// Records lease contention.
pub fn record_lock_contention(artifact: Artifact) {
    counter!(LOCK_CONTENTION_TOTAL, "artifact" => artifact.as_str()).increment(1);
}

/// Records rebuild duration.
pub fn record_rebuild_duration(artifact: Artifact, duration_secs: f64) {
    histogram!(REBUILD_DURATION, "artifact" => artifact.as_str()).record(duration_secs);
}

/// Records a package update outcome.
pub fn record_package_update(outcome: &'static str) {
    counter!(PACKAGE_UPDATE_TOTAL, "outcome" => outcome).increment(1);
}
