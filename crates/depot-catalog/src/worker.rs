//! Dispatch of deferred rebuild calls.
//!
//! The scheduler hands back [`DeferredCall`]s by function name. The worker
//! resolves `catalog.generate` and `manifest.generate` to the builders and
//! runs them immediately; the scheduling delay has already elapsed.

use std::time::Duration;

use depot_core::observability::pipeline_span;
use depot_core::scheduler::{DeferredCall, InMemoryScheduler};
use serde::Deserialize;
use tracing::Instrument;

use crate::catalog::CatalogBuilder;
use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::manifest::ManifestBuilder;
use crate::retry::{Artifact, GenerateOutcome};

#[derive(Debug, Deserialize)]
struct GenerateArgs {
    name: String,
    #[serde(default = "first_attempt")]
    attempt: u32,
}

const fn first_attempt() -> u32 {
    1
}

/// Counts from one [`RebuildWorker::run_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Calls that completed (rebuilt, deferred, or contended and rescheduled).
    pub completed: usize,
    /// Calls that returned an error.
    pub failed: usize,
}

/// Executes deferred rebuild calls.
#[derive(Debug, Clone)]
pub struct RebuildWorker {
    catalogs: CatalogBuilder,
    manifests: ManifestBuilder,
}

impl RebuildWorker {
    /// Creates a worker over `ctx`.
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            catalogs: CatalogBuilder::new(ctx.clone()),
            manifests: ManifestBuilder::new(ctx),
        }
    }

    /// Runs one deferred call.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for unknown functions or malformed arguments, and
    /// otherwise whatever the builder returns.
    pub async fn dispatch(&self, call: &DeferredCall) -> Result<GenerateOutcome> {
        let artifact = match call.function.as_str() {
            f if f == Artifact::Catalog.function() => Artifact::Catalog,
            f if f == Artifact::Manifest.function() => Artifact::Manifest,
            other => {
                return Err(PipelineError::Store(depot_core::Error::InvalidInput(
                    format!("unknown deferred function {other}"),
                )));
            }
        };
        let args: GenerateArgs = serde_json::from_value(call.args.clone()).map_err(|e| {
            PipelineError::Store(depot_core::Error::InvalidInput(format!(
                "bad arguments for {}: {e}",
                call.function
            )))
        })?;

        let span = pipeline_span(&call.function, &args.name);
        match artifact {
            Artifact::Catalog => {
                self.catalogs
                    .generate_attempt(&args.name, Duration::ZERO, args.attempt)
                    .instrument(span)
                    .await
            }
            Artifact::Manifest => {
                self.manifests
                    .generate_attempt(&args.name, Duration::ZERO, args.attempt)
                    .instrument(span)
                    .await
            }
        }
    }

    /// Runs every call queued on `queue` when the pass starts.
    ///
    /// Calls scheduled during the pass (manifest triggers, retries) stay queued
    /// for the next pass. Failures are logged and counted, not propagated.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself cannot be read.
    pub async fn run_pending(&self, queue: &InMemoryScheduler) -> Result<WorkerReport> {
        let batch = queue.drain()?;
        let mut report = WorkerReport::default();
        for task in batch {
            match self.dispatch(&task.call).await {
                Ok(outcome) => {
                    tracing::debug!(task_id = %task.task_id, function = %task.call.function, ?outcome, "deferred call completed");
                    report.completed += 1;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.task_id, function = %task.call.function, error = %e, "deferred call failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
