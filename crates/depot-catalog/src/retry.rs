//! Lease gating and deferred retries for artifact rebuilds.
//!
//! A rebuild never waits on its lease. When the lease is held elsewhere the
//! gate schedules a fresh invocation after the artifact's backoff and returns;
//! the lease is never held while a retry is queued.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use depot_core::clock::Clock;
use depot_core::lock::NamedLock;
use depot_core::scheduler::{DeferredCall, DeferredScheduler, ScheduleOptions};
use serde_json::json;

use crate::error::{PipelineError, Result};
use crate::metrics;

/// Timestamp layout used in dedup keys.
pub const DEDUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%6f";

/// A derived artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// Catalog rebuilds.
    Catalog,
    /// Manifest rebuilds.
    Manifest,
}

impl Artifact {
    /// Label used in metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Manifest => "manifest",
        }
    }

    /// Deferred function name handled by the rebuild worker.
    #[must_use]
    pub const fn function(self) -> &'static str {
        match self {
            Self::Catalog => "catalog.generate",
            Self::Manifest => "manifest.generate",
        }
    }

    /// Lease name guarding rebuilds of `name`.
    #[must_use]
    pub fn lock_name(self, name: &str) -> String {
        format!("{}_lock_{name}", self.as_str())
    }

    /// Dedup key for a deferred rebuild of `name` scheduled at `at`.
    #[must_use]
    pub fn dedup_key(self, name: &str, at: DateTime<Utc>) -> String {
        format!(
            "create-{}-{name}-{}",
            self.as_str(),
            at.format(DEDUP_TIMESTAMP_FORMAT)
        )
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-delay retry policy for contended rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retries forever after `delay`.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Caps the total number of attempts (including the first).
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff between attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Attempt cap, if any.
    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Number of the attempt to schedule after `attempt` contended, or `None`
    /// when the cap is reached.
    #[must_use]
    pub fn next_attempt(&self, attempt: u32) -> Option<u32> {
        match self.max_attempts {
            Some(max) if attempt >= max => None,
            _ => Some(attempt.saturating_add(1)),
        }
    }
}

/// What a `generate` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// A delayed invocation was scheduled instead of running now.
    Deferred {
        /// Dedup key of the scheduled call.
        dedup_key: String,
        /// Requested delay.
        delay: Duration,
    },
    /// The lease was held elsewhere; a retry was scheduled.
    Contended {
        /// Dedup key of the retry.
        dedup_key: String,
        /// Backoff before the retry.
        retry_in: Duration,
    },
    /// The artifact was rebuilt.
    Rebuilt {
        /// Members included in the artifact.
        package_count: usize,
    },
}

/// Schedules `artifact.generate(name)` after `delay`.
///
/// # Errors
///
/// Returns an error if the scheduler rejects the call.
pub(crate) async fn schedule_generate(
    scheduler: &dyn DeferredScheduler,
    clock: &dyn Clock,
    artifact: Artifact,
    name: &str,
    delay: Duration,
    attempt: u32,
) -> Result<String> {
    let dedup_key = artifact.dedup_key(name, clock.now());
    let call = DeferredCall::new(
        artifact.function(),
        json!({ "name": name, "attempt": attempt }),
    );
    let result = scheduler
        .schedule(
            call,
            ScheduleOptions::new()
                .with_dedup_key(dedup_key.clone())
                .with_delay(delay),
        )
        .await?;
    tracing::debug!(
        artifact = artifact.as_str(),
        artifact_name = name,
        dedup_key = %dedup_key,
        delay_secs = delay.as_secs_f64(),
        task_id = result.task_id(),
        scheduled = result.is_scheduled(),
        "deferred rebuild"
    );
    Ok(dedup_key)
}

/// Runs rebuild bodies under the artifact's lease.
#[derive(Clone)]
pub(crate) struct RebuildGate {
    artifact: Artifact,
    locks: Arc<dyn NamedLock>,
    scheduler: Arc<dyn DeferredScheduler>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RebuildGate {
    pub(crate) fn new(
        artifact: Artifact,
        locks: Arc<dyn NamedLock>,
        scheduler: Arc<dyn DeferredScheduler>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            artifact,
            locks,
            scheduler,
            clock,
            policy,
        }
    }

    pub(crate) fn scheduler(&self) -> &dyn DeferredScheduler {
        self.scheduler.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Schedules a delayed self-invocation.
    pub(crate) async fn defer(
        &self,
        name: &str,
        delay: Duration,
        attempt: u32,
    ) -> Result<GenerateOutcome> {
        let dedup_key = schedule_generate(
            self.scheduler.as_ref(),
            self.clock.as_ref(),
            self.artifact,
            name,
            delay,
            attempt,
        )
        .await?;
        metrics::record_rebuild(self.artifact, metrics::OUTCOME_DEFERRED);
        Ok(GenerateOutcome::Deferred { dedup_key, delay })
    }

    /// Runs `body` under the lease for `name`, or schedules a retry.
    ///
    /// The lease is released on every path. A release failure is reported
    /// only when the body itself succeeded.
    pub(crate) async fn run<F, Fut>(&self, name: &str, attempt: u32, body: F) -> Result<GenerateOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<usize>> + Send,
    {
        let lock_name = self.artifact.lock_name(name);
        let Some(lease) = self.locks.acquire(&lock_name, Duration::ZERO).await? else {
            metrics::record_lock_contention(self.artifact);
            let Some(next) = self.policy.next_attempt(attempt) else {
                tracing::warn!(
                    artifact = self.artifact.as_str(),
                    artifact_name = name,
                    attempt,
                    "retry attempts exhausted"
                );
                metrics::record_rebuild(self.artifact, metrics::OUTCOME_EXHAUSTED);
                return Err(PipelineError::contention(lock_name));
            };
            let retry_in = self.policy.delay();
            let dedup_key = schedule_generate(
                self.scheduler.as_ref(),
                self.clock.as_ref(),
                self.artifact,
                name,
                retry_in,
                next,
            )
            .await?;
            tracing::debug!(
                artifact = self.artifact.as_str(),
                artifact_name = name,
                attempt,
                "lease contended, retry scheduled"
            );
            metrics::record_rebuild(self.artifact, metrics::OUTCOME_CONTENDED);
            return Ok(GenerateOutcome::Contended { dedup_key, retry_in });
        };

        let started = Instant::now();
        let result = body().await;
        let released = self.locks.release(lease).await;

        match (result, released) {
            (Ok(package_count), Ok(())) => {
                metrics::record_rebuild(self.artifact, metrics::OUTCOME_REBUILT);
                metrics::record_rebuild_duration(self.artifact, started.elapsed().as_secs_f64());
                Ok(GenerateOutcome::Rebuilt { package_count })
            }
            (Ok(_), Err(e)) => {
                tracing::warn!(lease = %lock_name, error = %e, "lease release failed");
                metrics::record_rebuild(self.artifact, metrics::OUTCOME_FAILED);
                Err(e.into())
            }
            (Err(e), released) => {
                if let Err(release_err) = released {
                    tracing::warn!(lease = %lock_name, error = %release_err, "lease release failed");
                }
                metrics::record_rebuild(self.artifact, metrics::OUTCOME_FAILED);
                Err(e)
            }
        }
    }
}
