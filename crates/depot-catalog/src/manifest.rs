//! Manifest artifacts and their builder.
//!
//! A manifest maps `catalogs` to `[name, auxiliary]` and each install-type tag to
//! the names of member packages carrying that tag, in scan order.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use depot_core::entity::Entity;
use serde::{Deserialize, Serialize};

use crate::context::PipelineContext;
use crate::error::Result;
use crate::package::PackageInfo;
use crate::retry::{Artifact, GenerateOutcome, RebuildGate, RetryPolicy};

/// Body key listing the catalogs a manifest reads from.
pub const CATALOGS_KEY: &str = "catalogs";

/// Manifest body: key to ordered list of names.
pub type ManifestBody = BTreeMap<String, Vec<String>>;

/// A stored manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest name; usually a track.
    pub name: String,
    /// Generated body.
    #[serde(default)]
    pub body: ManifestBody,
    /// When the body was last rebuilt.
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl Entity for Manifest {
    const KIND: &'static str = "manifest";

    fn key(&self) -> &str {
        &self.name
    }

    fn with_key(key: &str) -> Self {
        Self {
            name: key.to_string(),
            ..Self::default()
        }
    }
}

/// Builds a manifest body from member packages.
#[must_use]
pub fn build_body(name: &str, auxiliary_catalog: &str, members: &[PackageInfo]) -> ManifestBody {
    let mut body = ManifestBody::new();
    body.insert(
        CATALOGS_KEY.to_string(),
        vec![name.to_string(), auxiliary_catalog.to_string()],
    );
    for package in members {
        for tag in &package.install_types {
            body.entry(tag.clone())
                .or_default()
                .push(package.package_name().to_string());
        }
    }
    body
}

/// Rebuilds manifests.
#[derive(Clone)]
pub struct ManifestBuilder {
    ctx: PipelineContext,
    gate: RebuildGate,
}

impl std::fmt::Debug for ManifestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestBuilder").finish_non_exhaustive()
    }
}

impl ManifestBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        let policy = RetryPolicy::fixed(ctx.config.manifest_retry_delay)
            .with_max_attempts(ctx.config.retry_max_attempts);
        let gate = RebuildGate::new(
            Artifact::Manifest,
            ctx.locks.clone(),
            ctx.scheduler.clone(),
            ctx.clock.clone(),
            policy,
        );
        Self { ctx, gate }
    }

    /// Cache key holding the manifest body.
    #[must_use]
    pub fn cache_key(name: &str) -> String {
        format!("manifest/{name}/body")
    }

    /// Rebuilds manifest `name`, or schedules a rebuild after `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error when a store or cache call fails, or a bounded retry
    /// policy runs out of attempts.
    pub async fn generate(&self, name: &str, delay: Duration) -> Result<GenerateOutcome> {
        self.generate_attempt(name, delay, 1).await
    }

    /// [`generate`](Self::generate) with an explicit attempt number.
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate).
    #[tracing::instrument(skip_all, fields(manifest = %name, delay_secs = delay.as_secs(), attempt = attempt))]
    pub async fn generate_attempt(
        &self,
        name: &str,
        delay: Duration,
        attempt: u32,
    ) -> Result<GenerateOutcome> {
        if !delay.is_zero() {
            return self.gate.defer(name, delay, attempt).await;
        }
        self.gate.run(name, attempt, || self.rebuild(name)).await
    }

    async fn rebuild(&self, name: &str) -> Result<usize> {
        let members = self
            .ctx
            .store
            .scan::<PackageInfo, _>(|p| p.manifests.iter().any(|m| m == name))
            .await?;

        let mut manifest = self.ctx.store.get_or_create::<Manifest>(name).await?;
        manifest.body = build_body(name, &self.ctx.config.auxiliary_catalog, &members);
        manifest.generated_at = Some(self.ctx.clock.now());
        self.ctx.store.put(&manifest).await?;

        self.ctx.cache.invalidate(&Self::cache_key(name)).await?;

        tracing::info!(manifest = %name, packages = members.len(), "manifest rebuilt");
        Ok(members.len())
    }
}
