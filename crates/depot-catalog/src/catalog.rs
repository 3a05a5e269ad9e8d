//! Catalog artifacts and their builder.
//!
//! A catalog is the enveloped, newline-joined list of every member package's
//! serialized document. Rebuilding `stable` runs under `catalog_lock_stable`;
//! a successful rebuild invalidates the cached body and schedules the matching
//! manifest.

use std::time::Duration;

use chrono::{DateTime, Utc};
use depot_core::entity::Entity;
use serde::{Deserialize, Serialize};

use crate::context::PipelineContext;
use crate::error::Result;
use crate::package::PackageInfo;
use crate::retry::{Artifact, GenerateOutcome, RebuildGate, RetryPolicy, schedule_generate};

/// First line of every catalog body.
pub const CATALOG_HEADER: &str = r#"{"format":"depot-catalog","version":1}"#;

/// Wraps newline-joined member documents into a catalog body.
#[must_use]
pub fn envelope(joined: &str) -> String {
    format!("{CATALOG_HEADER}\n{joined}\n")
}

/// A stored catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Catalog name; usually a track.
    pub name: String,
    /// Enveloped body served to clients.
    #[serde(default)]
    pub body: String,
    /// Member package names in body order.
    #[serde(default)]
    pub package_names: Vec<String>,
    /// When the body was last rebuilt.
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl Entity for Catalog {
    const KIND: &'static str = "catalog";

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

/// Rebuilds catalogs.
#[derive(Clone)]
pub struct CatalogBuilder {
    ctx: PipelineContext,
    gate: RebuildGate,
}

impl std::fmt::Debug for CatalogBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogBuilder").finish_non_exhaustive()
    }
}

impl CatalogBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        let policy = RetryPolicy::fixed(ctx.config.catalog_retry_delay)
            .with_max_attempts(ctx.config.retry_max_attempts);
        let gate = RebuildGate::new(
            Artifact::Catalog,
            ctx.locks.clone(),
            ctx.scheduler.clone(),
            ctx.clock.clone(),
            policy,
        );
        Self { ctx, gate }
    }

    /// Cache key holding the catalog body.
    #[must_use]
    pub fn cache_key(name: &str) -> String {
        format!("catalog/{name}/body")
    }

    /// Rebuilds catalog `name`, or schedules a rebuild after `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error when a member cannot be serialized, a store or cache
    /// call fails, or a bounded retry policy runs out of attempts.
    pub async fn generate(&self, name: &str, delay: Duration) -> Result<GenerateOutcome> {
        self.generate_attempt(name, delay, 1).await
    }

    /// [`generate`](Self::generate) with an explicit attempt number.
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate).
    #[tracing::instrument(skip_all, fields(catalog = %name, delay_secs = delay.as_secs(), attempt = attempt))]
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
            .scan::<PackageInfo, _>(|p| p.catalogs.iter().any(|c| c == name))
            .await?;

        let mut documents = Vec::with_capacity(members.len());
        let mut package_names = Vec::with_capacity(members.len());
        for package in &members {
            documents.push(package.render()?);
            package_names.push(package.package_name().to_string());
        }

        let mut catalog = self.ctx.store.get_or_create::<Catalog>(name).await?;
        catalog.body = envelope(&documents.join("\n"));
        catalog.package_names = package_names;
        catalog.generated_at = Some(self.ctx.clock.now());
        self.ctx.store.put(&catalog).await?;

        self.ctx.cache.invalidate(&Self::cache_key(name)).await?;
        schedule_generate(
            self.gate.scheduler(),
            self.gate.clock(),
            Artifact::Manifest,
            name,
            self.ctx.config.manifest_trigger_delay,
            1,
        )
        .await?;

        tracing::info!(catalog = %name, packages = members.len(), "catalog rebuilt");
        Ok(members.len())
    }
}
