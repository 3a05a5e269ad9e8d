//! # depot-catalog
//!
//! Derived catalog and manifest artifacts for a software depot, and the
//! safety-gated workflow that mutates the packages they are built from.
//!
//! ## Flow
//!
//! ```text
//! PackageCoordinator::update
//!   └─ CatalogBuilder::generate   (catalog_lock_<name>, retry after 10 s)
//!        └─ schedules manifest.generate (delay 1 s)
//!             └─ ManifestBuilder::generate (manifest_lock_<name>, retry after 5 s)
//! ```
//!
//! Builders never wait on a lease: a contended rebuild is rescheduled through
//! the [`DeferredScheduler`](depot_core::scheduler::DeferredScheduler) and the
//! call returns. [`RebuildWorker`] executes those scheduled calls.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use depot_catalog::{PackageChanges, PackageCoordinator, PipelineContext};
//! use depot_core::prelude::*;
//!
//! # async fn run() -> depot_catalog::Result<()> {
//! let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
//! let ctx = PipelineContext::storage_backed(
//!     backend,
//!     Arc::new(InMemoryScheduler::new()),
//!     Arc::new(InMemoryCache::new()),
//!     PipelineConfig::from_env()?,
//! );
//! let coordinator = PackageCoordinator::new(ctx);
//! coordinator
//!     .update(
//!         "admin@example.com",
//!         "firefox-1.0.dmg",
//!         PackageChanges::new().with_catalogs(["unstable", "testing"]),
//!         false,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod context;
pub mod coordinator;
pub mod eligibility;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod package;
pub mod retry;
pub mod worker;

pub use catalog::{Catalog, CatalogBuilder};
pub use context::PipelineContext;
pub use coordinator::{PackageChanges, PackageCoordinator, UpdateOutcome};
pub use eligibility::{CatalogEligibility, TrackEligibility};
pub use error::{ErrorKind, PipelineError, Result, ValidationError};
pub use manifest::{Manifest, ManifestBuilder};
pub use package::{ModificationState, PackageDocument, PackageInfo};
pub use retry::{Artifact, GenerateOutcome, RetryPolicy};
pub use worker::{RebuildWorker, WorkerReport};
