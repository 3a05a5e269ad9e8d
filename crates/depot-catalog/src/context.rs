//! Collaborators shared by the builders and the mutation coordinator.

use std::sync::Arc;

use depot_core::audit::{AuditLog, StorageAuditLog};
use depot_core::cache::CacheLayer;
use depot_core::clock::{Clock, SystemClock};
use depot_core::config::PipelineConfig;
use depot_core::entity::EntityStore;
use depot_core::lock::{NamedLock, StorageLock};
use depot_core::scheduler::DeferredScheduler;
use depot_core::storage::StorageBackend;

/// Handles to the external services the pipeline runs against.
#[derive(Clone)]
pub struct PipelineContext {
    /// Record store for packages, catalogs and manifests.
    pub store: EntityStore,
    /// Named lease provider.
    pub locks: Arc<dyn NamedLock>,
    /// Deferred-call scheduler.
    pub scheduler: Arc<dyn DeferredScheduler>,
    /// Artifact cache.
    pub cache: Arc<dyn CacheLayer>,
    /// Audit sink.
    pub audit: Arc<dyn AuditLog>,
    /// Time source for dedup keys and timestamps.
    pub clock: Arc<dyn Clock>,
    /// Immutable pipeline settings.
    pub config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// Creates a context from explicit collaborators, using the system clock.
    #[must_use]
    pub fn new(
        store: EntityStore,
        locks: Arc<dyn NamedLock>,
        scheduler: Arc<dyn DeferredScheduler>,
        cache: Arc<dyn CacheLayer>,
        audit: Arc<dyn AuditLog>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            locks,
            scheduler,
            cache,
            audit,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        }
    }

    /// Creates a context whose store, leases and audit trail share one backend.
    #[must_use]
    pub fn storage_backed(
        backend: Arc<dyn StorageBackend>,
        scheduler: Arc<dyn DeferredScheduler>,
        cache: Arc<dyn CacheLayer>,
        config: PipelineConfig,
    ) -> Self {
        let locks = StorageLock::new(backend.clone()).with_ttl(config.lease_ttl);
        Self::new(
            EntityStore::new(backend.clone()),
            Arc::new(locks),
            scheduler,
            cache,
            Arc::new(StorageAuditLog::new(backend)),
            config,
        )
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
