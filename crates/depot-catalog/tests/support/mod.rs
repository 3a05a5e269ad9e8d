//! Shared harness and test doubles for pipeline integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};

use depot_catalog::package::{KEY_NAME, KEY_VERSION};
use depot_catalog::{PackageInfo, PipelineContext};
use depot_core::audit::InMemoryAuditLog;
use depot_core::cache::InMemoryCache;
use depot_core::clock::FixedClock;
use depot_core::config::PipelineConfig;
use depot_core::entity::{Entity, EntityStore};
use depot_core::lock::{Lease, NamedLock, StorageLock};
use depot_core::scheduler::InMemoryScheduler;
use depot_core::storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
use depot_core::{Error as CoreError, Result as CoreResult};

// ============================================================================
// FailingBackend - storage failure injection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Get,
    Put,
    List,
}

/// Backend wrapper that fails operations under configured prefixes.
#[derive(Debug, Default)]
pub struct FailingBackend {
    inner: MemoryBackend,
    failures: Mutex<HashSet<(Op, String)>>,
    fail_all_writes: AtomicBool,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every put whose path starts with `prefix`.
    pub fn fail_puts_under(&self, prefix: &str) {
        self.inject(Op::Put, prefix);
    }

    /// Fails every get whose path starts with `prefix`.
    pub fn fail_gets_under(&self, prefix: &str) {
        self.inject(Op::Get, prefix);
    }

    /// Fails every list whose prefix starts with `prefix`.
    pub fn fail_lists_under(&self, prefix: &str) {
        self.inject(Op::List, prefix);
    }

    /// Fails every put, lease writes included.
    pub fn fail_all_writes(&self) {
        self.fail_all_writes.store(true, Ordering::SeqCst);
    }

    fn inject(&self, op: Op, prefix: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((op, prefix.to_string()));
    }

    fn check(&self, op: Op, path: &str) -> CoreResult<()> {
        let failing = (op == Op::Put && self.fail_all_writes.load(Ordering::SeqCst))
            || self
                .failures
                .lock()
                .unwrap()
                .iter()
                .any(|(o, p)| *o == op && path.starts_with(p.as_str()));
        if failing {
            return Err(CoreError::storage(format!("injected {op:?} failure: {path}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn get(&self, path: &str) -> CoreResult<Bytes> {
        self.check(Op::Get, path)?;
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> CoreResult<WriteResult> {
        self.check(Op::Put, path)?;
        self.inner.put(path, data, precondition).await
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMeta>> {
        self.check(Op::List, prefix)?;
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> CoreResult<Option<ObjectMeta>> {
        self.inner.head(path).await
    }
}

// ============================================================================
// RecordingLock - lease acquisition log
// ============================================================================

/// Storage lock that records every successful acquisition.
#[derive(Debug)]
pub struct RecordingLock {
    inner: StorageLock,
    acquired: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    failing_releases: Mutex<Vec<String>>,
}

impl RecordingLock {
    pub fn new(inner: StorageLock) -> Self {
        Self {
            inner,
            acquired: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            failing_releases: Mutex::new(Vec::new()),
        }
    }

    /// Makes releases of leases named with `prefix` fail, leaving them held
    /// until their TTL runs out.
    pub fn fail_releases_of(&self, prefix: &str) {
        self.failing_releases.lock().unwrap().push(prefix.to_string());
    }

    pub fn acquired(&self) -> Vec<String> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    /// Acquired catalog lease names, in order, with the prefix stripped.
    pub fn catalog_rebuilds(&self) -> Vec<String> {
        self.acquired()
            .into_iter()
            .filter_map(|n| n.strip_prefix("catalog_lock_").map(ToString::to_string))
            .collect()
    }
}

#[async_trait]
impl NamedLock for RecordingLock {
    async fn acquire(&self, name: &str, timeout: Duration) -> CoreResult<Option<Lease>> {
        let lease = self.inner.acquire(name, timeout).await?;
        if lease.is_some() {
            self.acquired.lock().unwrap().push(name.to_string());
        }
        Ok(lease)
    }

    async fn release(&self, lease: Lease) -> CoreResult<()> {
        self.released.lock().unwrap().push(lease.name().to_string());
        let failing = self
            .failing_releases
            .lock()
            .unwrap()
            .iter()
            .any(|p| lease.name().starts_with(p.as_str()));
        if failing {
            return Err(CoreError::storage(format!(
                "injected release failure: {}",
                lease.name()
            )));
        }
        self.inner.release(lease).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub backend: Arc<FailingBackend>,
    pub store: EntityStore,
    pub locks: Arc<RecordingLock>,
    pub scheduler: Arc<InMemoryScheduler>,
    pub cache: Arc<InMemoryCache>,
    pub audit: Arc<InMemoryAuditLog>,
    pub clock: Arc<FixedClock>,
    pub ctx: PipelineContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let backend = Arc::new(FailingBackend::new());
        let store = EntityStore::new(backend.clone());
        let locks = Arc::new(RecordingLock::new(StorageLock::new(backend.clone())));
        let scheduler = Arc::new(InMemoryScheduler::new());
        let cache = Arc::new(InMemoryCache::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2010, 9, 2, 19, 30, 21).unwrap(),
        ));
        let ctx = PipelineContext::new(
            store.clone(),
            locks.clone(),
            scheduler.clone(),
            cache.clone(),
            audit.clone(),
            config,
        )
        .with_clock(clock.clone());

        Self {
            backend,
            store,
            locks,
            scheduler,
            cache,
            audit,
            clock,
            ctx,
        }
    }

    /// A second lock holder over the same storage, standing in for another process.
    pub fn rival(&self) -> StorageLock {
        StorageLock::new(self.backend.clone())
    }

    pub async fn put_package(&self, fixture: PackageFixture<'_>) -> PackageInfo {
        let mut pkg = PackageInfo::with_key(fixture.filename);
        pkg.name = fixture.name.to_string();
        pkg.catalogs = strings(fixture.catalogs);
        pkg.manifests = strings(fixture.manifests);
        pkg.install_types = strings(fixture.install_types);
        pkg.proposal_pending = fixture.proposal_pending;
        pkg.document.set(KEY_NAME, fixture.name);
        pkg.document.set(KEY_VERSION, fixture.version);
        pkg.document.set_catalogs(&pkg.catalogs.clone());
        if let Some(description) = fixture.description {
            pkg.document.set("description", description);
        }
        self.store.put(&pkg).await.expect("put package");
        pkg
    }

    pub async fn package(&self, filename: &str) -> Option<PackageInfo> {
        self.store
            .get_by_key::<PackageInfo>(filename)
            .await
            .expect("read package")
    }

    pub async fn object_count(&self, prefix: &str) -> usize {
        self.backend.list(prefix).await.expect("list").len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PackageFixture<'a> {
    pub filename: &'a str,
    pub name: &'a str,
    pub version: &'a str,
    pub catalogs: &'a [&'a str],
    pub manifests: &'a [&'a str],
    pub install_types: &'a [&'a str],
    pub proposal_pending: bool,
    pub description: Option<&'a str>,
}

impl<'a> PackageFixture<'a> {
    pub fn new(filename: &'a str, name: &'a str) -> Self {
        Self {
            filename,
            name,
            version: "1.0",
            catalogs: &[],
            manifests: &[],
            install_types: &[],
            proposal_pending: false,
            description: None,
        }
    }

    pub fn catalogs(mut self, catalogs: &'a [&'a str]) -> Self {
        self.catalogs = catalogs;
        self
    }

    pub fn manifests(mut self, manifests: &'a [&'a str]) -> Self {
        self.manifests = manifests;
        self
    }

    pub fn install_types(mut self, install_types: &'a [&'a str]) -> Self {
        self.install_types = install_types;
        self
    }

    pub fn version(mut self, version: &'a str) -> Self {
        self.version = version;
        self
    }

    pub fn description(mut self, description: &'a str) -> Self {
        self.description = Some(description);
        self
    }

    pub fn proposal_pending(mut self) -> Self {
        self.proposal_pending = true;
        self
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}
