//! # depot-core
//!
//! Shared primitives for the depot package pipeline.
//!
//! - **Storage**: versioned object storage with CAS preconditions
//! - **Entity store**: typed records with get-or-create and filtered scans
//! - **Named locks**: storage-backed leases with TTL takeover
//! - **Scheduling**: deferred, deduplicated function calls
//! - **Cache, audit, clock**: the remaining collaborators the pipeline talks to
//! - **Configuration and logging**: `DEPOT_*` settings and `tracing` setup
//!
//! ## Example
//!
//! ```rust
//! use depot_core::prelude::*;
//! use std::sync::Arc;
//!
//! let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
//! let store = EntityStore::new(backend.clone());
//! let lock = StorageLock::new(backend);
//! # let _ = (store, lock);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod lock;
pub mod observability;
pub mod scheduler;
pub mod storage;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::audit::{AuditAction, AuditLog, InMemoryAuditLog, PackageAuditEntry, StorageAuditLog};
    pub use crate::cache::{CacheLayer, InMemoryCache};
    pub use crate::clock::{Clock, FixedClock, SystemClock};
    pub use crate::config::PipelineConfig;
    pub use crate::entity::{Entity, EntityStore};
    pub use crate::error::{Error, Result};
    pub use crate::lock::{Lease, NamedLock, StorageLock};
    pub use crate::observability::{LogFormat, init_logging, pipeline_span};
    pub use crate::scheduler::{
        DeferredCall, DeferredScheduler, InMemoryScheduler, ScheduleOptions, ScheduleResult,
    };
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}
