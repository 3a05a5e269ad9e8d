//! Object storage underneath the entity store, lease lock and audit log.
//!
//! Every writer in the pipeline needs two things from storage: compare-and-set
//! writes keyed on an opaque version token, and prefix listing for scans.
//! That is the whole contract.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Condition a write must satisfy to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// The path must be empty.
    DoesNotExist,
    /// The stored object must carry this version.
    MatchesVersion(String),
    /// Always write.
    None,
}

/// Outcome of a write. A failed precondition is a result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The object was written.
    Success {
        /// Version of the written object.
        version: String,
    },
    /// The precondition did not hold; nothing was written.
    PreconditionFailed {
        /// Version currently stored, or an empty string when the path is empty.
        current_version: String,
    },
}

/// A listed or inspected object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object path.
    pub path: String,
    /// Opaque version token for [`WritePrecondition::MatchesVersion`].
    pub version: String,
}

/// Versioned object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an object. A missing path is [`Error::NotFound`].
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes `data` if `precondition` holds.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Objects under `prefix`, in an order that is stable for one call.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Metadata for `path`, if present.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

#[derive(Debug, Default)]
struct Objects {
    entries: BTreeMap<String, (u64, Bytes)>,
    next_version: u64,
}

/// Process-local backend. Lists in lexical path order.
///
/// Versions come from one counter shared by every path, so a token is never
/// reused, even for a path that is written again after being overwritten.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<Objects>>,
}

fn poisoned() -> Error {
    Error::Internal {
        message: "memory backend lock poisoned".into(),
    }
}

fn holds(precondition: &WritePrecondition, current: Option<u64>) -> bool {
    match (precondition, current) {
        (WritePrecondition::None, _) | (WritePrecondition::DoesNotExist, None) => true,
        (WritePrecondition::MatchesVersion(expected), Some(v)) => *expected == v.to_string(),
        _ => false,
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(|_| poisoned())?.entries.len())
    }

    /// Returns true when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .entries
            .get(path)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.entries.get(path).map(|(v, _)| *v);
        if !holds(&precondition, current) {
            return Ok(WriteResult::PreconditionFailed {
                current_version: current.map(|v| v.to_string()).unwrap_or_default(),
            });
        }

        objects.next_version += 1;
        let version = objects.next_version;
        objects.entries.insert(path.to_string(), (version, data));
        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .entries
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, (version, _))| ObjectMeta {
                path: path.clone(),
                version: version.to_string(),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.entries.get(path).map(|(version, _)| ObjectMeta {
            path: path.to_string(),
            version: version.to_string(),
        }))
    }
}
