//! Name → serialized value cache with explicit invalidation.
//!
//! Invalidation needs no lease: removing an entry is idempotent and commutes with
//! other invalidations.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Caching layer consulted by artifact readers.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Drops the cached value for `key`, if any.
    async fn invalidate(&self, key: &str) -> Result<()>;
}

/// In-memory cache.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Bytes>>,
}

fn poisoned() -> Error {
    Error::Internal {
        message: "cache lock poisoned".into(),
    }
}

impl InMemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set(&self, key: impl Into<String>, value: Bytes) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(key.into(), value);
        Ok(())
    }

    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().map_err(|_| poisoned())?.get(key).cloned())
    }
}

#[async_trait]
impl CacheLayer for InMemoryCache {
    async fn invalidate(&self, key: &str) -> Result<()> {
        self.entries.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }
}
