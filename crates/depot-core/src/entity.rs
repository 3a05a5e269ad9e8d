//! Typed record store layered over a [`StorageBackend`].
//!
//! Records are JSON documents stored at `entities/{kind}/{key}.json`. The key is
//! percent-encoded so package filenames with separators or spaces stay a single
//! path segment.

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// A record kind persisted by the [`EntityStore`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable kind name, used as the storage prefix.
    const KIND: &'static str;

    /// Returns the record's unique key.
    fn key(&self) -> &str;

    /// Builds an empty record for `key`, used by [`EntityStore::get_or_create`].
    fn with_key(key: &str) -> Self;
}

/// Record store with get-by-key, get-or-create, filtered scans and upserts.
#[derive(Clone)]
pub struct EntityStore {
    backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore").finish_non_exhaustive()
    }
}

impl EntityStore {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Returns the underlying storage backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Storage path for a record.
    #[must_use]
    pub fn record_path(kind: &str, key: &str) -> String {
        format!("entities/{kind}/{}.json", encode_key(key))
    }

    fn kind_prefix(kind: &str) -> String {
        format!("entities/{kind}/")
    }

    /// Loads the record stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the stored record cannot be decoded.
    pub async fn get_by_key<E: Entity>(&self, key: &str) -> Result<Option<E>> {
        match self.backend.get(&Self::record_path(E::KIND, key)).await {
            Ok(data) => Ok(Some(decode::<E>(&data)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns true when a record exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata lookup fails.
    pub async fn exists<E: Entity>(&self, key: &str) -> Result<bool> {
        Ok(self
            .backend
            .head(&Self::record_path(E::KIND, key))
            .await?
            .is_some())
    }

    /// Loads the record under `key`, inserting an empty one if none exists.
    ///
    /// Insertion uses `DoesNotExist`, so two concurrent callers converge on the
    /// same stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record cannot be encoded/decoded.
    pub async fn get_or_create<E: Entity>(&self, key: &str) -> Result<E> {
        if let Some(existing) = self.get_by_key::<E>(key).await? {
            return Ok(existing);
        }

        let fresh = E::with_key(key);
        let path = Self::record_path(E::KIND, key);
        match self
            .backend
            .put(&path, encode(&fresh)?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(fresh),
            WriteResult::PreconditionFailed { .. } => self
                .get_by_key::<E>(key)
                .await?
                .ok_or_else(|| Error::record_not_found(E::KIND, key)),
        }
    }

    /// Returns every record of kind `E` accepted by `predicate`.
    ///
    /// Order is whatever the backend lists, stable for this call.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or reading fails, or a record cannot be decoded.
    pub async fn scan<E, F>(&self, predicate: F) -> Result<Vec<E>>
    where
        E: Entity,
        F: Fn(&E) -> bool + Send + Sync,
    {
        let listed = self.backend.list(&Self::kind_prefix(E::KIND)).await?;
        let mut records = Vec::with_capacity(listed.len());
        for meta in listed {
            let data = match self.backend.get(&meta.path).await {
                Ok(data) => data,
                // Deleted between list and get.
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let record = decode::<E>(&data)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Upserts a record.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the storage write fails.
    pub async fn put<E: Entity>(&self, record: &E) -> Result<()> {
        let path = Self::record_path(E::KIND, record.key());
        match self
            .backend
            .put(&path, encode(record)?, WritePrecondition::None)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { current_version } => Err(Error::storage(format!(
                "unconditional write to {path} rejected (version {current_version})"
            ))),
        }
    }
}

fn encode<E: Serialize>(record: &E) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(record)?))
}

fn decode<E: DeserializeOwned>(data: &[u8]) -> Result<E> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization {
        message: format!("decode record: {e}"),
    })
}

/// Percent-encodes everything outside `[A-Za-z0-9._-]`.
pub(crate) fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}
