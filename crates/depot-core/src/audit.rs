//! Administrative audit trail for package mutations.
//!
//! Each applied mutation produces one [`PackageAuditEntry`]. Sinks are
//! append-only: [`StorageAuditLog`] writes one object per entry under
//! `audit/{date}/{timestamp}-{event_id}.json` with a `DoesNotExist` precondition.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Version of the audit entry schema.
pub const AUDIT_ENTRY_VERSION: u32 = 1;

/// Kind of administrative action recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum AuditAction {
    /// A package info record was created or edited.
    #[serde(rename = "pkginfo")]
    PackageInfo,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PackageInfo => write!(f, "pkginfo"),
        }
    }
}

/// One audited package mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageAuditEntry {
    /// Schema version for evolution.
    pub event_version: u32,
    /// Unique entry identifier (ULID).
    pub event_id: String,
    /// When the mutation was applied.
    pub timestamp: DateTime<Utc>,
    /// Identity that requested the mutation.
    pub actor: String,
    /// Action kind.
    pub action: AuditAction,
    /// Package filename.
    pub filename: String,
    /// Catalog membership before the change.
    pub catalogs_before: Vec<String>,
    /// Catalog membership after the change.
    pub catalogs: Vec<String>,
    /// Manifest membership before the change.
    pub manifests_before: Vec<String>,
    /// Manifest membership after the change.
    pub manifests: Vec<String>,
    /// Install types actually applied (empty when not applied).
    pub install_types: Vec<String>,
    /// Manifest modification access actually applied (empty when not applied).
    pub manifest_mod_access: Vec<String>,
    /// Serialized document before the change; `None` for new records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_document: Option<String>,
    /// Serialized document after the change.
    pub document: String,
}

impl PackageAuditEntry {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> PackageAuditEntryBuilder {
        PackageAuditEntryBuilder::default()
    }
}

/// Builder for [`PackageAuditEntry`].
#[derive(Debug, Default)]
pub struct PackageAuditEntryBuilder {
    actor: Option<String>,
    filename: Option<String>,
    catalogs_before: Vec<String>,
    catalogs: Vec<String>,
    manifests_before: Vec<String>,
    manifests: Vec<String>,
    install_types: Vec<String>,
    manifest_mod_access: Vec<String>,
    original_document: Option<String>,
    document: String,
}

impl PackageAuditEntryBuilder {
    /// Sets the actor.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the filename.
    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sets catalog membership before and after.
    #[must_use]
    pub fn catalogs(mut self, before: Vec<String>, after: Vec<String>) -> Self {
        self.catalogs_before = before;
        self.catalogs = after;
        self
    }

    /// Sets manifest membership before and after.
    #[must_use]
    pub fn manifests(mut self, before: Vec<String>, after: Vec<String>) -> Self {
        self.manifests_before = before;
        self.manifests = after;
        self
    }

    /// Sets the applied install types.
    #[must_use]
    pub fn install_types(mut self, install_types: Vec<String>) -> Self {
        self.install_types = install_types;
        self
    }

    /// Sets the applied manifest modification access.
    #[must_use]
    pub fn manifest_mod_access(mut self, access: Vec<String>) -> Self {
        self.manifest_mod_access = access;
        self
    }

    /// Sets the documents before and after.
    #[must_use]
    pub fn documents(mut self, original: Option<String>, current: impl Into<String>) -> Self {
        self.original_document = original;
        self.document = current.into();
        self
    }

    /// Builds the entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when actor or filename is missing.
    pub fn try_build(self) -> Result<PackageAuditEntry> {
        let actor = self
            .actor
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput("audit entry requires an actor".into()))?;
        let filename = self
            .filename
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::InvalidInput("audit entry requires a filename".into()))?;

        Ok(PackageAuditEntry {
            event_version: AUDIT_ENTRY_VERSION,
            event_id: Ulid::new().to_string(),
            timestamp: Utc::now(),
            actor,
            action: AuditAction::PackageInfo,
            filename,
            catalogs_before: self.catalogs_before,
            catalogs: self.catalogs,
            manifests_before: self.manifests_before,
            manifests: self.manifests,
            install_types: self.install_types,
            manifest_mod_access: self.manifest_mod_access,
            original_document: self.original_document,
            document: self.document,
        })
    }
}

/// Append-only audit sink.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Records an entry.
    async fn record(&self, entry: PackageAuditEntry) -> Result<()>;
}

/// In-memory audit sink.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<PackageAuditEntry>>,
}

impl InMemoryAuditLog {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns recorded entries in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn entries(&self) -> Result<Vec<PackageAuditEntry>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| Error::Internal {
                message: "audit lock poisoned".into(),
            })?
            .clone())
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(&self, entry: PackageAuditEntry) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| Error::Internal {
                message: "audit lock poisoned".into(),
            })?
            .push(entry);
        Ok(())
    }
}

/// Audit sink writing one storage object per entry.
#[derive(Clone)]
pub struct StorageAuditLog {
    storage: Arc<dyn StorageBackend>,
}

impl StorageAuditLog {
    /// Creates a sink over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Storage path for an entry.
    #[must_use]
    pub fn entry_path(entry: &PackageAuditEntry) -> String {
        let date = entry.timestamp.format("%Y-%m-%d");
        let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);
        format!("audit/{date}/{timestamp}-{}.json", entry.event_id)
    }
}

#[async_trait]
impl AuditLog for StorageAuditLog {
    #[tracing::instrument(skip(self, entry), fields(filename = %entry.filename, actor = %entry.actor))]
    async fn record(&self, entry: PackageAuditEntry) -> Result<()> {
        let path = Self::entry_path(&entry);
        let json = serde_json::to_vec(&entry)?;
        match self
            .storage
            .put(&path, Bytes::from(json), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { current_version } => Err(Error::storage(format!(
                "audit entry already exists at {path} (version {current_version})"
            ))),
        }
    }
}
