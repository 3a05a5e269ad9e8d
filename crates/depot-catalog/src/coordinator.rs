//! Safety-gated package mutations.
//!
//! [`PackageCoordinator::update`] is the only writer of package membership and
//! documents. Each update:
//!
//! 1. takes `pkgsinfo_<filename>` with a bounded wait,
//! 2. resolves the record (fresh for creation, stored otherwise),
//! 3. refuses changes to gated fields while the package is live,
//! 4. checks the vocabulary and catalog eligibility, then writes,
//! 5. releases the lease and rebuilds every catalog the package left or joined,
//!    in descending name order,
//! 6. appends an audit entry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use depot_core::audit::PackageAuditEntry;
use depot_core::entity::Entity;

use crate::catalog::CatalogBuilder;
use crate::context::PipelineContext;
use crate::eligibility::{CatalogEligibility, TrackEligibility};
use crate::error::{PipelineError, Result, ValidationError};
use crate::metrics;
use crate::package::{
    KEY_DESCRIPTION, KEY_DISPLAY_NAME, KEY_FORCE_INSTALL_AFTER_DATE, KEY_INSTALLER_ITEM_LOCATION,
    KEY_MAXIMUM_OS_VERSION, KEY_MINIMUM_OS_VERSION, KEY_NAME, KEY_UNATTENDED_INSTALL,
    KEY_VERSION, PackageDocument, PackageInfo, split_description,
};

/// Requested changes to a package. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageChanges {
    /// Catalog membership.
    pub catalogs: Option<Vec<String>>,
    /// Manifest membership.
    pub manifests: Option<Vec<String>>,
    /// Install-type tags.
    pub install_types: Option<Vec<String>>,
    /// Manifest modification access groups.
    pub manifest_mod_access: Option<Vec<String>>,
    /// Package name.
    pub name: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Unattended-install flag.
    pub unattended_install: Option<bool>,
    /// Description; a trailer-free value keeps the stored trailer.
    pub description: Option<String>,
    /// Version.
    pub version: Option<String>,
    /// Minimum OS version; empty removes the key.
    pub minimum_os_version: Option<String>,
    /// Maximum OS version; empty removes the key.
    pub maximum_os_version: Option<String>,
    /// Forced-install deadline.
    pub force_install_after_date: Option<DateTime<Utc>>,
    /// Whole-document replacement.
    pub document: Option<PackageDocument>,
}

impl PackageChanges {
    /// No changes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets catalog membership.
    #[must_use]
    pub fn with_catalogs<I, S>(mut self, catalogs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.catalogs = Some(catalogs.into_iter().map(Into::into).collect());
        self
    }

    /// Sets manifest membership.
    #[must_use]
    pub fn with_manifests<I, S>(mut self, manifests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifests = Some(manifests.into_iter().map(Into::into).collect());
        self
    }

    /// Sets install-type tags.
    #[must_use]
    pub fn with_install_types<I, S>(mut self, install_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.install_types = Some(install_types.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the package name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn gated_differences(&self, record: &PackageInfo) -> Vec<String> {
        let doc = &record.document;
        let mut fields = Vec::new();
        let mut check = |field: &str, differs: bool| {
            if differs {
                fields.push(field.to_string());
            }
        };

        check(
            "install_types",
            self.install_types
                .as_ref()
                .is_some_and(|v| *v != record.install_types),
        );
        check(
            "manifest_mod_access",
            self.manifest_mod_access
                .as_ref()
                .is_some_and(|v| *v != record.manifest_mod_access),
        );
        check(KEY_NAME, differs_str(self.name.as_deref(), doc.get_str(KEY_NAME)));
        check(
            KEY_DISPLAY_NAME,
            differs_str(self.display_name.as_deref(), doc.get_str(KEY_DISPLAY_NAME)),
        );
        check(
            KEY_UNATTENDED_INSTALL,
            self.unattended_install.is_some_and(|v| {
                doc.get(KEY_UNATTENDED_INSTALL)
                    .and_then(serde_json::Value::as_bool)
                    != Some(v)
            }),
        );
        check(
            KEY_DESCRIPTION,
            self.description
                .as_deref()
                .is_some_and(|d| split_description(d).0 != doc.description()),
        );
        check(KEY_VERSION, differs_str(self.version.as_deref(), doc.get_str(KEY_VERSION)));
        check(
            KEY_MINIMUM_OS_VERSION,
            differs_removable(
                self.minimum_os_version.as_deref(),
                doc.get_str(KEY_MINIMUM_OS_VERSION),
            ),
        );
        check(
            KEY_MAXIMUM_OS_VERSION,
            differs_removable(
                self.maximum_os_version.as_deref(),
                doc.get_str(KEY_MAXIMUM_OS_VERSION),
            ),
        );
        check(
            KEY_FORCE_INSTALL_AFTER_DATE,
            differs_str(
                self.force_install_after_date.map(format_deadline).as_deref(),
                doc.get_str(KEY_FORCE_INSTALL_AFTER_DATE),
            ),
        );
        check(
            "document",
            self.document
                .as_ref()
                .is_some_and(|d| d.comparable() != doc.comparable()),
        );
        fields
    }

    fn apply_gated(&self, record: &mut PackageInfo) {
        if let Some(replacement) = &self.document {
            let previous = record.document.raw_description().to_string();
            let mut next = replacement.clone();
            if let Some(text) = replacement.get_str(KEY_DESCRIPTION).map(ToString::to_string) {
                next.set(KEY_DESCRIPTION, previous);
                next.set_description(&text);
            }
            record.document = next;
        }

        let doc = &mut record.document;
        if let Some(name) = &self.name {
            doc.set(KEY_NAME, name.clone());
        }
        if let Some(display_name) = &self.display_name {
            doc.set(KEY_DISPLAY_NAME, display_name.clone());
        }
        if let Some(unattended) = self.unattended_install {
            doc.set(KEY_UNATTENDED_INSTALL, unattended);
        }
        if let Some(description) = &self.description {
            doc.set_description(description);
        }
        if let Some(version) = &self.version {
            doc.set(KEY_VERSION, version.clone());
        }
        set_removable(doc, KEY_MINIMUM_OS_VERSION, self.minimum_os_version.as_deref());
        set_removable(doc, KEY_MAXIMUM_OS_VERSION, self.maximum_os_version.as_deref());
        if let Some(deadline) = self.force_install_after_date {
            doc.set(KEY_FORCE_INSTALL_AFTER_DATE, format_deadline(deadline));
        }

        if let Some(install_types) = &self.install_types {
            record.install_types.clone_from(install_types);
        }
        if let Some(access) = &self.manifest_mod_access {
            record.manifest_mod_access.clone_from(access);
        }
    }
}

fn require_present(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field,
            message: "must not be blank".into(),
        }
        .into());
    }
    Ok(())
}

fn differs_str(requested: Option<&str>, current: Option<&str>) -> bool {
    requested.is_some_and(|r| Some(r) != current)
}

fn differs_removable(requested: Option<&str>, current: Option<&str>) -> bool {
    match requested {
        None => false,
        Some("") => current.is_some(),
        Some(r) => Some(r) != current,
    }
}

fn set_removable(doc: &mut PackageDocument, key: &str, value: Option<&str>) {
    match value {
        None => {}
        Some("") => {
            doc.remove(key);
        }
        Some(v) => doc.set(key, v),
    }
}

fn format_deadline(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Result of an applied update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// The stored record after the update.
    pub record: PackageInfo,
    /// Catalogs rebuilt, in rebuild order.
    pub regenerated: Vec<String>,
}

struct Applied {
    record: PackageInfo,
    catalogs_before: Vec<String>,
    manifests_before: Vec<String>,
    original_document: Option<String>,
    install_types: Vec<String>,
    manifest_mod_access: Vec<String>,
}

/// Applies package mutations and triggers catalog rebuilds.
#[derive(Clone)]
pub struct PackageCoordinator {
    ctx: PipelineContext,
    catalogs: CatalogBuilder,
    eligibility: Arc<dyn CatalogEligibility>,
}

impl std::fmt::Debug for PackageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageCoordinator").finish_non_exhaustive()
    }
}

impl PackageCoordinator {
    /// Creates a coordinator with the default eligibility policy.
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        let eligibility = Arc::new(TrackEligibility::new(
            ctx.store.clone(),
            ctx.config.tracks.clone(),
        ));
        Self {
            catalogs: CatalogBuilder::new(ctx.clone()),
            ctx,
            eligibility,
        }
    }

    /// Replaces the eligibility policy.
    #[must_use]
    pub fn with_eligibility(mut self, eligibility: Arc<dyn CatalogEligibility>) -> Self {
        self.eligibility = eligibility;
        self
    }

    /// Lease name guarding updates to `filename`.
    #[must_use]
    pub fn lock_name(filename: &str) -> String {
        format!("pkgsinfo_{filename}")
    }

    /// Applies `changes` to the package stored under `filename`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::LockContention`] when the package lease is not
    ///   obtained within the configured timeout
    /// - [`PipelineError::Validation`] when the record is missing or already
    ///   exists, a gated field changes on a live package, or the target
    ///   catalogs are ineligible
    /// - [`PipelineError::Validation`] before any lease is taken when `actor`
    ///   or `filename` is blank, and before writing when a record joining a
    ///   catalog has a document that cannot be rendered
    /// - [`PipelineError::Store`] when a store, lease or audit call fails
    ///
    /// A failed catalog rebuild does not undo the applied update; the first
    /// rebuild error is returned after every rebuild was attempted. A failed
    /// release of the package lease is logged and the update carries on.
    #[tracing::instrument(skip(self, changes))]
    pub async fn update(
        &self,
        actor: &str,
        filename: &str,
        changes: PackageChanges,
        creating_new: bool,
    ) -> Result<UpdateOutcome> {
        require_present("actor", actor)?;
        require_present("filename", filename)?;

        let lock_name = Self::lock_name(filename);
        let Some(lease) = self
            .ctx
            .locks
            .acquire(&lock_name, self.ctx.config.package_lock_timeout)
            .await?
        else {
            tracing::debug!(lease = %lock_name, "package lease contended");
            metrics::record_package_update(metrics::OUTCOME_REJECTED);
            return Err(PipelineError::contention(lock_name));
        };

        let applied = self.apply(filename, &changes, creating_new).await;
        let released = self.ctx.locks.release(lease).await;
        if let Err(e) = &released {
            tracing::warn!(lease = %lock_name, error = %e, "lease release failed; it lapses at its TTL");
        }
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                metrics::record_package_update(metrics::OUTCOME_REJECTED);
                return Err(e);
            }
        };
        metrics::record_package_update(metrics::OUTCOME_APPLIED);

        let affected: BTreeSet<&String> = applied
            .catalogs_before
            .iter()
            .chain(applied.record.catalogs.iter())
            .collect();
        let mut regenerated = Vec::with_capacity(affected.len());
        let mut first_error = None;
        for catalog in affected.into_iter().rev() {
            regenerated.push(catalog.clone());
            if let Err(e) = self.catalogs.generate(catalog, Duration::ZERO).await {
                tracing::error!(catalog = %catalog, error = %e, "catalog regeneration failed");
                first_error.get_or_insert(e);
            }
        }

        let entry = PackageAuditEntry::builder()
            .actor(actor)
            .filename(filename)
            .catalogs(applied.catalogs_before, applied.record.catalogs.clone())
            .manifests(applied.manifests_before, applied.record.manifests.clone())
            .install_types(applied.install_types)
            .manifest_mod_access(applied.manifest_mod_access)
            .documents(applied.original_document, applied.record.document_text())
            .try_build()?;
        self.ctx.audit.record(entry).await?;

        tracing::info!(filename = %filename, catalogs = ?applied.record.catalogs, "package updated");

        match first_error {
            Some(e) => Err(e),
            None => Ok(UpdateOutcome {
                record: applied.record,
                regenerated,
            }),
        }
    }

    /// Applies a submitted package document.
    ///
    /// The record is identified by the document's `installer_item_location`.
    /// Name, description, content hash and catalog membership come from the
    /// document; creation always starts with no catalogs.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] before any lease is taken when
    /// the document cannot be parsed, and otherwise the errors of
    /// [`update`](Self::update).
    pub async fn update_from_document(
        &self,
        actor: &str,
        text: &str,
        creating_new: bool,
    ) -> Result<UpdateOutcome> {
        let document = PackageDocument::parse(text)?;
        let filename = document
            .get_str(KEY_INSTALLER_ITEM_LOCATION)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ValidationError::Malformed {
                message: format!("document requires a string {KEY_INSTALLER_ITEM_LOCATION}"),
            })?
            .to_string();

        let catalogs = if creating_new {
            Vec::new()
        } else {
            document.catalogs()
        };
        let changes = PackageChanges {
            catalogs: Some(catalogs),
            document: Some(document),
            ..PackageChanges::default()
        };
        self.update(actor, &filename, changes, creating_new).await
    }

    /// Takes a live package out of every catalog and manifest.
    ///
    /// Returns `Ok(None)` without touching anything when the package has no
    /// membership or has a pending proposal.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`update`](Self::update).
    pub async fn make_safe_to_modify(
        &self,
        actor: &str,
        record: &PackageInfo,
    ) -> Result<Option<UpdateOutcome>> {
        if !record.has_membership() || record.proposal_pending {
            return Ok(None);
        }
        let changes = PackageChanges::new()
            .with_catalogs(Vec::<String>::new())
            .with_manifests(Vec::<String>::new());
        self.update(actor, &record.filename, changes, false)
            .await
            .map(Some)
    }

    async fn apply(
        &self,
        filename: &str,
        changes: &PackageChanges,
        creating_new: bool,
    ) -> Result<Applied> {
        let stored = self.ctx.store.get_by_key::<PackageInfo>(filename).await?;
        let current = match (creating_new, stored) {
            (true, Some(_)) => {
                return Err(ValidationError::AlreadyExists {
                    filename: filename.to_string(),
                }
                .into());
            }
            (false, Some(record)) => Some(record),
            (false, None) if changes.document.is_none() => {
                return Err(ValidationError::NotFound {
                    filename: filename.to_string(),
                }
                .into());
            }
            _ => None,
        };

        let original_document = current.as_ref().map(PackageInfo::document_text);
        let mut record = current.unwrap_or_else(|| PackageInfo::with_key(filename));
        let catalogs_before = record.catalogs.clone();
        let manifests_before = record.manifests.clone();

        let safe = record.is_safe_to_modify(self.ctx.config.approval_required);
        if !safe {
            let fields = changes.gated_differences(&record);
            if !fields.is_empty() {
                tracing::debug!(filename = %filename, ?fields, "gated fields changed on live package");
                return Err(ValidationError::UpdateRejected {
                    filename: filename.to_string(),
                    fields,
                }
                .into());
            }
        }

        self.check_vocabulary(changes, safe)?;

        if safe {
            changes.apply_gated(&mut record);
        }
        if let Some(catalogs) = &changes.catalogs {
            record.catalogs.clone_from(catalogs);
        }
        if let Some(manifests) = &changes.manifests {
            record.manifests.clone_from(manifests);
        }
        let catalogs = record.catalogs.clone();
        record.document.set_catalogs(&catalogs);
        record.name = record.document.name().unwrap_or_default().to_string();
        record.pkgdata_sha256 = record
            .document
            .installer_item_hash()
            .map(ToString::to_string);

        // A member that cannot be rendered would fail every rebuild of its catalogs.
        if !record.catalogs.is_empty() {
            record.render().map_err(|e| ValidationError::Malformed {
                message: format!("{filename} cannot join a catalog: {e}"),
            })?;
        }
        self.eligibility.verify(&record, &catalogs_before).await?;
        self.ctx.store.put(&record).await?;

        let (install_types, manifest_mod_access) = if safe {
            (
                changes.install_types.clone().unwrap_or_default(),
                changes.manifest_mod_access.clone().unwrap_or_default(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Applied {
            record,
            catalogs_before,
            manifests_before,
            original_document,
            install_types,
            manifest_mod_access,
        })
    }

    fn check_vocabulary(&self, changes: &PackageChanges, safe: bool) -> Result<()> {
        let config = &self.ctx.config;
        if safe {
            if let Some(unknown) = changes
                .install_types
                .iter()
                .flatten()
                .find(|t| !config.is_install_type(t))
            {
                return Err(ValidationError::InvalidField {
                    field: "install_types",
                    message: format!("{unknown} is not one of {:?}", config.install_types),
                }
                .into());
            }
        }
        if let Some(unknown) = changes
            .manifests
            .iter()
            .flatten()
            .find(|m| !config.is_track(m))
        {
            return Err(ValidationError::InvalidField {
                field: "manifests",
                message: format!("{unknown} is not one of {:?}", config.tracks),
            }
            .into());
        }
        Ok(())
    }
}
