//! Catalog eligibility checks for package updates.

use async_trait::async_trait;
use depot_core::entity::EntityStore;

use crate::error::{Result, ValidationError};
use crate::package::PackageInfo;

/// Decides whether a package may hold its target catalog set.
#[async_trait]
pub trait CatalogEligibility: Send + Sync {
    /// Verifies `package.catalogs` given the catalogs it held before.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::IneligibleCatalogs`] on refusal.
    async fn verify(&self, package: &PackageInfo, previous: &[String]) -> Result<()>;
}

/// Default policy.
///
/// Targets must be configured tracks, and no other package with the same name
/// and version may already be a member of a newly added catalog.
#[derive(Debug, Clone)]
pub struct TrackEligibility {
    store: EntityStore,
    tracks: Vec<String>,
}

impl TrackEligibility {
    /// Creates the policy.
    #[must_use]
    pub fn new(store: EntityStore, tracks: Vec<String>) -> Self {
        Self { store, tracks }
    }
}

#[async_trait]
impl CatalogEligibility for TrackEligibility {
    async fn verify(&self, package: &PackageInfo, previous: &[String]) -> Result<()> {
        if let Some(unknown) = package
            .catalogs
            .iter()
            .find(|c| !self.tracks.iter().any(|t| t == *c))
        {
            return Err(ValidationError::IneligibleCatalogs {
                filename: package.filename.clone(),
                reason: format!("{unknown} is not a configured track"),
            }
            .into());
        }

        let added: Vec<&String> = package
            .catalogs
            .iter()
            .filter(|c| !previous.contains(*c))
            .collect();
        if added.is_empty() {
            return Ok(());
        }

        let name = package.package_name().to_string();
        let version = package.document.version().map(ToString::to_string);
        let filename = package.filename.clone();
        let conflicts = self
            .store
            .scan::<PackageInfo, _>(|other| {
                other.filename != filename
                    && other.package_name() == name
                    && other.document.version().map(ToString::to_string) == version
                    && other.catalogs.iter().any(|c| added.contains(&c))
            })
            .await?;

        match conflicts.first() {
            Some(other) => Err(ValidationError::IneligibleCatalogs {
                filename: package.filename.clone(),
                reason: format!(
                    "{} already provides {name} {} in the same catalog",
                    other.filename,
                    version.as_deref().unwrap_or("(unversioned)")
                ),
            }
            .into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use depot_core::entity::Entity;
    use depot_core::storage::MemoryBackend;

    use crate::error::PipelineError;
    use crate::package::{KEY_NAME, KEY_VERSION};

    fn package(filename: &str, version: &str, catalogs: &[&str]) -> PackageInfo {
        let mut pkg = PackageInfo::with_key(filename);
        pkg.name = "Firefox".into();
        pkg.document.set(KEY_NAME, "Firefox");
        pkg.document.set(KEY_VERSION, version);
        pkg.catalogs = catalogs.iter().map(ToString::to_string).collect();
        pkg
    }

    fn policy(store: &EntityStore) -> TrackEligibility {
        TrackEligibility::new(
            store.clone(),
            vec!["unstable".into(), "testing".into(), "stable".into()],
        )
    }

    fn is_ineligible(result: Result<()>) -> bool {
        matches!(
            result,
            Err(PipelineError::Validation(ValidationError::IneligibleCatalogs { .. }))
        )
    }

    #[tokio::test]
    async fn unknown_catalog_is_refused() {
        let store = EntityStore::new(Arc::new(MemoryBackend::new()));
        let pkg = package("ff.dmg", "1.0", &["beta"]);
        assert!(is_ineligible(policy(&store).verify(&pkg, &[]).await));
    }

    #[tokio::test]
    async fn duplicate_name_and_version_in_added_catalog_is_refused() {
        let store = EntityStore::new(Arc::new(MemoryBackend::new()));
        store
            .put(&package("ff-old.dmg", "1.0", &["stable"]))
            .await
            .unwrap();

        let pkg = package("ff.dmg", "1.0", &["testing", "stable"]);
        assert!(is_ineligible(
            policy(&store).verify(&pkg, &["testing".into()]).await
        ));

        let other_version = package("ff2.dmg", "2.0", &["stable"]);
        policy(&store)
            .verify(&other_version, &[])
            .await
            .expect("different version is eligible");
    }

    #[tokio::test]
    async fn existing_membership_is_not_rechecked() {
        let store = EntityStore::new(Arc::new(MemoryBackend::new()));
        store
            .put(&package("ff-old.dmg", "1.0", &["stable"]))
            .await
            .unwrap();

        let pkg = package("ff.dmg", "1.0", &["stable"]);
        policy(&store)
            .verify(&pkg, &["stable".into()])
            .await
            .expect("no newly added catalogs");
    }
}
