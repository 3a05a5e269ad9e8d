//! Package records and their metadata documents.
//!
//! A [`PackageInfo`] is keyed by installer filename and carries a JSON
//! [`PackageDocument`] plus the membership lists the pipeline derives catalogs
//! and manifests from. The document's `description` may end with a computed
//! install-statistics trailer that user edits must not drop.

use std::sync::LazyLock;

use depot_core::entity::Entity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, ValidationError};

/// Document key holding the package name.
pub const KEY_NAME: &str = "name";
/// Document key holding the package version.
pub const KEY_VERSION: &str = "version";
/// Document key holding the user-facing description.
pub const KEY_DESCRIPTION: &str = "description";
/// Document key holding the installer content hash.
pub const KEY_INSTALLER_ITEM_HASH: &str = "installer_item_hash";
/// Document key mirroring the record's catalog membership.
pub const KEY_CATALOGS: &str = "catalogs";
/// Document key naming the installer file; identifies the record.
pub const KEY_INSTALLER_ITEM_LOCATION: &str = "installer_item_location";
/// Document key holding the display name.
pub const KEY_DISPLAY_NAME: &str = "display_name";
/// Document key holding the unattended-install flag.
pub const KEY_UNATTENDED_INSTALL: &str = "unattended_install";
/// Document key holding the minimum OS version.
pub const KEY_MINIMUM_OS_VERSION: &str = "minimum_os_version";
/// Document key holding the maximum OS version.
pub const KEY_MAXIMUM_OS_VERSION: &str = "maximum_os_version";
/// Document key holding the forced-install deadline (RFC 3339).
pub const KEY_FORCE_INSTALL_AFTER_DATE: &str = "force_install_after_date";

/// Blank line between user prose and the statistics trailer.
pub const TRAILER_SEPARATOR: &str = "\n\n";

static TRAILER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)^(?P<prose>.*?)(?:\n\n)?(?P<trailer>\d+ users have installed this with an average duration of \d+ seconds\.)$",
    )
    .expect("trailer pattern is valid")
});

/// Formats the install-statistics trailer.
#[must_use]
pub fn average_duration_text(users: u64, seconds: u64) -> String {
    format!("{users} users have installed this with an average duration of {seconds} seconds.")
}

/// Splits a raw description into user prose and the optional trailer.
#[must_use]
pub fn split_description(raw: &str) -> (&str, Option<&str>) {
    match TRAILER_PATTERN.captures(raw) {
        Some(caps) => {
            let prose = caps.name("prose").map_or("", |m| m.as_str());
            let trailer = caps.name("trailer").map(|m| m.as_str());
            (prose, trailer)
        }
        None => (raw, None),
    }
}

/// A package metadata document.
///
/// Keys are kept in sorted order, so serializing the same document twice
/// always yields the same text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageDocument(Map<String, Value>);

impl PackageDocument {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses submitted document text.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] unless the text is a JSON object
    /// with a non-empty string `name`.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ValidationError::Malformed {
            message: e.to_string(),
        })?;
        let Value::Object(map) = value else {
            return Err(ValidationError::Malformed {
                message: "document must be an object".into(),
            });
        };
        let doc = Self(map);
        if doc.name().is_none_or(str::is_empty) {
            return Err(ValidationError::Malformed {
                message: "document requires a string name".into(),
            });
        }
        Ok(doc)
    }

    /// Returns the underlying map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns a key's value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a key's value when it is a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Sets a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Removes a key.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Package name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.get_str(KEY_NAME)
    }

    /// Package version.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.get_str(KEY_VERSION)
    }

    /// Installer content hash.
    #[must_use]
    pub fn installer_item_hash(&self) -> Option<&str> {
        self.get_str(KEY_INSTALLER_ITEM_HASH)
    }

    /// Raw description including any trailer.
    #[must_use]
    pub fn raw_description(&self) -> &str {
        self.get_str(KEY_DESCRIPTION).unwrap_or_default()
    }

    /// Description with the statistics trailer stripped.
    #[must_use]
    pub fn description(&self) -> &str {
        split_description(self.raw_description()).0
    }

    /// Sets the description.
    ///
    /// A trailer in `text` replaces the stored one; otherwise the stored
    /// trailer is kept after the new prose.
    pub fn set_description(&mut self, text: &str) {
        let next = match split_description(text) {
            (_, Some(_)) => text.to_string(),
            (prose, None) => match split_description(self.raw_description()).1 {
                Some(trailer) => format!("{prose}{TRAILER_SEPARATOR}{trailer}"),
                None => prose.to_string(),
            },
        };
        self.set(KEY_DESCRIPTION, next);
    }

    /// Catalogs recorded in the document.
    #[must_use]
    pub fn catalogs(&self) -> Vec<String> {
        self.0
            .get(KEY_CATALOGS)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mirrors catalog membership into the document.
    pub fn set_catalogs(&mut self, catalogs: &[String]) {
        self.set(KEY_CATALOGS, catalogs.to_vec());
    }

    /// Compact JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be serialized.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    /// Copy of the document without catalogs and with the trailer stripped.
    ///
    /// Two documents with equal comparable forms differ only in fields the
    /// pipeline maintains itself.
    #[must_use]
    pub fn comparable(&self) -> Self {
        let mut copy = self.clone();
        copy.remove(KEY_CATALOGS);
        if copy.get(KEY_DESCRIPTION).is_some() {
            let prose = copy.description().to_string();
            copy.set(KEY_DESCRIPTION, prose);
        }
        copy
    }
}

/// Whether a package is visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationState {
    /// No catalog or manifest membership and no pending proposal.
    Quarantined,
    /// Referenced by clients or awaiting approval.
    Live,
}

/// A package record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Installer filename, unique.
    pub filename: String,
    /// Package name, mirrored from the document.
    #[serde(default)]
    pub name: String,
    /// Installer content hash, mirrored from the document.
    #[serde(default)]
    pub pkgdata_sha256: Option<String>,
    /// Catalog membership.
    #[serde(default)]
    pub catalogs: Vec<String>,
    /// Manifest membership.
    #[serde(default)]
    pub manifests: Vec<String>,
    /// Install-type tags the package is listed under in manifests.
    #[serde(default)]
    pub install_types: Vec<String>,
    /// Groups allowed to add the package to their own manifests.
    #[serde(default)]
    pub manifest_mod_access: Vec<String>,
    /// An approval proposal is outstanding.
    #[serde(default)]
    pub proposal_pending: bool,
    /// Metadata document.
    #[serde(default)]
    pub document: PackageDocument,
}

impl Entity for PackageInfo {
    const KIND: &'static str = "package";

    fn key(&self) -> &str {
        &self.filename
    }

    fn with_key(key: &str) -> Self {
        Self {
            filename: key.to_string(),
            ..Self::default()
        }
    }
}

impl PackageInfo {
    /// Name clients see: the document's name, falling back to the record's.
    #[must_use]
    pub fn package_name(&self) -> &str {
        self.document
            .name()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.name)
    }

    /// Returns true when the package belongs to any catalog or manifest.
    #[must_use]
    pub fn has_membership(&self) -> bool {
        !self.catalogs.is_empty() || !self.manifests.is_empty()
    }

    /// Current modification state.
    #[must_use]
    pub fn modification_state(&self) -> ModificationState {
        if self.has_membership() || self.proposal_pending {
            ModificationState::Live
        } else {
            ModificationState::Quarantined
        }
    }

    /// Returns true when gated fields may change.
    #[must_use]
    pub fn is_safe_to_modify(&self, approval_required: bool) -> bool {
        !approval_required || self.modification_state() == ModificationState::Quarantined
    }

    /// Serialized document as it appears in catalog bodies.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] when the document has no name
    /// or cannot be encoded.
    pub fn render(&self) -> Result<String, PipelineError> {
        if self.document.name().is_none_or(str::is_empty) {
            return Err(PipelineError::Serialization {
                filename: self.filename.clone(),
                message: "document has no name".into(),
            });
        }
        self.document
            .to_json()
            .map_err(|e| PipelineError::Serialization {
                filename: self.filename.clone(),
                message: e.to_string(),
            })
    }

    /// Serialized document for audit records; empty text when unencodable.
    #[must_use]
    pub fn document_text(&self) -> String {
        self.document.to_json().unwrap_or_default()
    }
}
