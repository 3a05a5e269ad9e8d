//! Pipeline configuration.
//!
//! Every constant the pipeline needs (tracks, install types, backoffs, lease
//! timeouts) lives here and is injected at startup. [`PipelineConfig::from_env`]
//! reads `DEPOT_*` overrides on top of the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::observability::LogFormat;

/// Default release tracks.
pub const DEFAULT_TRACKS: [&str; 3] = ["unstable", "testing", "stable"];

/// Default install-type tags.
pub const DEFAULT_INSTALL_TYPES: [&str; 4] = [
    "managed_installs",
    "managed_uninstalls",
    "optional_installs",
    "managed_updates",
];

/// Default auxiliary catalog appended to every manifest's `catalogs` list.
pub const DEFAULT_AUXILIARY_CATALOG: &str = "apple_update_metadata";

/// Configuration for the rebuild pipeline and mutation coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Backoff before retrying a contended catalog rebuild.
    pub catalog_retry_delay: Duration,
    /// Backoff before retrying a contended manifest rebuild.
    pub manifest_retry_delay: Duration,
    /// Delay applied when a catalog rebuild triggers its manifest.
    pub manifest_trigger_delay: Duration,
    /// Bounded wait for the per-package lease during updates.
    pub package_lock_timeout: Duration,
    /// TTL of storage-backed leases.
    pub lease_ttl: Duration,
    /// Maximum contended attempts per rebuild; `None` retries forever.
    pub retry_max_attempts: Option<u32>,
    /// Whether live packages are gated against edits.
    pub approval_required: bool,
    /// Configured release tracks.
    pub tracks: Vec<String>,
    /// Configured install-type tags.
    pub install_types: Vec<String>,
    /// Auxiliary catalog listed in every manifest.
    pub auxiliary_catalog: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            catalog_retry_delay: Duration::from_secs(10),
            manifest_retry_delay: Duration::from_secs(5),
            manifest_trigger_delay: Duration::from_secs(1),
            package_lock_timeout: Duration::from_millis(5_000),
            lease_ttl: crate::lock::DEFAULT_LEASE_TTL,
            retry_max_attempts: None,
            approval_required: false,
            tracks: DEFAULT_TRACKS.iter().map(ToString::to_string).collect(),
            install_types: DEFAULT_INSTALL_TYPES
                .iter()
                .map(ToString::to_string)
                .collect(),
            auxiliary_catalog: DEFAULT_AUXILIARY_CATALOG.to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from `DEPOT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when a variable is set but cannot be parsed, or
    /// when the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = env_u64("DEPOT_CATALOG_RETRY_SECS")? {
            config.catalog_retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DEPOT_MANIFEST_RETRY_SECS")? {
            config.manifest_retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DEPOT_MANIFEST_TRIGGER_DELAY_SECS")? {
            config.manifest_trigger_delay = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("DEPOT_PACKAGE_LOCK_TIMEOUT_MS")? {
            config.package_lock_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("DEPOT_LEASE_TTL_SECS")? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_u32("DEPOT_RETRY_MAX_ATTEMPTS")? {
            config.retry_max_attempts = Some(attempts);
        }
        if let Some(required) = env_bool("DEPOT_APPROVAL_REQUIRED")? {
            config.approval_required = required;
        }
        if let Some(tracks) = env_string("DEPOT_TRACKS") {
            config.tracks = parse_list(&tracks);
        }
        if let Some(types) = env_string("DEPOT_INSTALL_TYPES") {
            config.install_types = parse_list(&types);
        }
        if let Some(aux) = env_string("DEPOT_AUXILIARY_CATALOG") {
            config.auxiliary_catalog = aux;
        }
        if let Some(format) = env_string("DEPOT_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates invariants the pipeline depends on.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for zero retry backoffs, an empty track list, an
    /// empty auxiliary catalog, or a zero attempt bound.
    pub fn validate(&self) -> Result<()> {
        if self.catalog_retry_delay.is_zero() {
            return Err(Error::InvalidInput(
                "catalog retry delay must be non-zero".into(),
            ));
        }
        if self.manifest_retry_delay.is_zero() {
            return Err(Error::InvalidInput(
                "manifest retry delay must be non-zero".into(),
            ));
        }
        if self.tracks.is_empty() {
            return Err(Error::InvalidInput("at least one track is required".into()));
        }
        if self.auxiliary_catalog.trim().is_empty() {
            return Err(Error::InvalidInput(
                "auxiliary catalog name must not be empty".into(),
            ));
        }
        if self.retry_max_attempts == Some(0) {
            return Err(Error::InvalidInput(
                "retry max attempts must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Returns true when `name` is a configured track.
    #[must_use]
    pub fn is_track(&self, name: &str) -> bool {
        self.tracks.iter().any(|t| t == name)
    }

    /// Returns true when `tag` is a configured install type.
    #[must_use]
    pub fn is_install_type(&self, tag: &str) -> bool {
        self.install_types.iter().any(|t| t == tag)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
