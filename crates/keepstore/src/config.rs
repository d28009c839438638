//! Node configuration.
//!
//! One [`KeepstoreConfig`] is loaded at startup and handed by reference to
//! every component that needs it; nothing reads configuration from globals.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KeepError, KeepResult};
use crate::volume::TrashPolicy;

const DAY_SECS: u64 = 86_400;

fn default_replication() -> u32 {
    1
}

fn default_classes() -> BTreeSet<String> {
    BTreeSet::from(["default".to_string()])
}

/// One configured volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Mount UUID, unique within the node.
    pub uuid: String,
    /// Registered driver name, e.g. `Directory`.
    pub driver: String,
    /// Driver-specific parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Copies a write to this volume counts for.
    #[serde(default = "default_replication")]
    pub replication: u32,
    /// Storage classes the volume belongs to.
    #[serde(default = "default_classes")]
    pub storage_classes: BTreeSet<String>,
    /// Refuse writes.
    #[serde(default)]
    pub read_only: bool,
    /// Permit trash and untrash even though the volume is read-only.
    #[serde(default)]
    pub allow_trash_when_read_only: bool,
}

impl VolumeConfig {
    /// In-memory volume with default settings.
    pub fn memory(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            driver: "Memory".to_string(),
            parameters: serde_json::Value::Null,
            replication: default_replication(),
            storage_classes: default_classes(),
            read_only: false,
            allow_trash_when_read_only: false,
        }
    }

    /// Same volume with a different set of storage classes.
    pub fn with_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.storage_classes = classes.into_iter().map(Into::into).collect();
        self
    }
}

/// Settings for one storage class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClassConfig {
    /// Used when a write names no storage classes.
    #[serde(default)]
    pub default: bool,
    /// Higher priority volumes are tried first.
    #[serde(default)]
    pub priority: i32,
}

/// Configuration of a keepstore node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepstoreConfig {
    /// Volumes in configuration order.
    pub volumes: Vec<VolumeConfig>,
    /// Storage class definitions.
    pub storage_classes: BTreeMap<String, StorageClassConfig>,
    /// Require a valid signature on reads.
    pub blob_signing: bool,
    /// Secret used to sign locators.
    pub blob_signing_key: Option<String>,
    /// Lifetime of issued signatures, also the minimum age for trashing.
    pub blob_signing_ttl_secs: u64,
    /// Allow trash requests at all.
    pub blob_trash: bool,
    /// How long trashed blocks remain recoverable.
    pub blob_trash_lifetime_secs: u64,
    /// Interval between empty-trash sweeps; zero disables the sweeper.
    pub blob_trash_check_interval_secs: u64,
    /// Maximum block buffers checked out at once.
    pub max_keep_blob_buffers: usize,
    /// Privileged token accepted for pull/trash lists and full indexes.
    pub system_root_token: Option<String>,
    /// Concurrent pull workers.
    pub pull_workers: usize,
    /// Concurrent trash workers.
    pub trash_workers: usize,
    /// Deadline for fetching one block from a remote server.
    pub pull_timeout_secs: u64,
    /// Deadline for a single volume operation; zero means none.
    pub volume_timeout_secs: u64,
}

impl Default for KeepstoreConfig {
    fn default() -> Self {
        Self {
            volumes: Vec::new(),
            storage_classes: BTreeMap::new(),
            blob_signing: false,
            blob_signing_key: None,
            blob_signing_ttl_secs: 14 * DAY_SECS,
            blob_trash: true,
            blob_trash_lifetime_secs: 14 * DAY_SECS,
            blob_trash_check_interval_secs: DAY_SECS,
            max_keep_blob_buffers: 128,
            system_root_token: None,
            pull_workers: 1,
            trash_workers: 1,
            pull_timeout_secs: 60,
            volume_timeout_secs: 0,
        }
    }
}

impl KeepstoreConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> KeepResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: KeepstoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| KeepError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| KeepError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(KeepError::Config {
                    reason: format!("unsupported config file extension: {:?}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> KeepResult<()> {
        let fail = |reason: String| Err(KeepError::Config { reason });
        if self.volumes.is_empty() {
            return fail("no volumes configured".to_string());
        }
        if self.max_keep_blob_buffers == 0 {
            return fail("max_keep_blob_buffers must be at least 1".to_string());
        }
        if self.blob_signing && self.signing_key().is_none() {
            return fail("blob_signing is enabled but blob_signing_key is empty".to_string());
        }
        let mut seen = HashSet::new();
        for vol in &self.volumes {
            if vol.uuid.is_empty() {
                return fail(format!("volume with driver {} has no uuid", vol.driver));
            }
            if !seen.insert(vol.uuid.as_str()) {
                return fail(format!("duplicate volume uuid {}", vol.uuid));
            }
        }
        Ok(())
    }

    /// Signing key, if one is configured and non-empty.
    pub fn signing_key(&self) -> Option<&str> {
        self.blob_signing_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Signature lifetime.
    pub fn signing_ttl(&self) -> Duration {
        Duration::from_secs(self.blob_signing_ttl_secs)
    }

    /// Trash age/retention rules derived from the signing TTL and trash lifetime.
    pub fn trash_policy(&self) -> TrashPolicy {
        TrashPolicy {
            signature_ttl: self.signing_ttl(),
            trash_lifetime: Duration::from_secs(self.blob_trash_lifetime_secs),
        }
    }

    /// Interval between empty-trash sweeps, if enabled.
    pub fn trash_check_interval(&self) -> Option<Duration> {
        (self.blob_trash && self.blob_trash_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.blob_trash_check_interval_secs))
    }

    /// Deadline for remote fetches.
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    /// Deadline for a single volume call, if any.
    pub fn volume_timeout(&self) -> Option<Duration> {
        (self.volume_timeout_secs > 0).then(|| Duration::from_secs(self.volume_timeout_secs))
    }

    /// Storage classes used when a write names none. Empty means "any".
    pub fn default_classes(&self) -> Vec<String> {
        self.storage_classes
            .iter()
            .filter(|(_, c)| c.default)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Highest configured priority among `classes`; zero when none is configured.
    pub fn priority_of<'a>(&self, classes: impl IntoIterator<Item = &'a String>) -> i32 {
        classes
            .into_iter()
            .filter_map(|c| self.storage_classes.get(c).map(|sc| sc.priority))
            .max()
            .unwrap_or(0)
    }
}
