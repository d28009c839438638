//! Mounts: a volume plus the replication metadata the node applies to it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::VolumeConfig;
use crate::volume::Volume;

/// A configured volume as the volume manager sees it.
#[derive(Clone)]
pub struct Mount {
    /// Mount UUID.
    pub uuid: String,
    /// The backend.
    pub volume: Arc<dyn Volume>,
    /// Copies one write to this mount counts for (at least 1).
    pub replication: u32,
    /// Storage classes served by this mount (never empty).
    pub storage_classes: BTreeSet<String>,
    /// Writes are allowed.
    pub allow_write: bool,
    /// Trash and untrash are allowed.
    pub allow_trash: bool,
    /// Selection priority; higher is tried first.
    pub priority: i32,
}

impl Mount {
    /// Wrap `volume` with the metadata from `config`.
    pub fn new(config: &VolumeConfig, volume: Arc<dyn Volume>, priority: i32) -> Self {
        let storage_classes = if config.storage_classes.is_empty() {
            BTreeSet::from(["default".to_string()])
        } else {
            config.storage_classes.clone()
        };
        let allow_write = !config.read_only && volume.writable();
        Self {
            uuid: config.uuid.clone(),
            replication: config.replication.max(1),
            storage_classes,
            allow_write,
            allow_trash: allow_write || config.allow_trash_when_read_only,
            priority,
            volume,
        }
    }

    /// True if the mount serves `class`.
    pub fn has_class(&self, class: &str) -> bool {
        self.storage_classes.contains(class)
    }

    /// Serializable description for the mounts listing.
    pub fn info(&self) -> MountInfo {
        MountInfo {
            uuid: self.uuid.clone(),
            device_id: self.volume.device_id(),
            read_only: !self.allow_write,
            allow_trash: self.allow_trash,
            replication: self.replication,
            storage_classes: self.storage_classes.clone(),
            priority: self.priority,
        }
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("uuid", &self.uuid)
            .field("device_id", &self.volume.device_id())
            .field("replication", &self.replication)
            .field("storage_classes", &self.storage_classes)
            .field("allow_write", &self.allow_write)
            .field("priority", &self.priority)
            .finish()
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uuid, self.volume.device_id())
    }
}

/// Mount metadata reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Mount UUID.
    pub uuid: String,
    /// Device identifier of the backing volume.
    pub device_id: String,
    /// Writes are refused.
    pub read_only: bool,
    /// Trash is permitted.
    pub allow_trash: bool,
    /// Replication factor.
    pub replication: u32,
    /// Storage classes.
    pub storage_classes: BTreeSet<String>,
    /// Selection priority.
    pub priority: i32,
}
