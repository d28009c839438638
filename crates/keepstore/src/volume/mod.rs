//! The volume contract and the driver registry.
//!
//! A [`Volume`] is one storage unit: a local directory, an in-memory map,
//! or any other backend that can store blocks by hash. Volumes know
//! nothing about each other; replication and selection live in
//! [`crate::volume_manager`].

mod directory;
mod lock_table;
mod memory;

pub use directory::{DirectoryParams, DirectoryVolume};
pub use lock_table::LockTable;
pub use memory::{MemoryParams, MemoryVolume};
#[cfg(test)]
pub(crate) use memory::TouchedAfterMtime;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::config::VolumeConfig;
use crate::error::{KeepError, KeepResult};
use crate::locator::block_hash;

/// Capacity report for one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    /// Stable identifier of the underlying device.
    pub device_id: String,
    /// Bytes available for new blocks.
    pub bytes_free: u64,
    /// Bytes occupied.
    pub bytes_used: u64,
    /// The volume ran out of space recently and is refusing writes.
    #[serde(default)]
    pub full: bool,
}

/// Result of one `empty_trash` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyTrashStats {
    /// Trashed copies purged.
    pub blocks_deleted: u64,
    /// Bytes freed.
    pub bytes_deleted: u64,
    /// Trashed copies still inside their recovery window.
    pub blocks_remaining: u64,
    /// Bytes still held in trash.
    pub bytes_remaining: u64,
}

impl EmptyTrashStats {
    /// Sum two passes.
    pub fn merge(&mut self, other: EmptyTrashStats) {
        self.blocks_deleted += other.blocks_deleted;
        self.bytes_deleted += other.bytes_deleted;
        self.blocks_remaining += other.blocks_remaining;
        self.bytes_remaining += other.bytes_remaining;
    }
}

/// Age and retention rules applied when trashing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrashPolicy {
    /// Blocks younger than this may still be referenced by a live signature.
    pub signature_ttl: Duration,
    /// How long a trashed copy stays recoverable. Zero purges immediately.
    pub trash_lifetime: Duration,
}

impl TrashPolicy {
    /// True when a block last modified at `mtime` may be trashed at `now`.
    pub fn old_enough(&self, mtime: SystemTime, now: SystemTime) -> bool {
        match now.duration_since(mtime) {
            Ok(age) => age >= self.signature_ttl,
            Err(_) => false,
        }
    }

    /// Purge deadline for a copy trashed at `now`.
    pub fn deadline(&self, now: SystemTime) -> SystemTime {
        now + self.trash_lifetime
    }

    /// True when trashing skips the recovery window.
    pub fn purges_immediately(&self) -> bool {
        self.trash_lifetime.is_zero()
    }
}

/// Unix nanoseconds for `t`, the unit used by index lines and trash requests.
pub fn unix_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

/// Inverse of [`unix_nanos`].
pub fn from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

/// One line of a volume index: `hash+size mtime_nanos\n`.
pub fn index_line(hash: &str, size: u64, mtime: SystemTime) -> String {
    format!("{}+{} {}\n", hash, size, unix_nanos(mtime))
}

/// Shared `compare` semantics: equal bytes are ok; otherwise the stored
/// bytes' own digest decides between a collision and corruption.
pub fn compare_stored(hash: &str, stored: &[u8], expected: &[u8]) -> KeepResult<()> {
    if stored == expected {
        return Ok(());
    }
    if block_hash(stored) == hash {
        Err(KeepError::Collision {
            hash: hash.to_string(),
        })
    } else {
        Err(KeepError::Corrupt {
            hash: hash.to_string(),
        })
    }
}

/// Operations every storage backend provides.
///
/// All operations take a bare 32-digit hash.
#[async_trait]
pub trait Volume: Send + Sync + fmt::Debug {
    /// Copy the stored bytes into `buf` and return their length.
    ///
    /// Fails with [`KeepError::TooLarge`] without reading anything when the
    /// block does not fit. No integrity check is done here.
    async fn get(&self, hash: &str, buf: &mut [u8]) -> KeepResult<usize>;

    /// Check whether the stored block equals `expected`.
    async fn compare(&self, hash: &str, expected: &[u8]) -> KeepResult<()>;

    /// Store `data` under `hash`, atomically replacing any existing copy.
    async fn put(&self, hash: &str, data: &[u8]) -> KeepResult<()>;

    /// Set the block's modification time to now.
    async fn touch(&self, hash: &str) -> KeepResult<()>;

    /// Last modification time of the block.
    async fn mtime(&self, hash: &str) -> KeepResult<SystemTime>;

    /// Write an index line for every live block whose hash starts with `prefix`.
    async fn index(
        &self,
        prefix: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> KeepResult<()>;

    /// Move the block to trash, or purge it when the policy has no
    /// recovery window. Blocks younger than the signature TTL are left alone
    /// and reported as `Ok(false)`.
    async fn trash(&self, hash: &str, policy: TrashPolicy) -> KeepResult<bool>;

    /// Restore a trashed block.
    async fn untrash(&self, hash: &str) -> KeepResult<()>;

    /// Purge trashed copies whose deadline has passed.
    async fn empty_trash(&self) -> KeepResult<EmptyTrashStats>;

    /// Device identity and capacity.
    async fn status(&self) -> KeepResult<VolumeStatus>;

    /// True if the volume accepts writes.
    fn writable(&self) -> bool;

    /// Stable identifier of the underlying device.
    fn device_id(&self) -> String;
}

/// Everything a driver needs to build a volume.
pub struct VolumeParams<'a> {
    /// Mount UUID the volume will serve.
    pub uuid: &'a str,
    /// Driver-specific parameters from the configuration.
    pub parameters: &'a serde_json::Value,
    /// Whether the volume must refuse writes.
    pub read_only: bool,
    /// Whether trash and untrash stay available on a read-only volume.
    pub allow_trash_when_read_only: bool,
}

/// Builds a volume from its parameters.
pub type VolumeConstructor = fn(&VolumeParams<'_>) -> KeepResult<Arc<dyn Volume>>;

/// Maps configured driver names to volume constructors.
pub struct DriverRegistry {
    drivers: HashMap<String, VolumeConstructor>,
}

impl DriverRegistry {
    /// A registry with no drivers.
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// A registry with the built-in `Memory` and `Directory` drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(MemoryVolume::DRIVER, MemoryVolume::construct);
        registry.register(DirectoryVolume::DRIVER, DirectoryVolume::construct);
        registry
    }

    /// Add or replace a driver.
    pub fn register(&mut self, name: &str, constructor: VolumeConstructor) {
        self.drivers.insert(name.to_string(), constructor);
    }

    /// Names of registered drivers, sorted.
    pub fn drivers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the volume described by `config`.
    pub fn build(&self, config: &VolumeConfig) -> KeepResult<Arc<dyn Volume>> {
        let constructor = self
            .drivers
            .get(&config.driver)
            .ok_or_else(|| KeepError::UnknownDriver {
                driver: config.driver.clone(),
            })?;
        constructor(&VolumeParams {
            uuid: &config.uuid,
            parameters: &config.parameters,
            read_only: config.read_only,
            allow_trash_when_read_only: config.allow_trash_when_read_only,
        })
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Deserialize driver parameters, treating a missing value as defaults.
pub(crate) fn parse_params<T>(driver: &str, value: &serde_json::Value) -> KeepResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| KeepError::Config {
        reason: format!("invalid {} volume parameters: {}", driver, e),
    })
}
