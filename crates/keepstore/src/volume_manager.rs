//! Volume manager: chooses mounts for reads and writes.
//!
//! Reads walk the readable mounts in rendezvous order for the block hash and
//! return the first copy whose contents match the hash. Writes first look
//! for existing identical copies, then fan the block out to writable mounts
//! until the requested storage classes are satisfied.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::KeepstoreConfig;
use crate::error::{KeepError, KeepResult};
use crate::locator::{block_hash, is_block_hash, HASH_LEN};
use crate::mount::{Mount, MountInfo};
use crate::put_progress::PutProgress;
use crate::volume::{DriverRegistry, EmptyTrashStats, TrashPolicy, VolumeStatus};

/// Manager settings taken from the node configuration.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Age and retention rules for trash.
    pub trash_policy: TrashPolicy,
    /// Classes used when a write requests none.
    pub default_classes: Vec<String>,
    /// Deadline for each volume call.
    pub volume_timeout: Option<Duration>,
}

impl From<&KeepstoreConfig> for ManagerOptions {
    fn from(config: &KeepstoreConfig) -> Self {
        Self {
            trash_policy: config.trash_policy(),
            default_classes: config.default_classes(),
            volume_timeout: config.volume_timeout(),
        }
    }
}

/// A block read from one mount.
pub struct BlockRead {
    /// The block contents, in a pooled buffer.
    pub data: PooledBuffer,
    /// UUID of the mount that served the block.
    pub mount_uuid: String,
}

/// Per-mount results of a trash request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashOutcome {
    /// Copies moved to trash or purged.
    pub copies_deleted: u32,
    /// Copies left alone because they are newer than the signature TTL.
    pub copies_kept: u32,
    /// Mounts where the attempt failed.
    pub copies_failed: u32,
}

/// Per-mount results of an untrash request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UntrashOutcome {
    /// Mounts that restored the block.
    pub untrashed: Vec<String>,
    /// Mounts where untrash failed for a reason other than "not found".
    pub failed: Vec<String>,
}

/// Orders `mounts` for reading `hash`: highest priority first, then by the
/// MD5 of the hash concatenated with the mount UUID's distinguishing part.
pub fn rendezvous_order(hash: &str, mounts: &[Arc<Mount>]) -> Vec<Arc<Mount>> {
    let hash = &hash[..HASH_LEN.min(hash.len())];
    let mut weighted: Vec<(i32, String, Arc<Mount>)> = mounts
        .iter()
        .map(|m| {
            // "zzzzz-nyw5e-" cluster/type prefix is the same on every mount
            let suffix = match m.uuid.len() {
                27 => m.uuid.get(12..).unwrap_or(m.uuid.as_str()),
                _ => m.uuid.as_str(),
            };
            let weight = block_hash(format!("{}{}", hash, suffix).as_bytes());
            (m.priority, weight, m.clone())
        })
        .collect();
    weighted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    weighted.into_iter().map(|(_, _, m)| m).collect()
}

/// Owns the mounts and implements replicated block I/O on top of them.
pub struct VolumeManager {
    mounts: HashMap<String, Arc<Mount>>,
    readable: Vec<Arc<Mount>>,
    writable: Vec<Arc<Mount>>,
    buffers: BufferPool,
    options: ManagerOptions,
    next_writable: AtomicUsize,
}

impl VolumeManager {
    /// Build the mounts described by `config` using `registry`.
    pub fn from_config(
        config: &KeepstoreConfig,
        registry: &DriverRegistry,
        buffers: BufferPool,
    ) -> KeepResult<Self> {
        let mut mounts = Vec::with_capacity(config.volumes.len());
        for vol_config in &config.volumes {
            let volume = registry.build(vol_config)?;
            let priority = config.priority_of(&vol_config.storage_classes);
            let mount = Mount::new(vol_config, volume, priority);
            info!(
                mount = %mount,
                replication = mount.replication,
                writable = mount.allow_write,
                classes = ?mount.storage_classes,
                "mounted volume"
            );
            mounts.push(mount);
        }
        Ok(Self::new(mounts, buffers, ManagerOptions::from(config)))
    }

    /// Manage an explicit set of mounts.
    pub fn new(mounts: Vec<Mount>, buffers: BufferPool, options: ManagerOptions) -> Self {
        let mut readable: Vec<Arc<Mount>> = mounts.into_iter().map(Arc::new).collect();
        readable.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        let writable: Vec<Arc<Mount>> = readable.iter().filter(|m| m.allow_write).cloned().collect();
        let mounts = readable.iter().map(|m| (m.uuid.clone(), m.clone())).collect();
        Self {
            mounts,
            readable,
            writable,
            buffers,
            options,
            next_writable: AtomicUsize::new(0),
        }
    }

    /// All mounts, sorted by UUID.
    pub fn readable(&self) -> &[Arc<Mount>] {
        &self.readable
    }

    /// Mounts that accept writes, sorted by UUID.
    pub fn writable(&self) -> &[Arc<Mount>] {
        &self.writable
    }

    /// Look up a mount by UUID.
    pub fn mount(&self, uuid: &str) -> Option<Arc<Mount>> {
        self.mounts.get(uuid).cloned()
    }

    /// Metadata of every mount.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.readable.iter().map(|m| m.info()).collect()
    }

    /// The buffer pool used for block I/O.
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Trash rules in effect.
    pub fn trash_policy(&self) -> TrashPolicy {
        self.options.trash_policy
    }

    pub(crate) async fn bounded<T, F>(&self, operation: &str, fut: F) -> KeepResult<T>
    where
        F: Future<Output = KeepResult<T>>,
    {
        match self.options.volume_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| KeepError::Timeout {
                    operation: operation.to_string(),
                })?,
            None => fut.await,
        }
    }

    /// Writable mounts for the next write: by descending priority, rotating
    /// the starting point among equal priorities on every call.
    fn write_order(&self) -> Vec<Arc<Mount>> {
        let n = self.writable.len();
        if n == 0 {
            return Vec::new();
        }
        let start = self.next_writable.fetch_add(1, Ordering::Relaxed) % n;
        let mut order: Vec<Arc<Mount>> = self.writable[start..]
            .iter()
            .chain(self.writable[..start].iter())
            .cloned()
            .collect();
        order.sort_by_key(|m| Reverse(m.priority));
        order
    }

    /// Read the block with hash `hash` from the first mount holding a good copy.
    /// When `size` is given, a copy of any other length counts as corrupt.
    pub async fn get(&self, hash: &str, size: Option<u64>, cancel: &CancellationToken) -> KeepResult<BlockRead> {
        let mut buf = self
            .buffers
            .get_cancellable(self.buffers.buffer_size(), cancel)
            .await?;
        let mut error_to_caller: Option<KeepError> = None;

        for mount in rendezvous_order(hash, &self.readable) {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(KeepError::Cancelled),
                r = self.bounded("get", mount.volume.get(hash, buf.as_full_mut())) => r,
            };
            match result {
                Ok(n) => {
                    buf.set_len(n);
                    let actual = block_hash(&buf);
                    if actual != hash || size.is_some_and(|s| s != n as u64) {
                        error!(mount = %mount, hash, actual = %actual, size = n, "checksum mismatch in stored data");
                        error_to_caller = Some(KeepError::Corrupt {
                            hash: hash.to_string(),
                        });
                        continue;
                    }
                    debug!(mount = %mount, hash, size = n, "read block");
                    return Ok(BlockRead {
                        data: buf,
                        mount_uuid: mount.uuid.clone(),
                    });
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(mount = %mount, hash, error = %e, "read failed");
                    if !matches!(error_to_caller, Some(KeepError::Corrupt { .. })) {
                        error_to_caller = Some(e);
                    }
                }
            }
        }
        Err(error_to_caller.unwrap_or_else(|| KeepError::not_found(hash)))
    }

    /// Store `data` under `hash` on enough mounts to satisfy `classes`
    /// (or the configured default classes when empty). The data is staged in
    /// a pooled buffer first, so concurrent writes wait for buffer space.
    pub async fn put(
        &self,
        hash: &str,
        data: &[u8],
        classes: &[String],
        cancel: &CancellationToken,
    ) -> KeepResult<PutProgress> {
        if data.len() > self.buffers.buffer_size() {
            return Err(KeepError::TooLarge {
                size: data.len() as u64,
                capacity: self.buffers.buffer_size() as u64,
            });
        }
        let actual = block_hash(data);
        if actual != hash {
            return Err(KeepError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        let classes = if classes.is_empty() {
            self.options.default_classes.clone()
        } else {
            classes.to_vec()
        };
        let buf = self.stage(data, cancel).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KeepError::Cancelled),
            r = self.replicate(hash, &buf, classes) => r,
        }
    }

    async fn stage(&self, data: &[u8], cancel: &CancellationToken) -> KeepResult<PooledBuffer> {
        let mut buf = self.buffers.get_cancellable(data.len(), cancel).await?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    async fn replicate(&self, hash: &str, data: &[u8], classes: Vec<String>) -> KeepResult<PutProgress> {
        let mut result = PutProgress::new(classes);
        self.compare_and_touch(hash, data, &mut result).await?;
        if result.done() {
            debug!(hash, replicas = result.total_replication(), "block already stored");
            return Ok(result);
        }

        let order = self.write_order();
        // result plus writes still in flight
        let mut pending = result.clone();
        let mut all_full = true;
        let mut attempted = 0usize;
        let mut in_flight: FuturesUnordered<BoxFuture<'_, (Arc<Mount>, KeepResult<()>)>> =
            FuturesUnordered::new();

        'mounts: for mount in &order {
            loop {
                if result.done() {
                    break 'mounts;
                }
                if !result.want(mount) {
                    continue 'mounts;
                }
                if pending.want(mount) {
                    break;
                }
                // whether this mount is needed depends on outstanding writes
                match in_flight.next().await {
                    Some((m, r)) => Self::settle(hash, m, r, &mut result, &mut pending, &mut all_full),
                    None => continue 'mounts,
                }
            }
            if pending.add(mount).is_err() {
                continue;
            }
            attempted += 1;
            let mount = mount.clone();
            in_flight.push(
                async move {
                    let r = self.bounded("put", mount.volume.put(hash, data)).await;
                    (mount, r)
                }
                .boxed(),
            );
        }
        while let Some((m, r)) = in_flight.next().await {
            Self::settle(hash, m, r, &mut result, &mut pending, &mut all_full);
        }

        if result.done() {
            debug!(hash, replicas = result.total_replication(), classes = %result.class_replication_header(), "stored block");
            return Ok(result);
        }
        if result.total_replication() == 0 && (order.is_empty() || (attempted > 0 && all_full)) {
            return Err(KeepError::Full);
        }
        Err(KeepError::InsufficientReplicas {
            replicas: result.total_replication(),
            missing: result.missing_classes(),
        })
    }

    fn settle(
        hash: &str,
        mount: Arc<Mount>,
        outcome: KeepResult<()>,
        result: &mut PutProgress,
        pending: &mut PutProgress,
        all_full: &mut bool,
    ) {
        match outcome {
            Ok(()) => {
                let _ = result.add(&mount);
            }
            Err(e) => {
                if !e.is_full() {
                    *all_full = false;
                }
                warn!(mount = %mount, hash, error = %e, "write failed");
                let _ = pending.sub(&mount);
            }
        }
    }

    /// Count identical copies that already exist, refreshing their mtime.
    async fn compare_and_touch(&self, hash: &str, data: &[u8], result: &mut PutProgress) -> KeepResult<()> {
        for mount in rendezvous_order(hash, &self.writable) {
            if !result.want(&mount) {
                continue;
            }
            match self.bounded("compare", mount.volume.compare(hash, data)).await {
                Ok(()) => match self.bounded("touch", mount.volume.touch(hash)).await {
                    Ok(()) => {
                        let _ = result.add(&mount);
                    }
                    Err(e) => warn!(mount = %mount, hash, error = %e, "touch of existing copy failed"),
                },
                Err(e @ KeepError::Collision { .. }) => {
                    error!(mount = %mount, hash, "hash collision");
                    return Err(e);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(mount = %mount, hash, error = %e, "compare failed"),
            }
        }
        Ok(())
    }

    /// Store a block on one specific mount.
    pub async fn put_to_mount(
        &self,
        uuid: &str,
        hash: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> KeepResult<PutProgress> {
        let mount = self.mount(uuid).ok_or_else(|| KeepError::UnknownMount {
            uuid: uuid.to_string(),
        })?;
        if !mount.allow_write {
            return Err(KeepError::ReadOnly);
        }
        let actual = block_hash(data);
        if actual != hash {
            return Err(KeepError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        let buf = self.stage(data, cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KeepError::Cancelled),
            r = self.bounded("put", mount.volume.put(hash, &buf)) => r?,
        }
        let mut result = PutProgress::new(Vec::<String>::new());
        result.add(&mount)?;
        Ok(result)
    }

    /// Refresh the block's mtime on the first writable mount that has it.
    pub async fn touch(&self, hash: &str) -> KeepResult<()> {
        let mut error_to_caller = None;
        for mount in rendezvous_order(hash, &self.writable) {
            match self.bounded("touch", mount.volume.touch(hash)).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(mount = %mount, hash, error = %e, "touch failed");
                    error_to_caller = Some(e);
                }
            }
        }
        Err(error_to_caller.unwrap_or_else(|| KeepError::not_found(hash)))
    }

    /// Trash every copy that is old enough on mounts that allow trash.
    pub async fn trash(&self, hash: &str) -> KeepResult<TrashOutcome> {
        let policy = self.options.trash_policy;
        let mut outcome = TrashOutcome::default();
        let mut found = false;
        for mount in self.readable.iter().filter(|m| m.allow_trash) {
            let mtime = match self.bounded("mtime", mount.volume.mtime(hash)).await {
                Ok(mtime) => mtime,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(mount = %mount, hash, error = %e, "mtime failed");
                    outcome.copies_failed += 1;
                    continue;
                }
            };
            found = true;
            if !policy.old_enough(mtime, SystemTime::now()) {
                outcome.copies_kept += 1;
                continue;
            }
            match self.bounded("trash", mount.volume.trash(hash, policy)).await {
                Ok(true) => outcome.copies_deleted += 1,
                // touched since the mtime check
                Ok(false) => outcome.copies_kept += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(mount = %mount, hash, error = %e, "trash failed");
                    outcome.copies_failed += 1;
                }
            }
        }
        if !found && outcome.copies_failed == 0 {
            return Err(KeepError::not_found(hash));
        }
        Ok(outcome)
    }

    /// Restore trashed copies on every mount that allows trash.
    pub async fn untrash(&self, hash: &str) -> KeepResult<UntrashOutcome> {
        let mut outcome = UntrashOutcome::default();
        let mut first_error = None;
        for mount in self.readable.iter().filter(|m| m.allow_trash) {
            match self.bounded("untrash", mount.volume.untrash(hash)).await {
                Ok(()) => outcome.untrashed.push(mount.uuid.clone()),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(mount = %mount, hash, error = %e, "untrash failed");
                    outcome.failed.push(mount.uuid.clone());
                    first_error.get_or_insert(e);
                }
            }
        }
        if outcome.untrashed.is_empty() {
            return Err(first_error.unwrap_or_else(|| KeepError::not_found(hash)));
        }
        Ok(outcome)
    }

    /// Write index lines for `prefix`, from every mount or just `mount_uuid`.
    pub async fn index(
        &self,
        prefix: &str,
        mount_uuid: Option<&str>,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> KeepResult<()> {
        if prefix.len() > HASH_LEN || !prefix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(KeepError::InvalidLocator {
                locator: prefix.to_string(),
            });
        }
        let mounts = match mount_uuid {
            Some(uuid) => vec![self.mount(uuid).ok_or_else(|| KeepError::UnknownMount {
                uuid: uuid.to_string(),
            })?],
            None => self.readable.clone(),
        };
        for mount in mounts {
            mount.volume.index(prefix, out).await?;
        }
        Ok(())
    }

    /// Purge expired trash on every mount that allows trash.
    pub async fn empty_trash(&self) -> EmptyTrashStats {
        let mut total = EmptyTrashStats::default();
        for mount in self.readable.iter().filter(|m| m.allow_trash) {
            match mount.volume.empty_trash().await {
                Ok(stats) => {
                    debug!(mount = %mount, deleted = stats.blocks_deleted, remaining = stats.blocks_remaining, "empty trash");
                    total.merge(stats);
                }
                Err(e) => error!(mount = %mount, error = %e, "empty trash failed"),
            }
        }
        total
    }

    /// Capacity report for every mount; failing volumes are logged and skipped.
    pub async fn status(&self) -> Vec<(String, VolumeStatus)> {
        let mut report = Vec::with_capacity(self.readable.len());
        for mount in &self.readable {
            match mount.volume.status().await {
                Ok(status) => report.push((mount.uuid.clone(), status)),
                Err(e) => warn!(mount = %mount, error = %e, "status failed"),
            }
        }
        report
    }

    /// Check that `hash` is a well-formed block hash.
    pub fn check_hash(hash: &str) -> KeepResult<()> {
        if is_block_hash(hash) {
            Ok(())
        } else {
            Err(KeepError::InvalidLocator {
                locator: hash.to_string(),
            })
        }
    }
}
