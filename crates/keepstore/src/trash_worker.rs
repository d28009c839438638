//! Trash workers and the empty-trash sweeper.
//!
//! A trash request names a block and the mtime the requester observed in an
//! index. A copy is trashed only if its current mtime still equals that value
//! and is older than the signature TTL, so blocks written or touched since
//! the index was taken survive.
//!
//! The mtime check and the trash call are separate volume operations. The
//! volume repeats the age check under its own per-block lock, so a write
//! that lands between them keeps the block and the copy is not counted.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{KeepError, KeepResult};
use crate::locator::Locator;
use crate::mount::Mount;
use crate::volume::unix_nanos;
use crate::volume_manager::VolumeManager;
use crate::work_queue::WorkQueue;

/// One entry of a trash list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashRequest {
    /// Locator of the block to trash.
    pub locator: String,
    /// Block mtime in Unix nanoseconds, as reported by the index.
    pub block_mtime: i64,
    /// Restrict to one mount; otherwise every mount that allows trash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_uuid: Option<String>,
}

/// Executes trash requests.
pub struct Trasher {
    manager: Arc<VolumeManager>,
    enabled: bool,
}

impl Trasher {
    /// Create a trasher. When `enabled` is false every request is skipped.
    pub fn new(manager: Arc<VolumeManager>, enabled: bool) -> Self {
        Self { manager, enabled }
    }

    /// Apply one request, returning the number of copies trashed.
    pub async fn trash(&self, req: &TrashRequest) -> KeepResult<u32> {
        if !self.enabled {
            debug!(locator = %req.locator, "trash disabled; skipping");
            return Ok(0);
        }
        let locator = Locator::parse(&req.locator)?;
        let hash = locator.hash.as_str();
        let mounts: Vec<Arc<Mount>> = match &req.mount_uuid {
            Some(uuid) => vec![self.manager.mount(uuid).ok_or_else(|| KeepError::UnknownMount {
                uuid: uuid.clone(),
            })?],
            None => self.manager.readable().to_vec(),
        };

        let policy = self.manager.trash_policy();
        let mut trashed = 0;
        for mount in mounts {
            if !mount.allow_trash {
                if req.mount_uuid.is_some() {
                    warn!(mount = %mount, hash, "trash requested on mount that does not allow it");
                }
                continue;
            }
            let mtime = match self.manager.bounded("mtime", mount.volume.mtime(hash)).await {
                Ok(mtime) => mtime,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(mount = %mount, hash, error = %e, "trash: mtime failed");
                    continue;
                }
            };
            if unix_nanos(mtime) != req.block_mtime {
                debug!(mount = %mount, hash, current = unix_nanos(mtime), requested = req.block_mtime, "trash: mtime changed; skipping");
                continue;
            }
            if !policy.old_enough(mtime, SystemTime::now()) {
                debug!(mount = %mount, hash, "trash: block is newer than signature TTL");
                continue;
            }
            match self.manager.bounded("trash", mount.volume.trash(hash, policy)).await {
                Ok(true) => {
                    info!(mount = %mount, hash, "trashed block");
                    trashed += 1;
                }
                Ok(false) => debug!(mount = %mount, hash, "trash: block was refreshed; kept"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(mount = %mount, hash, error = %e, "trash failed"),
            }
        }
        Ok(trashed)
    }

    /// Process trash requests from `queue` until it closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, queue: WorkQueue<TrashRequest>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = queue.next() => next,
            };
            let Some((req, ticket)) = next else {
                break;
            };
            if let Err(e) = self.trash(&req).await {
                warn!(locator = %req.locator, error = %e, "trash request failed");
            }
            ticket.done();
        }
        debug!("trash worker stopped");
    }
}

/// Start `workers` trash workers sharing `queue`.
pub fn spawn_trash_workers(
    trasher: Arc<Trasher>,
    queue: &WorkQueue<TrashRequest>,
    workers: usize,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|_| tokio::spawn(trasher.clone().run(queue.clone(), cancel.clone())))
        .collect()
}

/// Purge expired trash every `interval` until `cancel` fires.
pub async fn run_trash_sweeper(manager: Arc<VolumeManager>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = manager.empty_trash().await;
                info!(
                    deleted = stats.blocks_deleted,
                    bytes_deleted = stats.bytes_deleted,
                    remaining = stats.blocks_remaining,
                    "empty trash sweep complete"
                );
            }
        }
    }
}
