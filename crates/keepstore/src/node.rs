//! The keepstore node: configuration, volumes, signing and background work
//! behind one handle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::buffer_pool::{BufferPool, BufferPoolStats, BLOCK_SIZE};
use crate::config::KeepstoreConfig;
use crate::error::{KeepError, KeepResult};
use crate::locator::Locator;
use crate::mount::MountInfo;
use crate::pull_worker::{spawn_pull_workers, BlockSource, PullRequest, Puller};
use crate::signing::BlobSigner;
use crate::trash_worker::{run_trash_sweeper, spawn_trash_workers, TrashRequest, Trasher};
use crate::volume::{DriverRegistry, VolumeStatus};
use crate::volume_manager::{BlockRead, TrashOutcome, UntrashOutcome, VolumeManager};
use crate::work_queue::{WorkQueue, WorkQueueStatus};

/// Result of a successful block write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Locator for the stored block, signed when a signing key is configured.
    pub locator: Locator,
    /// Replicas confirmed.
    pub replicas: u32,
    /// Confirmed classes, formatted as `A=1, B=1`.
    pub classes_confirmed: String,
}

/// Status of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatusEntry {
    /// Mount UUID.
    pub uuid: String,
    /// Capacity report.
    #[serde(flatten)]
    pub status: VolumeStatus,
}

/// Node-wide status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Per-volume capacity.
    pub volumes: Vec<VolumeStatusEntry>,
    /// Buffer pool usage.
    pub buffer_pool: BufferPoolStats,
    /// Pull queue progress.
    pub pull_queue: WorkQueueStatus,
    /// Trash queue progress.
    pub trash_queue: WorkQueueStatus,
}

/// A running keepstore node.
pub struct Keepstore {
    config: KeepstoreConfig,
    manager: Arc<VolumeManager>,
    signer: Option<Arc<BlobSigner>>,
    pull_queue: WorkQueue<PullRequest>,
    trash_queue: WorkQueue<TrashRequest>,
}

impl Keepstore {
    /// Build a node from `config`, constructing volumes with `registry`.
    /// Must be called inside a tokio runtime.
    pub fn new(config: KeepstoreConfig, registry: &DriverRegistry) -> KeepResult<Self> {
        config.validate()?;
        let buffers = BufferPool::new(config.max_keep_blob_buffers, BLOCK_SIZE);
        let manager = VolumeManager::from_config(&config, registry, buffers)?;
        Ok(Self::with_manager(config, manager))
    }

    /// Build a node around an existing volume manager.
    pub fn with_manager(config: KeepstoreConfig, manager: VolumeManager) -> Self {
        let signer = config
            .signing_key()
            .map(|key| Arc::new(BlobSigner::new(key, config.signing_ttl())));
        info!(
            volumes = manager.readable().len(),
            writable = manager.writable().len(),
            signing = config.blob_signing,
            trash = config.blob_trash,
            "keepstore node ready"
        );
        Self {
            config,
            manager: Arc::new(manager),
            signer,
            pull_queue: WorkQueue::new(),
            trash_queue: WorkQueue::new(),
        }
    }

    /// The node configuration.
    pub fn config(&self) -> &KeepstoreConfig {
        &self.config
    }

    /// The volume manager.
    pub fn manager(&self) -> &Arc<VolumeManager> {
        &self.manager
    }

    /// The block buffer pool.
    pub fn buffers(&self) -> &BufferPool {
        self.manager.buffers()
    }

    /// Pull queue handle.
    pub fn pull_queue(&self) -> &WorkQueue<PullRequest> {
        &self.pull_queue
    }

    /// Trash queue handle.
    pub fn trash_queue(&self) -> &WorkQueue<TrashRequest> {
        &self.trash_queue
    }

    /// True if `token` is the configured system root token.
    pub fn is_system_auth(&self, token: Option<&str>) -> bool {
        match (self.config.system_root_token.as_deref(), token) {
            (Some(root), Some(token)) => !root.is_empty() && root == token,
            _ => false,
        }
    }

    /// Sign `locator` for `token`. Without a signing key the locator is
    /// returned unsigned.
    pub fn sign_locator(&self, locator: &Locator, token: &str) -> KeepResult<Locator> {
        match &self.signer {
            Some(signer) if !token.is_empty() => signer.sign(locator, token),
            _ => Ok(locator.clone()),
        }
    }

    /// Check the signature on `locator` when signature enforcement is on.
    pub fn check_signature(&self, locator: &Locator, token: Option<&str>) -> KeepResult<()> {
        if !self.config.blob_signing {
            return Ok(());
        }
        let token = token.filter(|t| !t.is_empty()).ok_or(KeepError::NoToken)?;
        let signer = self.signer.as_ref().ok_or(KeepError::Forbidden)?;
        signer.verify(locator, token)
    }

    /// Read a block named by a locator string.
    pub async fn read_block(
        &self,
        locator: &str,
        token: Option<&str>,
        cancel: &CancellationToken,
    ) -> KeepResult<BlockRead> {
        let locator = Locator::parse(locator)?;
        if locator.is_remote() {
            return Err(KeepError::MethodDisabled {
                reason: "remote block references are not served".to_string(),
            });
        }
        self.check_signature(&locator, token)?;
        self.manager.get(&locator.hash, locator.size, cancel).await
    }

    /// Store `data` under `hash` in `classes` (configured defaults when empty).
    pub async fn write_block(
        &self,
        hash: &str,
        data: &[u8],
        classes: &[String],
        token: Option<&str>,
        cancel: &CancellationToken,
    ) -> KeepResult<WriteReceipt> {
        VolumeManager::check_hash(hash)?;
        let progress = self.manager.put(hash, data, classes, cancel).await?;
        let locator = self.sign_locator(&Locator::new(hash, data.len() as u64), token.unwrap_or_default())?;
        Ok(WriteReceipt {
            locator,
            replicas: progress.total_replication(),
            classes_confirmed: progress.class_replication_header(),
        })
    }

    /// Refresh a block's mtime.
    pub async fn touch_block(&self, locator: &str) -> KeepResult<()> {
        let locator = Locator::parse(locator)?;
        self.manager.touch(&locator.hash).await
    }

    /// Trash a block on every mount that allows it.
    pub async fn trash_block(&self, locator: &str) -> KeepResult<TrashOutcome> {
        if !self.config.blob_trash {
            return Err(KeepError::MethodDisabled {
                reason: "trash is disabled".to_string(),
            });
        }
        let locator = Locator::parse(locator)?;
        self.manager.trash(&locator.hash).await
    }

    /// Restore a trashed block.
    pub async fn untrash_block(&self, locator: &str) -> KeepResult<UntrashOutcome> {
        let locator = Locator::parse(locator)?;
        self.manager.untrash(&locator.hash).await
    }

    /// Write index lines for `prefix` to `out`.
    pub async fn index(
        &self,
        prefix: &str,
        mount_uuid: Option<&str>,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> KeepResult<()> {
        self.manager.index(prefix, mount_uuid, out).await
    }

    /// Metadata of every mount.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.manager.mounts()
    }

    /// Replace the pending pull list.
    pub async fn replace_pull_list(&self, list: Vec<PullRequest>) -> KeepResult<()> {
        info!(entries = list.len(), "replacing pull list");
        self.pull_queue.replace(list).await
    }

    /// Replace the pending trash list.
    pub async fn replace_trash_list(&self, list: Vec<TrashRequest>) -> KeepResult<()> {
        info!(entries = list.len(), "replacing trash list");
        self.trash_queue.replace(list).await
    }

    /// Node status report.
    pub async fn status(&self) -> NodeStatus {
        let volumes = self
            .manager
            .status()
            .await
            .into_iter()
            .map(|(uuid, status)| VolumeStatusEntry { uuid, status })
            .collect();
        NodeStatus {
            volumes,
            buffer_pool: self.buffers().stats(),
            pull_queue: self.pull_queue.status(),
            trash_queue: self.trash_queue.status(),
        }
    }

    /// Start pull workers, trash workers and the empty-trash sweeper.
    pub fn spawn_workers(&self, source: Arc<dyn BlockSource>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let puller = Arc::new(Puller::new(
            self.manager.clone(),
            self.signer.clone(),
            self.config.system_root_token.clone().unwrap_or_default(),
            source,
            self.config.pull_timeout(),
        ));
        let trasher = Arc::new(Trasher::new(self.manager.clone(), self.config.blob_trash));

        let mut handles = spawn_pull_workers(puller, &self.pull_queue, self.config.pull_workers, cancel);
        handles.extend(spawn_trash_workers(
            trasher,
            &self.trash_queue,
            self.config.trash_workers,
            cancel,
        ));
        if let Some(interval) = self.config.trash_check_interval() {
            handles.push(tokio::spawn(run_trash_sweeper(
                self.manager.clone(),
                interval,
                cancel.clone(),
            )));
        }
        info!(
            pull_workers = self.config.pull_workers,
            trash_workers = self.config.trash_workers,
            "background workers started"
        );
        handles
    }

    /// Close both work queues.
    pub async fn shutdown(&self) {
        self.pull_queue.close().await;
        self.trash_queue.close().await;
    }
}
