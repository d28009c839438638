//! Volume storing one file per block under a local directory.
//!
//! Block `h` lives at `root/h[0..3]/h`. A trashed copy is renamed to
//! `h.trash.<deadline>` next to it, where the deadline is in unix seconds.
//! Writes land in a temp file in the same directory and are renamed into
//! place, so readers only ever see whole blocks.
//!
//! Running out of space marks the volume full for [`FULL_RECHECK`]; puts
//! fail fast with [`KeepError::Full`] until then.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nix::errno::Errno;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    compare_stored, index_line, parse_params, EmptyTrashStats, LockTable, TrashPolicy, Volume,
    VolumeParams, VolumeStatus,
};
use crate::error::{KeepError, KeepResult};
use crate::locator::is_block_hash;

const TRASH_INFIX: &str = ".trash.";

/// How long a volume stays marked full after a write hit ENOSPC.
pub const FULL_RECHECK: Duration = Duration::from_secs(3600);

/// Parameters accepted by the `Directory` driver.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryParams {
    /// Existing directory that holds the blocks.
    pub root: PathBuf,
    /// Allow only one put/trash at a time on this volume.
    pub serialize: bool,
    /// Device identifier to report; defaults to `dir:<root>`.
    pub device_id: Option<String>,
}

/// Removes a temp file unless it was renamed into place.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn is_no_space(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(Errno::ENOSPC as i32)
}

fn parse_trash_name(name: &str) -> Option<(&str, u64)> {
    let (hash, deadline) = name.split_once(TRASH_INFIX)?;
    if !is_block_hash(hash) {
        return None;
    }
    Some((hash, deadline.parse().ok()?))
}

fn is_block_dir(name: &str, prefix: &str) -> bool {
    if name.len() != 3 || !name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return false;
    }
    if prefix.len() >= 3 {
        prefix.starts_with(name)
    } else {
        name.starts_with(prefix)
    }
}

/// Volume backed by a directory tree on a local filesystem.
#[derive(Debug)]
pub struct DirectoryVolume {
    root: PathBuf,
    device_id: String,
    read_only: bool,
    trash_when_read_only: bool,
    locks: LockTable,
    serialize: Option<Mutex<()>>,
    /// Unix seconds of the last ENOSPC, zero if none.
    full_since: AtomicU64,
}

impl DirectoryVolume {
    /// Driver name used in configuration.
    pub const DRIVER: &'static str = "Directory";

    /// Open the volume rooted at `root`, which must already exist.
    pub fn open(root: impl Into<PathBuf>, read_only: bool, serialize: bool) -> KeepResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(KeepError::Config {
                reason: format!("volume root {} is not a directory", root.display()),
            });
        }
        Ok(Self {
            device_id: format!("dir:{}", root.display()),
            root,
            read_only,
            trash_when_read_only: false,
            locks: LockTable::default(),
            serialize: serialize.then(|| Mutex::new(())),
            full_since: AtomicU64::new(0),
        })
    }

    pub(super) fn construct(params: &VolumeParams<'_>) -> KeepResult<Arc<dyn Volume>> {
        let parsed: DirectoryParams = parse_params(Self::DRIVER, params.parameters)?;
        if parsed.root.as_os_str().is_empty() {
            return Err(KeepError::Config {
                reason: format!("volume {}: Directory driver needs a root", params.uuid),
            });
        }
        let mut vol = Self::open(parsed.root, params.read_only, parsed.serialize)?;
        vol.trash_when_read_only = params.allow_trash_when_read_only;
        if let Some(device_id) = parsed.device_id {
            vol.device_id = device_id;
        }
        Ok(Arc::new(vol))
    }

    /// Root directory of the volume.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_dir(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..3.min(hash.len())])
    }

    fn block_path(&self, hash: &str) -> PathBuf {
        self.block_dir(hash).join(hash)
    }

    fn map_err(hash: &str, e: std::io::Error) -> KeepError {
        if e.kind() == std::io::ErrorKind::NotFound {
            KeepError::not_found(hash)
        } else {
            e.into()
        }
    }

    async fn serialized(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.serialize {
            Some(m) => Some(m.lock().await),
            None => None,
        }
    }

    fn check_hash(hash: &str) -> KeepResult<()> {
        if !is_block_hash(hash) {
            return Err(KeepError::InvalidLocator {
                locator: hash.to_string(),
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> KeepResult<()> {
        if self.read_only {
            return Err(KeepError::ReadOnly);
        }
        Ok(())
    }

    fn check_trashable(&self) -> KeepResult<()> {
        if self.read_only && !self.trash_when_read_only {
            return Err(KeepError::MethodDisabled {
                reason: format!("{} is read-only", self.device_id),
            });
        }
        Ok(())
    }

    /// True while a recent ENOSPC keeps the volume marked full.
    pub fn is_full(&self) -> bool {
        let since = self.full_since.load(Ordering::Relaxed);
        since != 0 && now_secs() < since.saturating_add(FULL_RECHECK.as_secs())
    }

    /// Refuse writes for the next [`FULL_RECHECK`].
    pub fn mark_full(&self) {
        warn!(device = %self.device_id, "volume full");
        self.full_since.store(now_secs().max(1), Ordering::Relaxed);
    }

    fn no_space(&self, e: std::io::Error) -> KeepError {
        if is_no_space(&e) {
            self.mark_full();
            KeepError::Full
        } else {
            e.into()
        }
    }

    /// Set a block's modification time directly.
    pub async fn set_mtime(&self, hash: &str, mtime: SystemTime) -> KeepResult<()> {
        Self::check_hash(hash)?;
        let _lock = self.locks.lock(hash).await;
        set_file_mtime(self.block_path(hash), mtime)
            .await
            .map_err(|e| Self::map_err(hash, e))
    }

    async fn read_block(&self, hash: &str) -> KeepResult<Vec<u8>> {
        tokio::fs::read(self.block_path(hash))
            .await
            .map_err(|e| Self::map_err(hash, e))
    }

    async fn trash_copies(&self, hash: &str) -> KeepResult<Vec<(PathBuf, u64)>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.block_dir(hash)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some((h, deadline)) = name.to_str().and_then(parse_trash_name) {
                if h == hash {
                    found.push((entry.path(), deadline));
                }
            }
        }
        Ok(found)
    }

    async fn block_dirs(&self, prefix: &str) -> KeepResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| is_block_dir(n, prefix)) && entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

async fn set_file_mtime(path: PathBuf, mtime: SystemTime) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(mtime)
    })
    .await
    .map_err(std::io::Error::other)?
}

#[async_trait]
impl Volume for DirectoryVolume {
    async fn get(&self, hash: &str, buf: &mut [u8]) -> KeepResult<usize> {
        Self::check_hash(hash)?;
        let mut file = tokio::fs::File::open(self.block_path(hash))
            .await
            .map_err(|e| Self::map_err(hash, e))?;
        let size = file.metadata().await?.len();
        if size > buf.len() as u64 {
            return Err(KeepError::TooLarge {
                size,
                capacity: buf.len() as u64,
            });
        }
        let size = size as usize;
        file.read_exact(&mut buf[..size]).await?;
        Ok(size)
    }

    async fn compare(&self, hash: &str, expected: &[u8]) -> KeepResult<()> {
        Self::check_hash(hash)?;
        let stored = self.read_block(hash).await?;
        compare_stored(hash, &stored, expected)
    }

    async fn put(&self, hash: &str, data: &[u8]) -> KeepResult<()> {
        Self::check_hash(hash)?;
        self.check_writable()?;
        if self.is_full() {
            return Err(KeepError::Full);
        }
        let _serial = self.serialized().await;

        let dir = self.block_dir(hash);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| self.no_space(e))?;
        let mut tmp = TempFile::new(dir.join(format!("tmp-{}", Uuid::new_v4().simple())));

        let written = async {
            let mut file = tokio::fs::File::create(&tmp.path).await?;
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        written.map_err(|e| self.no_space(e))?;

        let _lock = self.locks.lock(hash).await;
        tokio::fs::rename(&tmp.path, self.block_path(hash)).await?;
        tmp.disarm();
        Ok(())
    }

    async fn touch(&self, hash: &str) -> KeepResult<()> {
        Self::check_hash(hash)?;
        self.check_writable()?;
        let _lock = self.locks.lock(hash).await;
        set_file_mtime(self.block_path(hash), SystemTime::now())
            .await
            .map_err(|e| Self::map_err(hash, e))
    }

    async fn mtime(&self, hash: &str) -> KeepResult<SystemTime> {
        Self::check_hash(hash)?;
        let meta = tokio::fs::metadata(self.block_path(hash))
            .await
            .map_err(|e| Self::map_err(hash, e))?;
        Ok(meta.modified()?)
    }

    async fn index(
        &self,
        prefix: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> KeepResult<()> {
        for dir in self.block_dirs(prefix).await? {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !is_block_hash(name) || !name.starts_with(prefix) {
                    continue;
                }
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    // renamed to trash since the listing
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                out.write_all(index_line(name, meta.len(), meta.modified()?).as_bytes())
                    .await?;
            }
        }
        Ok(())
    }

    async fn trash(&self, hash: &str, policy: TrashPolicy) -> KeepResult<bool> {
        Self::check_hash(hash)?;
        self.check_trashable()?;
        let _serial = self.serialized().await;
        let _lock = self.locks.lock(hash).await;

        let path = self.block_path(hash);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::map_err(hash, e))?;
        let now = SystemTime::now();
        if !policy.old_enough(meta.modified()?, now) {
            debug!(device = %self.device_id, hash, "not trashing: block is newer than signature TTL");
            return Ok(false);
        }

        if policy.purges_immediately() {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| Self::map_err(hash, e))?;
            return Ok(true);
        }

        let deadline = policy
            .deadline(now)
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let trashed = self
            .block_dir(hash)
            .join(format!("{}{}{}", hash, TRASH_INFIX, deadline));
        tokio::fs::rename(&path, &trashed)
            .await
            .map_err(|e| Self::map_err(hash, e))?;
        Ok(true)
    }

    async fn untrash(&self, hash: &str) -> KeepResult<()> {
        Self::check_hash(hash)?;
        self.check_trashable()?;
        let _lock = self.locks.lock(hash).await;

        let copies = self.trash_copies(hash).await?;
        let (path, _) = copies
            .into_iter()
            .max_by_key(|(_, deadline)| *deadline)
            .ok_or_else(|| KeepError::not_found(hash))?;
        tokio::fs::rename(&path, self.block_path(hash))
            .await
            .map_err(|e| Self::map_err(hash, e))?;
        Ok(())
    }

    async fn empty_trash(&self) -> KeepResult<EmptyTrashStats> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let mut stats = EmptyTrashStats::default();
        for dir in self.block_dirs("").await? {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some((hash, deadline)) = name.to_str().and_then(parse_trash_name) else {
                    continue;
                };
                let size = match entry.metadata().await {
                    Ok(meta) => meta.len(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if deadline > now {
                    stats.blocks_remaining += 1;
                    stats.bytes_remaining += size;
                    continue;
                }
                let _lock = self.locks.lock(hash).await;
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        stats.blocks_deleted += 1;
                        stats.bytes_deleted += size;
                    }
                    // untrashed concurrently
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(device = %self.device_id, path = %entry.path().display(), "empty trash: {}", e);
                    }
                }
            }
        }
        if stats.blocks_deleted > 0 {
            info!(
                device = %self.device_id,
                deleted = stats.blocks_deleted,
                bytes = stats.bytes_deleted,
                "emptied trash"
            );
        }
        Ok(stats)
    }

    async fn status(&self) -> KeepResult<VolumeStatus> {
        let stat = nix::sys::statvfs::statvfs(self.root.as_path()).map_err(std::io::Error::from)?;
        let frag = stat.fragment_size() as u64;
        Ok(VolumeStatus {
            device_id: self.device_id.clone(),
            bytes_free: stat.blocks_available() as u64 * frag,
            bytes_used: (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * frag,
            full: self.is_full(),
        })
    }

    fn writable(&self) -> bool {
        !self.read_only
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}
