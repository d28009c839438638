//! Process-local volume backed by a hash map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{compare_stored, index_line, parse_params, EmptyTrashStats, TrashPolicy, Volume, VolumeParams, VolumeStatus};
use crate::error::{KeepError, KeepResult};

/// Parameters accepted by the `Memory` driver.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryParams {
    /// Refuse writes that would take usage past this many bytes.
    pub capacity_bytes: Option<u64>,
    /// Device identifier to report; defaults to `memory:<uuid>`.
    pub device_id: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredBlock {
    data: Vec<u8>,
    mtime: SystemTime,
}

#[derive(Debug, Clone)]
struct TrashedBlock {
    block: StoredBlock,
    deadline: SystemTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    blocks: HashMap<String, StoredBlock>,
    trash: HashMap<String, Vec<TrashedBlock>>,
    broken: bool,
}

impl MemoryState {
    fn bytes_used(&self) -> u64 {
        let live: usize = self.blocks.values().map(|b| b.data.len()).sum();
        let trashed: usize = self
            .trash
            .values()
            .flat_map(|copies| copies.iter().map(|t| t.block.data.len()))
            .sum();
        (live + trashed) as u64
    }

    fn check_broken(&self) -> KeepResult<()> {
        if self.broken {
            return Err(std::io::Error::other("memory volume marked broken").into());
        }
        Ok(())
    }
}

/// Volume that keeps every block in memory.
#[derive(Debug)]
pub struct MemoryVolume {
    device_id: String,
    read_only: bool,
    trash_when_read_only: bool,
    capacity: Option<u64>,
    state: Mutex<MemoryState>,
}

impl MemoryVolume {
    /// Driver name used in configuration.
    pub const DRIVER: &'static str = "Memory";

    /// Writable volume with unlimited capacity.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            read_only: false,
            trash_when_read_only: false,
            capacity: None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Limit total bytes stored.
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity = Some(capacity_bytes);
        self
    }

    /// Refuse writes, touches and trash.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Keep trash and untrash available while read-only.
    pub fn with_trash_when_read_only(mut self, allow: bool) -> Self {
        self.trash_when_read_only = allow;
        self
    }

    pub(super) fn construct(params: &VolumeParams<'_>) -> KeepResult<Arc<dyn Volume>> {
        let parsed: MemoryParams = parse_params(Self::DRIVER, params.parameters)?;
        let device_id = parsed
            .device_id
            .unwrap_or_else(|| format!("memory:{}", params.uuid));
        let mut vol = Self::new(device_id)
            .with_read_only(params.read_only)
            .with_trash_when_read_only(params.allow_trash_when_read_only);
        vol.capacity = parsed.capacity_bytes;
        Ok(Arc::new(vol))
    }

    /// Make every subsequent operation fail with an I/O error.
    pub fn set_broken(&self, broken: bool) {
        self.state.lock().broken = broken;
    }

    /// Store bytes and mtime verbatim, bypassing read-only and capacity checks.
    pub fn store_raw(&self, hash: &str, data: &[u8], mtime: SystemTime) {
        self.state.lock().blocks.insert(
            hash.to_string(),
            StoredBlock {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    /// Override the recorded modification time of a live block.
    pub fn set_mtime(&self, hash: &str, mtime: SystemTime) -> KeepResult<()> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .get_mut(hash)
            .ok_or_else(|| KeepError::not_found(hash))?;
        block.mtime = mtime;
        Ok(())
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Number of trashed copies awaiting purge.
    pub fn trash_count(&self) -> usize {
        self.state.lock().trash.values().map(Vec::len).sum()
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
}

#[async_trait]
impl Volume for MemoryVolume {
    async fn get(&self, hash: &str, buf: &mut [u8]) -> KeepResult<usize> {
        let state = self.state.lock();
        state.check_broken()?;
        let block = state
            .blocks
            .get(hash)
            .ok_or_else(|| KeepError::not_found(hash))?;
        if block.data.len() > buf.len() {
            return Err(KeepError::TooLarge {
                size: block.data.len() as u64,
                capacity: buf.len() as u64,
            });
        }
        buf[..block.data.len()].copy_from_slice(&block.data);
        Ok(block.data.len())
    }

    async fn compare(&self, hash: &str, expected: &[u8]) -> KeepResult<()> {
        let state = self.state.lock();
        state.check_broken()?;
        let block = state
            .blocks
            .get(hash)
            .ok_or_else(|| KeepError::not_found(hash))?;
        compare_stored(hash, &block.data, expected)
    }

    async fn put(&self, hash: &str, data: &[u8]) -> KeepResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state.check_broken()?;
        if let Some(capacity) = self.capacity {
            let replaced = state.blocks.get(hash).map_or(0, |b| b.data.len() as u64);
            if state.bytes_used() - replaced + data.len() as u64 > capacity {
                return Err(KeepError::Full);
            }
        }
        state.blocks.insert(
            hash.to_string(),
            StoredBlock {
                data: data.to_vec(),
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn touch(&self, hash: &str) -> KeepResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state.check_broken()?;
        let block = state
            .blocks
            .get_mut(hash)
            .ok_or_else(|| KeepError::not_found(hash))?;
        block.mtime = SystemTime::now();
        Ok(())
    }

    async fn mtime(&self, hash: &str) -> KeepResult<SystemTime> {
        let state = self.state.lock();
        state.check_broken()?;
        state
            .blocks
            .get(hash)
            .map(|b| b.mtime)
            .ok_or_else(|| KeepError::not_found(hash))
    }

    async fn index(
        &self,
        prefix: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> KeepResult<()> {
        let lines: Vec<String> = {
            let state = self.state.lock();
            state.check_broken()?;
            state
                .blocks
                .iter()
                .filter(|(hash, _)| hash.starts_with(prefix))
                .map(|(hash, b)| index_line(hash, b.data.len() as u64, b.mtime))
                .collect()
        };
        for line in lines {
            out.write_all(line.as_bytes()).await?;
        }
        Ok(())
    }

    async fn trash(&self, hash: &str, policy: TrashPolicy) -> KeepResult<bool> {
        self.check_trashable()?;
        let now = SystemTime::now();
        let mut state = self.state.lock();
        state.check_broken()?;
        let mtime = state
            .blocks
            .get(hash)
            .map(|b| b.mtime)
            .ok_or_else(|| KeepError::not_found(hash))?;
        if !policy.old_enough(mtime, now) {
            debug!(hash, device = %self.device_id, "not trashing: block is newer than signature TTL");
            return Ok(false);
        }
        let Some(block) = state.blocks.remove(hash) else {
            return Err(KeepError::not_found(hash));
        };
        if !policy.purges_immediately() {
            state.trash.entry(hash.to_string()).or_default().push(TrashedBlock {
                block,
                deadline: policy.deadline(now),
            });
        }
        Ok(true)
    }

    async fn untrash(&self, hash: &str) -> KeepResult<()> {
        self.check_trashable()?;
        let mut state = self.state.lock();
        state.check_broken()?;
        let restored = match state.trash.get_mut(hash) {
            Some(copies) => copies.pop(),
            None => None,
        };
        if state.trash.get(hash).is_some_and(Vec::is_empty) {
            state.trash.remove(hash);
        }
        let trashed = restored.ok_or_else(|| KeepError::not_found(hash))?;
        state.blocks.insert(hash.to_string(), trashed.block);
        Ok(())
    }

    async fn empty_trash(&self) -> KeepResult<EmptyTrashStats> {
        let now = SystemTime::now();
        let mut stats = EmptyTrashStats::default();
        let mut state = self.state.lock();
        state.check_broken()?;
        for copies in state.trash.values_mut() {
            copies.retain(|t| {
                let size = t.block.data.len() as u64;
                if t.deadline <= now {
                    stats.blocks_deleted += 1;
                    stats.bytes_deleted += size;
                    false
                } else {
                    stats.blocks_remaining += 1;
                    stats.bytes_remaining += size;
                    true
                }
            });
        }
        state.trash.retain(|_, copies| !copies.is_empty());
        Ok(stats)
    }

    async fn status(&self) -> KeepResult<VolumeStatus> {
        let state = self.state.lock();
        let used = state.bytes_used();
        Ok(VolumeStatus {
            device_id: self.device_id.clone(),
            bytes_free: self.capacity.map_or(u64::MAX, |c| c.saturating_sub(used)),
            bytes_used: used,
            full: self.capacity.is_some_and(|c| used >= c),
        })
    }

    fn writable(&self) -> bool {
        !self.read_only
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FOO: &str = "acbd18db4cc2f85cedef654fccc4a4d8";

    fn policy(ttl_secs: u64, lifetime_secs: u64) -> TrashPolicy {
        TrashPolicy {
            signature_ttl: Duration::from_secs(ttl_secs),
            trash_lifetime: Duration::from_secs(lifetime_secs),
        }
    }

    fn old() -> SystemTime {
        SystemTime::now() - Duration::from_secs(3600)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let vol = MemoryVolume::new("mem0");
        vol.put(FOO, b"foo").await.unwrap();
        let mut buf = vec![0u8; 16];
        let n = vol.get(FOO, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"foo");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let vol = MemoryVolume::new("mem0");
        let mut buf = vec![0u8; 16];
        assert!(vol.get(FOO, &mut buf).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_too_large_leaves_buffer_untouched() {
        let vol = MemoryVolume::new("mem0");
        vol.put(FOO, b"foo").await.unwrap();
        let mut buf = [9u8; 2];
        let err = vol.get(FOO, &mut buf).await.unwrap_err();
        assert!(matches!(err, KeepError::TooLarge { size: 3, capacity: 2 }));
        assert_eq!(buf, [9, 9]);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let vol = MemoryVolume::new("mem0").with_read_only(true);
        assert!(matches!(vol.put(FOO, b"foo").await, Err(KeepError::ReadOnly)));
        assert!(!vol.writable());
        vol.store_raw(FOO, b"foo", old());
        assert!(matches!(vol.touch(FOO).await, Err(KeepError::ReadOnly)));
        assert!(matches!(
            vol.trash(FOO, policy(0, 0)).await,
            Err(KeepError::MethodDisabled { .. })
        ));
    }

    #[tokio::test]
    async fn test_trash_when_read_only() {
        let vol = MemoryVolume::new("mem0")
            .with_read_only(true)
            .with_trash_when_read_only(true);
        vol.store_raw(FOO, b"foo", old());
        vol.trash(FOO, policy(60, 3600)).await.unwrap();
        vol.untrash(FOO).await.unwrap();
        assert!(matches!(vol.put(FOO, b"foo").await, Err(KeepError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_capacity_full() {
        let vol = MemoryVolume::new("mem0").with_capacity(4);
        vol.put(FOO, b"foo").await.unwrap();
        // overwrite of the same block fits
        vol.put(FOO, b"foo").await.unwrap();
        assert!(matches!(
            vol.put("37b51d194a7513e45b56f6524f2d51f2", b"bar").await,
            Err(KeepError::Full)
        ));
        assert_eq!(vol.block_count(), 1);
    }

    #[tokio::test]
    async fn test_touch_updates_mtime() {
        let vol = MemoryVolume::new("mem0");
        vol.store_raw(FOO, b"foo", old());
        let before = SystemTime::now();
        vol.touch(FOO).await.unwrap();
        let mtime = vol.mtime(FOO).await.unwrap();
        assert!(mtime + Duration::from_secs(1) >= before);
    }

    #[tokio::test]
    async fn test_touch_missing() {
        let vol = MemoryVolume::new("mem0");
        assert!(vol.touch(FOO).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_trash_recent_block_is_kept() {
        let vol = MemoryVolume::new("mem0");
        vol.put(FOO, b"foo").await.unwrap();
        assert!(!vol.trash(FOO, policy(3600, 3600)).await.unwrap());
        let mut buf = [0u8; 3];
        assert_eq!(vol.get(FOO, &mut buf).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_trash_untrash() {
        let vol = MemoryVolume::new("mem0");
        let mtime = old();
        vol.store_raw(FOO, b"foo", mtime);
        assert!(vol.trash(FOO, policy(60, 3600)).await.unwrap());
        let mut buf = [0u8; 3];
        assert!(vol.get(FOO, &mut buf).await.unwrap_err().is_not_found());
        assert_eq!(vol.trash_count(), 1);

        vol.untrash(FOO).await.unwrap();
        assert_eq!(vol.get(FOO, &mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"foo");
        assert_eq!(vol.mtime(FOO).await.unwrap(), mtime);
        assert_eq!(vol.trash_count(), 0);
    }

    #[tokio::test]
    async fn test_untrash_missing() {
        let vol = MemoryVolume::new("mem0");
        assert!(vol.untrash(FOO).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_zero_lifetime_purges() {
        let vol = MemoryVolume::new("mem0");
        vol.store_raw(FOO, b"foo", old());
        vol.trash(FOO, policy(60, 0)).await.unwrap();
        assert_eq!(vol.block_count(), 0);
        assert_eq!(vol.trash_count(), 0);
        assert!(vol.untrash(FOO).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_trash_respects_deadline() {
        let vol = MemoryVolume::new("mem0");
        vol.store_raw(FOO, b"foo", old());
        vol.trash(FOO, policy(60, 3600)).await.unwrap();
        let stats = vol.empty_trash().await.unwrap();
        assert_eq!(stats.blocks_deleted, 0);
        assert_eq!(stats.blocks_remaining, 1);
        assert_eq!(stats.bytes_remaining, 3);

        let bar = "37b51d194a7513e45b56f6524f2d51f2";
        vol.store_raw(bar, b"bar", old());
        vol.trash(bar, policy(60, 0)).await.unwrap();
        vol.state.lock().trash.get_mut(FOO).unwrap()[0].deadline = old();
        let stats = vol.empty_trash().await.unwrap();
        assert_eq!(stats.blocks_deleted, 1);
        assert_eq!(stats.bytes_deleted, 3);
        assert_eq!(vol.trash_count(), 0);
    }

    #[tokio::test]
    async fn test_index_excludes_trash_and_filters_prefix() {
        let vol = MemoryVolume::new("mem0");
        let bar = "37b51d194a7513e45b56f6524f2d51f2";
        vol.put(FOO, b"foo").await.unwrap();
        vol.store_raw(bar, b"bar", old());

        let mut out = Vec::new();
        vol.index("", &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);

        let mut out = Vec::new();
        vol.index("acb", &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(&format!("{}+3 ", FOO)));
        assert!(text.ends_with('\n'));

        vol.trash(bar, policy(60, 3600)).await.unwrap();
        let mut out = Vec::new();
        vol.index("37b", &mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_compare_outcomes() {
        let vol = MemoryVolume::new("mem0");
        assert!(vol.compare(FOO, b"foo").await.unwrap_err().is_not_found());
        vol.store_raw(FOO, b"fox", SystemTime::now());
        assert!(matches!(
            vol.compare(FOO, b"foo").await,
            Err(KeepError::Corrupt { .. })
        ));
        vol.store_raw(FOO, b"foo", SystemTime::now());
        assert!(vol.compare(FOO, b"foo").await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_volume_errors() {
        let vol = MemoryVolume::new("mem0");
        vol.put(FOO, b"foo").await.unwrap();
        vol.set_broken(true);
        let mut buf = [0u8; 3];
        assert!(matches!(vol.get(FOO, &mut buf).await, Err(KeepError::Io(_))));
        assert!(matches!(vol.put(FOO, b"foo").await, Err(KeepError::Io(_))));
    }

    #[tokio::test]
    async fn test_status_reports_usage() {
        let vol = MemoryVolume::new("mem0").with_capacity(10);
        vol.put(FOO, b"foo").await.unwrap();
        let status = vol.status().await.unwrap();
        assert_eq!(status.device_id, "mem0");
        assert_eq!(status.bytes_used, 3);
        assert_eq!(status.bytes_free, 7);
    }
}

/// Memory volume whose mtime lookup is followed by a touch, as if a write
/// landed right after the caller read the mtime.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct TouchedAfterMtime(pub MemoryVolume);

#[cfg(test)]
#[async_trait]
impl Volume for TouchedAfterMtime {
    async fn get(&self, hash: &str, buf: &mut [u8]) -> KeepResult<usize> {
        self.0.get(hash, buf).await
    }
    async fn compare(&self, hash: &str, data: &[u8]) -> KeepResult<()> {
        self.0.compare(hash, data).await
    }
    async fn put(&self, hash: &str, data: &[u8]) -> KeepResult<()> {
        self.0.put(hash, data).await
    }
    async fn touch(&self, hash: &str) -> KeepResult<()> {
        self.0.touch(hash).await
    }
    async fn mtime(&self, hash: &str) -> KeepResult<SystemTime> {
        let mtime = self.0.mtime(hash).await?;
        self.0.touch(hash).await?;
        Ok(mtime)
    }
    async fn index(&self, prefix: &str, out: &mut (dyn AsyncWrite + Unpin + Send)) -> KeepResult<()> {
        self.0.index(prefix, out).await
    }
    async fn trash(&self, hash: &str, policy: TrashPolicy) -> KeepResult<bool> {
        self.0.trash(hash, policy).await
    }
    async fn untrash(&self, hash: &str) -> KeepResult<()> {
        self.0.untrash(hash).await
    }
    async fn empty_trash(&self) -> KeepResult<EmptyTrashStats> {
        self.0.empty_trash().await
    }
    async fn status(&self) -> KeepResult<VolumeStatus> {
        self.0.status().await
    }
    fn writable(&self) -> bool {
        true
    }
    fn device_id(&self) -> String {
        self.0.device_id()
    }
}
