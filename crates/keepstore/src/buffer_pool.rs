//! Bounded pool of block-sized buffers.
//!
//! Every block read or write stages its bytes in a pooled buffer so total
//! memory stays under `max_buffers * buffer_size` no matter how many
//! requests are in flight. Buffers are recycled without being cleared.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{KeepError, KeepResult};

/// Maximum size of a single block: 64 MiB.
pub const BLOCK_SIZE: usize = 1 << 26;

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolStats {
    /// Bytes allocated for buffers over the pool's lifetime.
    pub bytes_allocated_cumulative: u64,
    /// Hard cap on checked-out buffers.
    pub buffers_max: usize,
    /// Buffers currently checked out.
    pub buffers_in_use: usize,
    /// Fresh allocations.
    pub alloc_count: u64,
    /// Checkouts served from the free list.
    pub reuse_count: u64,
    /// Buffers returned to the pool.
    pub return_count: u64,
}

impl BufferPoolStats {
    /// Fraction of checkouts that reused an existing buffer.
    pub fn hit_rate(&self) -> f64 {
        let total = self.alloc_count + self.reuse_count;
        if total == 0 {
            0.0
        } else {
            self.reuse_count as f64 / total as f64
        }
    }
}

struct PoolInner {
    buffer_size: usize,
    max_buffers: usize,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<BufferPoolStats>,
}

/// Shared handle to a bounded buffer pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool that hands out at most `max_buffers` buffers of `buffer_size` bytes.
    pub fn new(max_buffers: usize, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_buffers,
                permits: Arc::new(Semaphore::new(max_buffers)),
                free: Mutex::new(Vec::new()),
                stats: Mutex::new(BufferPoolStats {
                    buffers_max: max_buffers,
                    ..Default::default()
                }),
            }),
        }
    }

    /// Size of every buffer in the pool.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Check out a buffer with `size` visible bytes, waiting for one to be returned
    /// if the pool is at capacity.
    pub async fn get(&self, size: usize) -> KeepResult<PooledBuffer> {
        self.get_cancellable(size, &CancellationToken::new()).await
    }

    /// Like [`BufferPool::get`], but gives up with [`KeepError::Cancelled`]
    /// once `cancel` fires.
    pub async fn get_cancellable(
        &self,
        size: usize,
        cancel: &CancellationToken,
    ) -> KeepResult<PooledBuffer> {
        self.check_size(size)?;
        let permits = self.inner.permits.clone();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KeepError::Cancelled),
            permit = permits.acquire_owned() => permit.map_err(|_| KeepError::Cancelled)?,
        };
        Ok(self.checkout(size, permit))
    }

    /// Check out a buffer only if one is available right now.
    pub fn try_get(&self, size: usize) -> KeepResult<Option<PooledBuffer>> {
        self.check_size(size)?;
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(self.checkout(size, permit))),
            Err(_) => Ok(None),
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.buffers_in_use = self.in_use();
        stats
    }

    /// Number of buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.max_buffers - self.inner.permits.available_permits()
    }

    fn check_size(&self, size: usize) -> KeepResult<()> {
        if size > self.inner.buffer_size {
            return Err(KeepError::TooLarge {
                size: size as u64,
                capacity: self.inner.buffer_size as u64,
            });
        }
        Ok(())
    }

    fn checkout(&self, size: usize, permit: OwnedSemaphorePermit) -> PooledBuffer {
        let reused = self.inner.free.lock().pop();
        let data = match reused {
            Some(data) => {
                self.inner.stats.lock().reuse_count += 1;
                debug!("buffer_pool: reused buffer, in_use={}", self.in_use());
                data
            }
            None => {
                let mut stats = self.inner.stats.lock();
                stats.alloc_count += 1;
                stats.bytes_allocated_cumulative += self.inner.buffer_size as u64;
                debug!(
                    "buffer_pool: allocated buffer size={} total_allocs={}",
                    self.inner.buffer_size, stats.alloc_count
                );
                vec![0u8; self.inner.buffer_size]
            }
        };
        PooledBuffer {
            data,
            len: size,
            pool: self.inner.clone(),
            _permit: permit,
        }
    }
}

/// A checked-out buffer, returned to its pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    /// Full size of the underlying region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Change the visible length. Bytes past the last write hold stale data.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Mutable access to the whole region regardless of visible length.
    pub fn as_full_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.free.lock().push(data);
        self.pool.stats.lock().return_count += 1;
    }
}
