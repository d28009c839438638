#![warn(missing_docs)]

//! Keepstore: content-addressed block storage node
//!
//! Blocks of up to 64 MiB are stored under the MD5 of their contents on one
//! or more volumes. This crate provides the volume abstraction with memory and
//! directory backends, replicated writes across storage classes, signed
//! locators, the trash lifecycle, and the pull/trash work queues.

pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod locator;
pub mod mount;
pub mod node;
pub mod pull_worker;
pub mod put_progress;
pub mod signing;
pub mod trash_worker;
pub mod volume;
pub mod volume_manager;
pub mod work_queue;

pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer, BLOCK_SIZE};
pub use config::{KeepstoreConfig, StorageClassConfig, VolumeConfig};
pub use error::{KeepError, KeepResult};
pub use locator::{block_hash, Locator};
pub use mount::{Mount, MountInfo};
pub use node::{Keepstore, NodeStatus, VolumeStatusEntry, WriteReceipt};
pub use pull_worker::{BlockSource, PullRequest, Puller};
pub use put_progress::PutProgress;
pub use signing::BlobSigner;
pub use trash_worker::{TrashRequest, Trasher};
pub use volume::{DirectoryVolume, DriverRegistry, EmptyTrashStats, MemoryVolume, TrashPolicy, Volume, VolumeStatus};
pub use volume_manager::{BlockRead, ManagerOptions, TrashOutcome, UntrashOutcome, VolumeManager};
pub use work_queue::{WorkQueue, WorkQueueStatus, WorkTicket};
