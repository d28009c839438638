//! Shared fixtures for keepstore integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use keepstore::{
    BlockSource, BufferPool, KeepError, KeepResult, Keepstore, KeepstoreConfig, ManagerOptions, MemoryVolume, Mount,
    VolumeConfig, VolumeManager,
};
use parking_lot::Mutex;

pub const FOO: &str = "acbd18db4cc2f85cedef654fccc4a4d8";
pub const BAR: &str = "37b51d194a7513e45b56f6524f2d51f2";

/// One in-memory volume of a test node.
pub struct TestVolume {
    pub uuid: String,
    pub classes: Vec<String>,
    pub replication: u32,
    pub volume: Arc<MemoryVolume>,
}

impl TestVolume {
    pub fn new(uuid: &str, classes: &[&str]) -> Self {
        Self {
            uuid: uuid.to_string(),
            classes: classes.iter().map(|c| c.to_string()).collect(),
            replication: 1,
            volume: Arc::new(MemoryVolume::new(uuid)),
        }
    }

    pub fn replication(mut self, n: u32) -> Self {
        self.replication = n;
        self
    }
}

/// A node over memory volumes, keeping handles to each volume.
pub struct TestNode {
    pub node: Keepstore,
    pub volumes: Vec<Arc<MemoryVolume>>,
}

impl TestNode {
    pub fn new(config: KeepstoreConfig, vols: Vec<TestVolume>) -> Self {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for v in vols {
            let mut vc = VolumeConfig::memory(&v.uuid).with_classes(v.classes.iter().cloned());
            vc.replication = v.replication;
            let priority = config.priority_of(&vc.storage_classes);
            mounts.push(Mount::new(&vc, v.volume.clone(), priority));
            volumes.push(v.volume);
        }
        let manager = VolumeManager::new(mounts, BufferPool::new(8, 1 << 20), ManagerOptions::from(&config));
        Self {
            node: Keepstore::with_manager(config, manager),
            volumes,
        }
    }

    pub fn blocks_stored(&self) -> usize {
        self.volumes.iter().map(|v| v.block_count()).sum()
    }
}

/// Config with short signature TTL and trash enabled.
pub fn test_config() -> KeepstoreConfig {
    KeepstoreConfig {
        blob_signing_ttl_secs: 60,
        blob_trash_lifetime_secs: 3600,
        system_root_token: Some("root-token".to_string()),
        ..Default::default()
    }
}

pub fn hour_ago() -> SystemTime {
    SystemTime::now() - Duration::from_secs(3600)
}

/// Block source serving fixed contents per server.
#[derive(Default)]
pub struct StaticSource {
    pub blocks: HashMap<String, HashMap<String, Vec<u8>>>,
    pub fetches: Mutex<Vec<String>>,
}

impl StaticSource {
    pub fn serve(mut self, server: &str, data: &[u8]) -> Self {
        self.blocks
            .entry(server.to_string())
            .or_default()
            .insert(keepstore::block_hash(data), data.to_vec());
        self
    }
}

#[async_trait]
impl BlockSource for StaticSource {
    async fn fetch(&self, server: &str, locator: &str, _token: &str) -> KeepResult<Vec<u8>> {
        self.fetches.lock().push(format!("{}/{}", server, locator));
        let hash = &locator[..32];
        self.blocks
            .get(server)
            .and_then(|b| b.get(hash))
            .cloned()
            .ok_or_else(|| KeepError::not_found(hash))
    }
}
