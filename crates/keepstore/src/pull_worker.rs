//! Pull workers: copy blocks from other servers onto local volumes.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{KeepError, KeepResult};
use crate::locator::{block_hash, Locator};
use crate::signing::BlobSigner;
use crate::volume_manager::VolumeManager;
use crate::work_queue::WorkQueue;

/// Lifetime of the signature attached to outgoing fetches.
pub const PULL_SIGNATURE_TTL: Duration = Duration::from_secs(60);

/// One entry of a pull list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Locator of the block to fetch.
    pub locator: String,
    /// Servers to try, in order.
    pub servers: Vec<String>,
    /// Store on this mount only; otherwise any mount the write path picks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_uuid: Option<String>,
}

/// Fetches a block from a remote keepstore.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch `locator` from `server`, authenticating with `token`.
    async fn fetch(&self, server: &str, locator: &str, token: &str) -> KeepResult<Vec<u8>>;
}

/// Executes pull requests.
pub struct Puller {
    manager: Arc<VolumeManager>,
    signer: Option<Arc<BlobSigner>>,
    token: String,
    source: Arc<dyn BlockSource>,
    timeout: Duration,
}

impl Puller {
    /// Create a puller writing through `manager`.
    pub fn new(
        manager: Arc<VolumeManager>,
        signer: Option<Arc<BlobSigner>>,
        token: impl Into<String>,
        source: Arc<dyn BlockSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            signer,
            token: token.into(),
            source,
            timeout,
        }
    }

    /// Fetch one block and store it locally.
    pub async fn pull(&self, req: &PullRequest, cancel: &CancellationToken) -> KeepResult<()> {
        let locator = Locator::parse(&req.locator)?.without_signature();
        let hash = locator.hash.as_str();
        if req.servers.is_empty() {
            return Err(KeepError::not_found(hash));
        }

        let signed = match &self.signer {
            Some(signer) => signer
                .sign_until(&locator, &self.token, SystemTime::now() + PULL_SIGNATURE_TTL)?
                .to_string(),
            None => locator.to_string(),
        };

        let capacity = self.manager.buffers().buffer_size();
        let mut fetched = None;
        let mut last_error = String::new();
        for server in &req.servers {
            let data = match tokio::time::timeout(
                self.timeout,
                self.source.fetch(server, &signed, &self.token),
            )
            .await
            {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => {
                    warn!(server = %server, hash, error = %e, "pull fetch failed");
                    last_error = e.to_string();
                    continue;
                }
                Err(_) => {
                    warn!(server = %server, hash, "pull fetch timed out");
                    last_error = "timed out".to_string();
                    continue;
                }
            };
            if block_hash(&data) != hash || locator.size.is_some_and(|s| s != data.len() as u64) {
                warn!(server = %server, hash, size = data.len(), "pulled data does not match locator");
                last_error = "content mismatch".to_string();
                continue;
            }
            if data.len() > capacity {
                last_error = format!("{} bytes exceeds buffer", data.len());
                continue;
            }
            fetched = Some((server.as_str(), data));
            break;
        }
        let Some((server, data)) = fetched else {
            return Err(KeepError::Fetch {
                server: req.servers.join(","),
                reason: last_error,
            });
        };

        let stored = match &req.mount_uuid {
            Some(uuid) => self.manager.put_to_mount(uuid, hash, &data, cancel).await?,
            None => self.manager.put(hash, &data, &[], cancel).await?,
        };
        info!(hash, server, replicas = stored.total_replication(), "pulled block");
        Ok(())
    }

    /// Process pull requests from `queue` until it closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, queue: WorkQueue<PullRequest>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = queue.next() => next,
            };
            let Some((req, ticket)) = next else {
                break;
            };
            if let Err(e) = self.pull(&req, &cancel).await {
                warn!(locator = %req.locator, error = %e, "pull failed");
            }
            ticket.done();
        }
        debug!("pull worker stopped");
    }
}

/// Start `workers` pull workers sharing `queue`.
pub fn spawn_pull_workers(
    puller: Arc<Puller>,
    queue: &WorkQueue<PullRequest>,
    workers: usize,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|_| tokio::spawn(puller.clone().run(queue.clone(), cancel.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::config::VolumeConfig;
    use crate::mount::Mount;
    use crate::volume::{MemoryVolume, TrashPolicy};
    use crate::volume_manager::ManagerOptions;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const FOO: &str = "acbd18db4cc2f85cedef654fccc4a4d8";

    #[derive(Default)]
    struct MockSource {
        blocks: HashMap<(String, String), Vec<u8>>,
        requests: Mutex<Vec<(String, String, String)>>,
    }

    impl MockSource {
        fn with_block(mut self, server: &str, hash: &str, data: &[u8]) -> Self {
            self.blocks.insert((server.to_string(), hash.to_string()), data.to_vec());
            self
        }
    }

    #[async_trait]
    impl BlockSource for MockSource {
        async fn fetch(&self, server: &str, locator: &str, token: &str) -> KeepResult<Vec<u8>> {
            self.requests
                .lock()
                .push((server.to_string(), locator.to_string(), token.to_string()));
            let hash = &locator[..32];
            self.blocks
                .get(&(server.to_string(), hash.to_string()))
                .cloned()
                .ok_or_else(|| KeepError::not_found(hash))
        }
    }

    fn manager(vols: &[(&str, Arc<MemoryVolume>)]) -> Arc<VolumeManager> {
        let mounts = vols
            .iter()
            .map(|(uuid, v)| Mount::new(&VolumeConfig::memory(uuid), v.clone(), 0))
            .collect();
        let options = ManagerOptions {
            trash_policy: TrashPolicy {
                signature_ttl: Duration::from_secs(60),
                trash_lifetime: Duration::from_secs(60),
            },
            default_classes: Vec::new(),
            volume_timeout: None,
        };
        Arc::new(VolumeManager::new(mounts, BufferPool::new(2, 1024), options))
    }

    fn request(servers: &[&str]) -> PullRequest {
        PullRequest {
            locator: format!("{}+3", FOO),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            mount_uuid: None,
        }
    }

    #[tokio::test]
    async fn test_pull_stores_block() {
        let vol = Arc::new(MemoryVolume::new("a"));
        let source = Arc::new(MockSource::default().with_block("s2", FOO, b"foo"));
        let signer = Arc::new(BlobSigner::new("key", Duration::from_secs(60)));
        let puller = Puller::new(manager(&[("va", vol.clone())]), Some(signer.clone()), "sys", source.clone(), Duration::from_secs(5));

        puller.pull(&request(&["s1", "s2"]), &CancellationToken::new()).await.unwrap();
        assert_eq!(vol.block_count(), 1);

        let requests = source.requests.lock().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "s1");
        let sent = Locator::parse(&requests[1].1).unwrap();
        assert!(sent.is_signed());
        signer.verify(&sent, "sys").unwrap();
        assert_eq!(requests[1].2, "sys");
    }

    #[tokio::test]
    async fn test_pull_rejects_bad_content() {
        let vol = Arc::new(MemoryVolume::new("a"));
        let source = Arc::new(MockSource::default().with_block("s1", FOO, b"bar"));
        let puller = Puller::new(manager(&[("va", vol.clone())]), None, "", source, Duration::from_secs(5));
        let err = puller.pull(&request(&["s1"]), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KeepError::Fetch { .. }));
        assert_eq!(vol.block_count(), 0);
    }

    #[tokio::test]
    async fn test_pull_to_named_mount() {
        let (a, b) = (Arc::new(MemoryVolume::new("a")), Arc::new(MemoryVolume::new("b")));
        let source = Arc::new(MockSource::default().with_block("s1", FOO, b"foo"));
        let puller = Puller::new(manager(&[("va", a.clone()), ("vb", b.clone())]), None, "", source, Duration::from_secs(5));
        let mut req = request(&["s1"]);
        req.mount_uuid = Some("vb".to_string());
        puller.pull(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(a.block_count(), 0);
        assert_eq!(b.block_count(), 1);
    }

    #[tokio::test]
    async fn test_pull_without_servers() {
        let puller = Puller::new(
            manager(&[("va", Arc::new(MemoryVolume::new("a")))]),
            None,
            "",
            Arc::new(MockSource::default()),
            Duration::from_secs(5),
        );
        let err = puller.pull(&request(&[]), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let vol = Arc::new(MemoryVolume::new("a"));
        let source = Arc::new(MockSource::default().with_block("s1", FOO, b"foo"));
        let mgr = manager(&[("va", vol.clone())]);
        let puller = Arc::new(Puller::new(mgr.clone(), None, "", source, Duration::from_secs(5)));
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        let handles = spawn_pull_workers(puller, &queue, 2, &cancel);

        let mut bad = request(&["s1"]);
        bad.locator = "37b51d194a7513e45b56f6524f2d51f2+3".to_string();
        queue.replace(vec![request(&["s1"]), bad]).await.unwrap();
        queue.wait_idle().await;
        assert_eq!(vol.block_count(), 1);
        assert_eq!(mgr.buffers().in_use(), 0);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[test]
    fn test_pull_request_json() {
        let json = r#"[{"locator":"acbd18db4cc2f85cedef654fccc4a4d8+3","servers":["http://s1:25107"]}]"#;
        let list: Vec<PullRequest> = serde_json::from_str(json).unwrap();
        assert_eq!(list[0].servers, vec!["http://s1:25107".to_string()]);
        assert!(list[0].mount_uuid.is_none());
    }
}
