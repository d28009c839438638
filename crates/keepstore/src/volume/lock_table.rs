//! Per-locator exclusive locks for a single-process volume.
//!
//! Keys are spread over a fixed set of async mutexes. Two operations on the
//! same hash always contend; operations on different hashes usually don't.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

const DEFAULT_STRIPES: usize = 256;

/// Table of keyed exclusive locks.
#[derive(Debug)]
pub struct LockTable {
    stripes: Vec<Mutex<()>>,
}

impl LockTable {
    /// Creates a table with `stripes` independent locks (at least one).
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self { stripes }
    }

    /// Acquires exclusive access for `key`. Released when the guard drops.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(key)].lock().await
    }

    fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
