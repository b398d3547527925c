use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use deltabak_fs::path;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held while a chain is being merged; dropping it lets the next merge of that chain start.
pub type ChainGuard = OwnedMutexGuard<()>;

/// Single-flight merge locks keyed by chain root path.
///
/// Clones share the same lock table, so every reconciler running in a process should be given
/// clones of one `ChainLocks`. Merges of unrelated chains never wait on each other.
#[derive(Debug, Clone, Default)]
pub struct ChainLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ChainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, root: &str) -> ChainGuard {
        let lock = {
            let mut table = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Entries nobody holds or waits on can go.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table
                .entry(path::normalize(root))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of roots with a merge in flight or queued.
    pub fn active(&self) -> usize {
        let table = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        table
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}
