use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::session::FileKey;
use crate::PcapError;

struct Entry<T> {
    cell: Arc<OnceCell<Arc<T>>>,
    refs: usize,
    generation: u64,
}

/// Process-wide table of open file handles
///
/// Handles are shared by every concurrent user of the same file and stay
/// open for a grace period after the last lease is dropped, so a request
/// arriving shortly after reuses the descriptor. Read-mode and write-mode
/// handles live in separate registries.
pub struct FileRegistry<T> {
    entries: Mutex<HashMap<FileKey, Entry<T>>>,
    grace: Duration,
}

impl<T: Send + Sync + 'static> FileRegistry<T> {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(FileRegistry {
            entries: Mutex::new(HashMap::new()),
            grace,
        })
    }

    /// Get a lease on the handle for `key`, opening it with `open` if needed
    ///
    /// Concurrent callers for the same key wait on a single open. A failed
    /// open is not cached: the next caller tries again.
    pub async fn acquire<F, Fut>(self: &Arc<Self>, key: FileKey, open: F) -> Result<FileLease<T>, PcapError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PcapError>>,
    {
        let cell = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                cell: Arc::new(OnceCell::new()),
                refs: 0,
                generation: 0,
            });
            entry.refs += 1;
            // invalidates any pending eviction
            entry.generation += 1;
            entry.cell.clone()
        };
        let guard = LeaseGuard {
            registry: self.clone(),
            key,
        };
        let handle = cell.get_or_try_init(|| async { open().await.map(Arc::new) }).await?.clone();
        Ok(FileLease { handle, _guard: guard })
    }

    /// Number of handles currently held open (leased or awaiting eviction)
    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|e| e.cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.cell.initialized())
            .unwrap_or(false)
    }

    fn release(self: &Arc<Self>, key: &FileKey) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        if !entry.cell.initialized() || self.grace.is_zero() {
            entries.remove(key);
            return;
        }
        let generation = entry.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let registry: Weak<Self> = Arc::downgrade(self);
                let key = key.clone();
                let grace = self.grace;
                trace!(%key, ?grace, "scheduling handle eviction");
                rt.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.evict(&key, generation);
                    }
                });
            }
            Err(_) => {
                entries.remove(key);
            }
        }
    }

    fn evict(&self, key: &FileKey, generation: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.refs == 0 && entry.generation == generation {
                entries.remove(key);
                debug!(%key, "closed idle capture file");
            }
        }
    }
}

struct LeaseGuard<T: Send + Sync + 'static> {
    registry: Arc<FileRegistry<T>>,
    key: FileKey,
}

impl<T: Send + Sync + 'static> Drop for LeaseGuard<T> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Shared reference to an open handle; releases it when dropped
pub struct FileLease<T: Send + Sync + 'static> {
    handle: Arc<T>,
    _guard: LeaseGuard<T>,
}

impl<T: Send + Sync + 'static> FileLease<T> {
    pub fn key(&self) -> &FileKey {
        &self._guard.key
    }
}

impl<T: Send + Sync + 'static> Deref for FileLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.handle
    }
}
