//! Per-key FIFO serialization.
//!
//! `KeyedMutex` hands out at most one guard per key at a time, waking waiters
//! in acquisition order (the underlying `tokio::sync::Mutex` queues waiters
//! fairly). A key's entry is discarded once its last holder or waiter is
//! gone, so the map stays bounded by the number of concurrently contested
//! keys. Not re-entrant: a holder must not acquire the same key again.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    holders: usize,
}

/// FIFO lock keyed by string. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct KeyedMutex {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every earlier acquirer of `key` has released.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            entry.lock.clone()
        };
        let guard = lock.lock_owned().await;
        KeyedGuard {
            entries: self.entries.clone(),
            key: key.to_string(),
            _guard: Some(guard),
        }
    }

    /// Number of keys currently tracked (held or contested).
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Releases the key on drop.
pub struct KeyedGuard {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    key: String,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Release the async mutex before touching the map so a queued waiter
        // never observes a missing entry.
        self._guard.take();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(&self.key);
            }
        }
    }
}
