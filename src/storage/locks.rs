//! Per-key async lock registry.
//! One registry is created per store stack and shared by the layers built on it.
//! Entries are dropped from the map once the last guard for a key goes away.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{StoreError, StoreResult};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct LockRegistry {
    slots: Slots,
}

/// Held lock on one key. Released on drop.
pub struct KeyGuard {
    key: String,
    slots: Slots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockRegistry {
    pub fn new() -> Self { Self::default() }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.slots.lock();
        map.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Wait for exclusive access to `key`. Waiters are served FIFO.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = self.slot(key);
        let guard = slot.lock_owned().await;
        KeyGuard { key: key.to_string(), slots: self.slots.clone(), guard: Some(guard) }
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> StoreResult<KeyGuard> {
        let slot = self.slot(key);
        match slot.try_lock_owned() {
            Ok(guard) => Ok(KeyGuard { key: key.to_string(), slots: self.slots.clone(), guard: Some(guard) }),
            Err(_) => Err(StoreError::lock_contention(key.to_string())),
        }
    }

    /// Number of keys with a live slot (held or awaited).
    pub fn active_keys(&self) -> usize { self.slots.lock().len() }
}

fn drop_slot_if_idle(slots: &Slots, key: &str) {
    let mut map = slots.lock();
    if let Some(slot) = map.get(key) {
        // only the map itself still refers to the slot
        if Arc::strong_count(slot) == 1 {
            map.remove(key);
        }
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str { &self.key }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        drop_slot_if_idle(&self.slots, &self.key);
    }
}
