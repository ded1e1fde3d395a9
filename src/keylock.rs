//! Per-key async locks.
//!
//! Two operations targeting the same key run strictly one after another;
//! operations on different keys never wait on each other. Lock slots are
//! created on demand and dropped when the last holder or waiter goes away.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub struct KeyLocks<K: Hash + Eq + Clone> {
    slots: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

impl<K: Hash + Eq + Clone> Default for KeyLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone> KeyLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait until `key` is free and hold it until the guard is dropped.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = slot.clone().lock_owned().await;
        KeyGuard {
            key,
            slot,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Keys that currently have a holder or waiter.
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }
}

pub struct KeyGuard<K: Hash + Eq + Clone> {
    key: K,
    slot: Arc<AsyncMutex<()>>,
    slots: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Hash + Eq + Clone> KeyGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Hash + Eq + Clone> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.slots.lock();
        // One reference in the map, one in this guard: nobody else is waiting.
        if Arc::strong_count(&self.slot) <= 2
            && slots
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.slot))
        {
            slots.remove(&self.key);
        }
    }
}
