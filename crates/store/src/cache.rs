//! Read-optimized mirror of remote objects, written only by the informer.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use herald_core::{Object, ObjectKey};
use rustc_hash::FxHashMap;
use tokio::sync::watch;

/// Transition produced by applying a write to the cache.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Objects keyed by [`ObjectKey`]. Reads may lag the remote store.
pub struct LocalCache<K> {
    items: RwLock<FxHashMap<ObjectKey, Arc<K>>>,
    epoch_tx: watch::Sender<u64>,
}

impl<K: Object> Default for LocalCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> LocalCache<K> {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { items: RwLock::new(FxHashMap::default()), epoch_tx }
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of writes applied so far.
    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }

    /// Notified after every applied write.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    fn bump(&self) {
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
    }

    pub(crate) fn upsert(&self, key: ObjectKey, obj: K) -> Change<K> {
        let new = Arc::new(obj);
        let old = self.write().insert(key, Arc::clone(&new));
        self.bump();
        match old {
            Some(old) => Change::Updated { old, new },
            None => Change::Added(new),
        }
    }

    /// Remove `key`; `last` is the final state carried by the delete notification.
    pub(crate) fn remove(&self, key: &ObjectKey, last: K) -> Change<K> {
        self.write().remove(key);
        self.bump();
        Change::Deleted(Arc::new(last))
    }

    /// Replace the whole contents with a fresh listing.
    ///
    /// Every listed object yields `Added` or `Updated` (even when unchanged, so a
    /// relist re-delivers full state); keys missing from the listing yield `Deleted`.
    pub(crate) fn replace(&self, items: Vec<(ObjectKey, K)>) -> Vec<Change<K>> {
        let mut next: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
        next.reserve(items.len());
        let mut changes = Vec::with_capacity(items.len());
        {
            let mut current = self.write();
            for (key, obj) in items {
                let new = Arc::new(obj);
                match current.remove(&key) {
                    Some(old) => changes.push(Change::Updated { old, new: Arc::clone(&new) }),
                    None => changes.push(Change::Added(Arc::clone(&new))),
                }
                next.insert(key, new);
            }
            // leftovers vanished while we were not watching
            changes.extend(current.drain().map(|(_, old)| Change::Deleted(old)));
            *current = next;
        }
        self.bump();
        changes
    }
}
