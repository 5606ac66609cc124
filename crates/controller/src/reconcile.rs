//! Worker loop: pop a key, re-read the cache, sync, settle the key.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use herald_core::{ErrorSink, Object, ObjectKey, StoreError};
use herald_queue::WorkQueue;
use herald_store::LocalCache;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::ControllerError;

/// Domain sync function. Must be idempotent: it may run any number of times
/// for the same object, and an object already in its terminal state must
/// come back `Ok` without side effects.
#[async_trait]
pub trait Reconcile<K: Object>: Send + Sync {
    async fn sync(&self, obj: Arc<K>) -> Result<(), SyncError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
    #[error("action failed: {0}")]
    Action(String),
}

#[derive(Debug, thiserror::Error)]
#[error("error syncing {key}")]
pub struct ReconcileError {
    pub key: ObjectKey,
    #[source]
    pub source: SyncError,
}

pub(crate) struct Worker<K: Object> {
    pub(crate) cache: Arc<LocalCache<K>>,
    pub(crate) queue: WorkQueue<ObjectKey>,
    pub(crate) reconciler: Arc<dyn Reconcile<K>>,
    pub(crate) sink: Arc<dyn ErrorSink>,
    pub(crate) max_retries: Option<u32>,
}

impl<K: Object> Worker<K> {
    pub(crate) async fn run(self: Arc<Self>, id: usize) {
        debug!(worker = id, kind = K::KIND, "worker started");
        while self.process_next().await {}
        debug!(worker = id, kind = K::KIND, "worker stopped");
    }

    /// Handle one key. `false` once the queue has shut down.
    pub(crate) async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.handle(&key).await;
        true
    }

    async fn handle(&self, key: &ObjectKey) {
        // always the freshest cached state, never the event's snapshot
        let Some(obj) = self.cache.get(key) else {
            debug!(key = %key, "not in cache; object deleted, nothing to do");
            self.queue.done(key);
            self.queue.forget(key);
            return;
        };

        debug!(key = %key, "syncing");
        let t0 = Instant::now();
        counter!("herald_reconcile_total", 1u64);
        let res = self.reconciler.sync(obj).await;
        histogram!("herald_reconcile_seconds", t0.elapsed().as_secs_f64());

        match res {
            Ok(()) => {
                self.queue.done(key);
                self.queue.forget(key);
                info!(key = %key, took_ms = %t0.elapsed().as_millis(), "synced");
            }
            Err(source) => {
                counter!("herald_reconcile_errors", 1u64);
                self.sink.report(&ReconcileError { key: key.clone(), source });
                let attempts = self.queue.num_requeues(key).saturating_add(1);
                match self.max_retries {
                    Some(max) if attempts > max => {
                        warn!(key = %key, attempts, "giving up on key");
                        self.queue.forget(key);
                        self.sink.report(&ControllerError::RetriesExhausted { key: key.clone(), attempts });
                    }
                    _ => self.queue.add_rate_limited(key.clone()),
                }
                self.queue.done(key);
            }
        }
    }
}
