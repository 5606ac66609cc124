//! List+watch loop that keeps a [`LocalCache`] current and fans changes out to handlers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use herald_core::{ErrorSink, Object, ResourceStore, Selector, StoreError, StoreResult, TracingErrorSink, WatchEvent};
use herald_queue::backoff_delay;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Change, LocalCache};

/// Receives cache transitions. Called on the informer task; must not block.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &Arc<K>);
}

#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Re-deliver every cached object as an update at this period. `None` disables.
    pub resync_period: Option<Duration>,
    pub watch_backoff_base: Duration,
    pub watch_backoff_max: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Some(Duration::from_secs(30)),
            watch_backoff_base: Duration::from_millis(500),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for cache sync")]
    Timeout(Duration),
    #[error("informer stopped before the cache synced")]
    Stopped,
}

/// Read side of the cache-sync latch.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    rx: watch::Receiver<bool>,
}

impl SyncHandle {
    /// True once the initial listing has been fully applied to the cache.
    pub fn has_synced(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<(), WaitError> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(WaitError::Stopped),
            Err(_) => Err(WaitError::Timeout(timeout)),
        }
    }
}

pub struct Informer<K: Object> {
    store: Arc<dyn ResourceStore<K>>,
    selector: Selector,
    config: InformerConfig,
    cache: Arc<LocalCache<K>>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
    sink: Arc<dyn ErrorSink>,
    synced_tx: watch::Sender<bool>,
}

impl<K: Object> Informer<K> {
    pub fn new(store: Arc<dyn ResourceStore<K>>, selector: Selector, config: InformerConfig) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            store,
            selector,
            config,
            cache: Arc::new(LocalCache::new()),
            handlers: Vec::new(),
            sink: Arc::new(TracingErrorSink),
            synced_tx,
        }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn cache(&self) -> Arc<LocalCache<K>> {
        Arc::clone(&self.cache)
    }

    pub fn sync_handle(&self) -> SyncHandle {
        SyncHandle { rx: self.synced_tx.subscribe() }
    }

    /// List, then watch until `cancel` fires. A closed watch is reopened from the
    /// last seen version, an expired one (`Gone`) triggers a relist, and list/watch
    /// failures are reported and retried with backoff.
    pub async fn run(self, cancel: CancellationToken) {
        info!(kind = K::KIND, ns = ?self.selector.namespace, "informer started");
        let mut failures: u32 = 0;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.list_and_watch() => res,
            };
            match outcome {
                Ok(()) => {
                    failures = 0;
                    debug!(kind = K::KIND, "relisting");
                }
                Err(e) => {
                    self.sink.report(&e);
                    let delay = backoff_delay(self.config.watch_backoff_base, self.config.watch_backoff_max, failures);
                    failures = failures.saturating_add(1);
                    warn!(kind = K::KIND, error = %e, delay_ms = %delay.as_millis(), "list/watch failed; backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(kind = K::KIND, "informer stopped");
    }

    async fn list_and_watch(&self) -> StoreResult<()> {
        let list = self.store.list(&self.selector).await?;
        counter!("herald_watch_relists", 1u64);
        let count = list.items.len();
        self.apply_listing(list.items);
        if !*self.synced_tx.borrow() {
            self.synced_tx.send_replace(true);
            info!(kind = K::KIND, count, rv = %list.resource_version, "cache synced");
        }

        let mut rv = list.resource_version;
        let mut resync = self.config.resync_period.map(|period| {
            let mut i = interval_at(Instant::now() + period, period);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });
        // a watch that simply ends is resumed from the last seen version; only Gone forces a relist
        loop {
            let mut stream = match self.store.watch(&self.selector, &rv).await {
                Ok(stream) => stream,
                Err(StoreError::Gone(msg)) => {
                    debug!(kind = K::KIND, rv = %rv, reason = %msg, "watch version expired");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(ev)) => {
                            if let Some(seen) = self.apply_event(ev) {
                                rv = seen;
                            }
                        }
                        Some(Err(StoreError::Gone(msg))) => {
                            debug!(kind = K::KIND, reason = %msg, "watch expired");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            counter!("herald_watch_restarts", 1u64);
                            debug!(kind = K::KIND, rv = %rv, "watch closed; resuming");
                            break;
                        }
                    },
                    _ = tick(&mut resync) => self.resync(),
                }
            }
        }
    }

    fn apply_listing(&self, items: Vec<K>) {
        let mut keyed = Vec::with_capacity(items.len());
        for obj in items {
            match obj.key() {
                Ok(key) => keyed.push((key, obj)),
                Err(e) => self.sink.report(&e),
            }
        }
        let changes = self.cache.replace(keyed);
        gauge!("herald_cache_objects", self.cache.len() as f64);
        for change in changes {
            self.dispatch(change);
        }
    }

    /// Apply one watch event; returns the resource version it carried.
    fn apply_event(&self, ev: WatchEvent<K>) -> Option<String> {
        counter!("herald_watch_events", 1u64);
        let seen = ev.object().meta().resource_version.clone();
        let key = match ev.object().key() {
            Ok(key) => key,
            Err(e) => {
                self.sink.report(&e);
                return seen;
            }
        };
        let change = match ev {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => self.cache.upsert(key, obj),
            WatchEvent::Deleted(obj) => self.cache.remove(&key, obj),
        };
        gauge!("herald_cache_objects", self.cache.len() as f64);
        self.dispatch(change);
        seen
    }

    fn resync(&self) {
        let items = self.cache.list();
        debug!(kind = K::KIND, count = items.len(), "periodic resync");
        for obj in &items {
            for h in &self.handlers {
                h.on_update(obj, obj);
            }
        }
    }

    fn dispatch(&self, change: Change<K>) {
        for h in &self.handlers {
            match &change {
                Change::Added(obj) => h.on_add(obj),
                Change::Updated { old, new } => h.on_update(old, new),
                Change::Deleted(obj) => h.on_delete(obj),
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
