//! Herald controller: wires the informer, the event filter, the work queue
//! and the worker loops into one reconciliation controller.
//!
//! Lifecycle: [`Controller::start`] blocks until the cache has synced (or
//! fails), then [`Controller::run`] processes keys until the cancellation
//! token fires and the in-flight work has drained.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use herald_core::{ErrorSink, Object, ObjectKey, ResourceStore, TracingErrorSink};
use herald_queue::WorkQueue;
use herald_store::{Informer, LocalCache, SyncHandle, WaitError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod config;
pub mod enqueue;
pub mod message;
pub mod reconcile;

pub use config::ControllerConfig;
pub use enqueue::Enqueuer;
pub use message::{LogNotifier, MessageSync, Notifier, NotifyError};
pub use reconcile::{Reconcile, ReconcileError, SyncError};

use reconcile::Worker;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("timed out after {0:?} waiting for cache sync")]
    CacheSyncTimeout(Duration),
    #[error("informer stopped before the cache synced")]
    InformerStopped,
    #[error("controller already started")]
    AlreadyStarted,
    #[error("controller not started; call start() first")]
    NotStarted,
    #[error("worker terminated abnormally: {0}")]
    WorkerFailed(String),
    #[error("giving up on {key} after {attempts} failed attempts")]
    RetriesExhausted { key: ObjectKey, attempts: u32 },
}

impl From<WaitError> for ControllerError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout(d) => ControllerError::CacheSyncTimeout(d),
            WaitError::Stopped => ControllerError::InformerStopped,
        }
    }
}

pub struct Controller<K: Object> {
    reconciler: Arc<dyn Reconcile<K>>,
    config: ControllerConfig,
    sink: Arc<dyn ErrorSink>,
    cancel: CancellationToken,
    informer_cancel: CancellationToken,
    cache: Arc<LocalCache<K>>,
    queue: WorkQueue<ObjectKey>,
    synced: SyncHandle,
    informer: Option<Informer<K>>,
    informer_task: Option<JoinHandle<()>>,
}

impl<K: Object> Controller<K> {
    /// Controller over `store`. Everything it spawns stops when `cancel` fires.
    pub fn new(
        store: Arc<dyn ResourceStore<K>>,
        reconciler: Arc<dyn Reconcile<K>>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let informer = Informer::new(store, config.selector.clone(), config.informer_config());
        let queue = WorkQueue::with_backoff(config.backoff_base, config.backoff_max, &cancel);
        Self {
            reconciler,
            sink: Arc::new(TracingErrorSink),
            informer_cancel: cancel.child_token(),
            cancel,
            cache: informer.cache(),
            synced: informer.sync_handle(),
            queue,
            informer: Some(informer),
            informer_task: None,
            config,
        }
    }

    /// Route non-fatal errors to `sink` instead of the log.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.informer = self.informer.take().map(|i| i.with_error_sink(Arc::clone(&sink)));
        self.sink = sink;
        self
    }

    pub fn cache(&self) -> Arc<LocalCache<K>> {
        Arc::clone(&self.cache)
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn has_synced(&self) -> bool {
        self.synced.has_synced()
    }

    /// Start the informer and wait for the initial listing to land in the cache.
    /// A timeout is fatal: the informer is stopped and the error returned.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        let mut informer = self.informer.take().ok_or(ControllerError::AlreadyStarted)?;
        informer.add_handler(Arc::new(Enqueuer::new(self.queue.clone(), Arc::clone(&self.sink))));
        self.informer_task = Some(tokio::spawn(informer.run(self.informer_cancel.clone())));

        let timeout = self.config.cache_sync_timeout;
        info!(kind = K::KIND, timeout_secs = %timeout.as_secs_f64(), "waiting for cache sync");
        if let Err(e) = self.synced.wait_for_sync(timeout).await {
            error!(kind = K::KIND, error = %e, "cache sync failed");
            self.informer_cancel.cancel();
            if let Some(task) = self.informer_task.take() {
                if let Err(join) = task.await {
                    error!(error = %join, "informer terminated abnormally");
                }
            }
            return Err(e.into());
        }
        info!(kind = K::KIND, objects = self.cache.len(), "cache synced; controller ready");
        Ok(())
    }

    /// Run the workers until cancellation, then drain and stop.
    /// Fails with `NotStarted` unless `start` succeeded.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        if !self.synced.has_synced() {
            return Err(ControllerError::NotStarted);
        }
        let informer_task = self.informer_task.take().ok_or(ControllerError::NotStarted)?;
        let workers = self.config.workers.max(1);
        let worker = Arc::new(Worker {
            cache: Arc::clone(&self.cache),
            queue: self.queue.clone(),
            reconciler: Arc::clone(&self.reconciler),
            sink: Arc::clone(&self.sink),
            max_retries: self.config.max_retries,
        });
        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(Arc::clone(&worker).run(id));
        }
        info!(kind = K::KIND, workers, "controller running");

        let mut failure: Option<ControllerError> = None;
        tokio::select! {
            _ = self.cancel.cancelled() => info!(kind = K::KIND, "shutdown requested"),
            Some(res) = set.join_next() => {
                if let Err(e) = res {
                    failure = Some(ControllerError::WorkerFailed(e.to_string()));
                }
            }
        }

        // in-flight syncs finish; idle workers see get() == None
        self.queue.shutdown();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker terminated abnormally");
                failure.get_or_insert(ControllerError::WorkerFailed(e.to_string()));
            }
        }
        self.informer_cancel.cancel();
        if let Err(e) = informer_task.await {
            error!(error = %e, "informer terminated abnormally");
            failure.get_or_insert(ControllerError::WorkerFailed(e.to_string()));
        }
        info!(kind = K::KIND, "controller stopped");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
