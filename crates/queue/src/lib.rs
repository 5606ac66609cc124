//! Herald work queue: deduplicating, single-flight, rate-limited queue of keys.
//!
//! Semantics:
//! - an item is pending at most once (`add` of a pending item is a no-op);
//! - an item handed out by `get` is *processing* until `done`; adds in the
//!   meantime are held and the item is requeued by `done`;
//! - `add_rate_limited` redelivers after a per-item backoff, `forget` resets it;
//! - after shutdown `add` is ignored, already queued items are still handed
//!   out and `get` returns `None` once the queue is empty.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod rate_limit;

pub use rate_limit::{backoff_delay, ExponentialBackoff, RateLimiter, MIN_BACKOFF};

/// Default backoff, matching the controller defaults: 5s doubling up to 1m.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

struct State<T> {
    queue: VecDeque<T>,
    /// Items that need processing: everything in `queue` plus items re-added while processing.
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    /// Child of the token given at construction; cancelled by `shutdown` too.
    stop: CancellationToken,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle; all clones share one queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    /// Queue that shuts down when `cancel` fires (or on an explicit `shutdown`).
    pub fn new(limiter: impl RateLimiter<T> + 'static, cancel: &CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
                stop: cancel.child_token(),
            }),
        }
    }

    pub fn with_backoff(base: Duration, max: Duration, cancel: &CancellationToken) -> Self {
        Self::new(ExponentialBackoff::new(base, max), cancel)
    }

    pub fn add(&self, item: T) {
        let mut st = self.shared.lock();
        if st.shutting_down || self.shared.stop.is_cancelled() {
            debug!(item = ?item, "queue shutting down; add ignored");
            return;
        }
        if st.dirty.contains(&item) {
            return;
        }
        counter!("herald_workqueue_adds", 1u64);
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            // held until the in-flight worker calls done()
            return;
        }
        st.queue.push_back(item);
        gauge!("herald_workqueue_depth", st.queue.len() as f64);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Wait for the next item. `None` means the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.lock();
                if self.shared.stop.is_cancelled() {
                    st.shutting_down = true;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let remaining = st.queue.len();
                    gauge!("herald_workqueue_depth", remaining as f64);
                    drop(st);
                    if remaining > 0 {
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.stop.cancelled() => {}
            }
        }
    }

    /// Mark `item` as no longer processing. Re-adds made meanwhile are queued now.
    pub fn done(&self, item: &T) {
        let mut st = self.shared.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            gauge!("herald_workqueue_depth", st.queue.len() as f64);
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Drop the failure history of `item` so its next retry starts at the base delay.
    pub fn forget(&self, item: &T) {
        self.shared.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.num_requeues(item)
    }

    /// Redeliver `item` after the limiter's backoff for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.when(&item);
        counter!("herald_workqueue_retries", 1u64);
        debug!(item = ?item, delay_ms = %delay.as_millis(), "requeue with backoff");
        self.add_after(item, delay);
    }

    /// Add `item` once `delay` elapses. Dropped if the queue shuts down first.
    /// Must be called from within a Tokio runtime.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = queue.shared.stop.cancelled() => {}
            }
        });
    }

    pub fn shutdown(&self) {
        self.shared.lock().shutting_down = true;
        self.shared.stop.cancel();
        self.shared.notify.notify_waiters();
        info!("work queue shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.stop.is_cancelled() || self.shared.lock().shutting_down
    }

    /// Pending items (excludes items being processed).
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn processing(&self) -> usize {
        self.shared.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::with_backoff(Duration::from_millis(10), Duration::from_millis(100), &CancellationToken::new())
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_is_held_until_done() {
        let q = queue();
        q.add("a");
        let item = q.get().await.unwrap();
        q.add("a");
        q.add("a");
        // not handed out again while in flight
        assert_eq!(q.len(), 0);
        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.processing(), 0);
    }

    #[tokio::test]
    async fn done_without_readd_drops_item() {
        let q = queue();
        q.add("a");
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_queued_items_then_reports_no_more_work() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.shutdown();
        q.add("c");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert_eq!(q.get().await, None);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn forget_resets_requeue_count() {
        let q = queue();
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }
}
