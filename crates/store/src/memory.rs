//! In-memory [`ResourceStore`], used by tests and the local demo.
//!
//! Behaves like a small API server: resource versions increase on every
//! write, writes carrying a stale version conflict, and watches replay
//! retained history after the requested version before following live events.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use herald_core::{Object, ObjectKey, ObjectList, ResourceStore, Selector, StoreError, StoreResult, WatchEvent, WatchStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_HISTORY: usize = 1024;

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    revision: u64,
    /// Retained `(revision, event)` pairs, oldest first.
    history: VecDeque<(u64, WatchEvent<K>)>,
    /// Highest revision evicted from `history`.
    compacted: u64,
    fail_status_updates: usize,
    /// Cancelled by `close_watches`, then replaced.
    watch_epoch: CancellationToken,
}

pub struct MemoryStore<K: Object> {
    inner: Mutex<Inner<K>>,
    events: broadcast::Sender<(u64, WatchEvent<K>)>,
    history_cap: usize,
    writes: AtomicUsize,
    status_writes: AtomicUsize,
}

impl<K: Object> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> MemoryStore<K> {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Store that retains at most `cap` events for watch replay.
    pub fn with_history(cap: usize) -> Self {
        let cap = cap.max(1);
        let (events, _) = broadcast::channel(cap);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                compacted: 0,
                fail_status_updates: 0,
                watch_epoch: CancellationToken::new(),
            }),
            events,
            history_cap: cap,
            writes: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bump the revision, stamp `obj`, record and broadcast the event. Caller holds the lock.
    fn commit(&self, inner: &mut Inner<K>, ev: fn(K) -> WatchEvent<K>, mut obj: K) -> K {
        inner.revision = inner.revision.saturating_add(1);
        let rev = inner.revision;
        obj.meta_mut().resource_version = Some(rev.to_string());
        let event = ev(obj.clone());
        inner.history.push_back((rev, event.clone()));
        while inner.history.len() > self.history_cap {
            if let Some((old, _)) = inner.history.pop_front() {
                inner.compacted = old;
            }
        }
        // no receivers is fine
        let _ = self.events.send((rev, event));
        self.writes.fetch_add(1, Ordering::SeqCst);
        obj
    }

    fn check_version(key: &ObjectKey, stored: &K, incoming: &K) -> StoreResult<()> {
        match incoming.meta().resource_version.as_deref() {
            Some(rv) if Some(rv) != stored.meta().resource_version.as_deref() => Err(StoreError::Conflict {
                key: key.clone(),
                message: format!(
                    "the object has been modified (have {}, stored {})",
                    rv,
                    stored.meta().resource_version.as_deref().unwrap_or("-")
                ),
            }),
            _ => Ok(()),
        }
    }

    fn key_of(obj: &K) -> StoreResult<ObjectKey> {
        obj.key().map_err(|e| StoreError::Invalid(e.to_string()))
    }

    pub fn create(&self, obj: K) -> StoreResult<K> {
        let key = Self::key_of(&obj)?;
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict { key, message: "already exists".into() });
        }
        let mut obj = obj;
        let meta = obj.meta_mut();
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(chrono::Utc::now().to_rfc3339());
        let stored = self.commit(&mut inner, WatchEvent::Added, obj);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    pub fn delete(&self, key: &ObjectKey) -> StoreResult<K> {
        let mut inner = self.lock();
        let obj = inner.objects.remove(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(self.commit(&mut inner, WatchEvent::Deleted, obj))
    }

    /// Make the next `n` status writes fail with a conflict.
    pub fn fail_status_updates(&self, n: usize) {
        self.lock().fail_status_updates = n;
    }

    /// Successful status writes so far.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Successful writes of any kind so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn close_watches(&self) {
        let mut inner = self.lock();
        inner.watch_epoch.cancel();
        inner.watch_epoch = CancellationToken::new();
    }
}

struct WatchState<K> {
    backlog: VecDeque<WatchEvent<K>>,
    rx: broadcast::Receiver<(u64, WatchEvent<K>)>,
    selector: Selector,
    closed: CancellationToken,
    finished: bool,
}

async fn next_event<K: Object>(mut st: WatchState<K>) -> Option<(StoreResult<WatchEvent<K>>, WatchState<K>)> {
    if st.finished {
        return None;
    }
    if let Some(ev) = st.backlog.pop_front() {
        return Some((Ok(ev), st));
    }
    loop {
        let received = tokio::select! {
            _ = st.closed.cancelled() => None,
            msg = st.rx.recv() => Some(msg),
        };
        match received {
            None | Some(Err(RecvError::Closed)) => return None,
            Some(Err(RecvError::Lagged(n))) => {
                st.finished = true;
                return Some((Err(StoreError::Gone(format!("watcher fell behind by {} events", n))), st));
            }
            Some(Ok((_, ev))) => {
                if st.selector.matches(ev.object().meta()) {
                    return Some((Ok(ev), st));
                }
            }
        }
    }
}

#[async_trait]
impl<K: Object> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        self.lock().objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, selector: &Selector) -> StoreResult<ObjectList<K>> {
        let inner = self.lock();
        let items = inner.objects.values().filter(|o| selector.matches(o.meta())).cloned().collect();
        Ok(ObjectList { items, resource_version: inner.revision.to_string() })
    }

    async fn watch(&self, selector: &Selector, resource_version: &str) -> StoreResult<WatchStream<K>> {
        let inner = self.lock();
        let after = if resource_version.is_empty() {
            inner.revision
        } else {
            resource_version
                .parse::<u64>()
                .map_err(|_| StoreError::Invalid(format!("bad resource version {:?}", resource_version)))?
        };
        if after < inner.compacted {
            return Err(StoreError::Gone(format!("resource version {} is too old", after)));
        }
        let backlog: VecDeque<WatchEvent<K>> = inner
            .history
            .iter()
            .filter(|(rev, ev)| *rev > after && selector.matches(ev.object().meta()))
            .map(|(_, ev)| ev.clone())
            .collect();
        debug!(after, replay = backlog.len(), "memory watch opened");
        // subscribed under the lock: no write can slip between replay and live events
        let st = WatchState {
            backlog,
            rx: self.events.subscribe(),
            selector: selector.clone(),
            closed: inner.watch_epoch.clone(),
            finished: false,
        };
        drop(inner);
        Ok(futures::stream::unfold(st, next_event).boxed())
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = Self::key_of(obj)?;
        let mut inner = self.lock();
        let stored = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Self::check_version(&key, &stored, obj)?;
        let mut next = obj.clone();
        *next.status_mut() = stored.status().clone();
        next.meta_mut().uid = stored.meta().uid.clone();
        next.meta_mut().creation_timestamp = stored.meta().creation_timestamp.clone();
        let next = self.commit(&mut inner, WatchEvent::Modified, next);
        inner.objects.insert(key, next.clone());
        Ok(next)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let key = Self::key_of(obj)?;
        let mut inner = self.lock();
        if inner.fail_status_updates > 0 {
            inner.fail_status_updates -= 1;
            return Err(StoreError::Conflict { key, message: "injected status conflict".into() });
        }
        let stored = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Self::check_version(&key, &stored, obj)?;
        let mut next = stored;
        *next.status_mut() = obj.status().clone();
        let next = self.commit(&mut inner, WatchEvent::Modified, next);
        inner.objects.insert(key, next.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::Message;
    use std::time::Duration;

    fn store() -> MemoryStore<Message> {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn create_assigns_identity_and_version() {
        let s = store();
        let m = s.create(Message::new("default", "m1", "H", "B")).unwrap();
        assert!(m.metadata.uid.is_some());
        assert!(m.metadata.creation_timestamp.is_some());
        assert_eq!(m.metadata.resource_version.as_deref(), Some("1"));
        assert!(s.create(Message::new("default", "m1", "H", "B")).unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let s = store();
        let m = s.create(Message::new("default", "m1", "H", "B")).unwrap();
        let mut edited = m.clone();
        edited.spec.header = "H2".into();
        s.update(&edited).await.unwrap();

        let mut stale = m;
        stale.status.sent = true;
        assert!(s.update_status(&stale).await.unwrap_err().is_conflict());
        assert_eq!(s.status_writes(), 0);
    }

    #[tokio::test]
    async fn update_keeps_status_and_update_status_keeps_spec() {
        let s = store();
        let m = s.create(Message::new("default", "m1", "H", "B")).unwrap();

        let mut sent = m.clone();
        sent.status.sent = true;
        sent.spec.header = "ignored".into();
        let after = s.update_status(&sent).await.unwrap();
        assert!(after.status.sent);
        assert_eq!(after.spec.header, "H");

        let mut edit = after.clone();
        edit.spec.header = "H2".into();
        edit.status.sent = false;
        let after = s.update(&edit).await.unwrap();
        assert_eq!(after.spec.header, "H2");
        assert!(after.status.sent);
        assert_eq!(s.status_writes(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let s = store();
        let m = s.create(Message::new("default", "m1", "H", "B")).unwrap();
        s.fail_status_updates(1);
        assert!(s.update_status(&m).await.unwrap_err().is_conflict());
        assert!(s.update_status(&m).await.is_ok());
    }

    #[tokio::test]
    async fn watch_replays_after_list_version_then_follows() {
        let s = store();
        s.create(Message::new("default", "a", "H", "B")).unwrap();
        let list = s.list(&Selector::all()).await.unwrap();
        // written after the list but before the watch opened
        s.create(Message::new("default", "b", "H", "B")).unwrap();
        let mut w = s.watch(&Selector::all(), &list.resource_version).await.unwrap();
        s.create(Message::new("other", "c", "H", "B")).unwrap();

        let first = w.next().await.unwrap().unwrap();
        assert!(matches!(&first, WatchEvent::Added(m) if m.metadata.name == "b"));
        let second = tokio::time::timeout(Duration::from_secs(1), w.next()).await.unwrap().unwrap().unwrap();
        assert!(matches!(&second, WatchEvent::Added(m) if m.metadata.name == "c"));
    }

    #[tokio::test]
    async fn watch_filters_by_selector() {
        let s = store();
        let mut w = s.watch(&Selector::namespaced("prod"), "").await.unwrap();
        s.create(Message::new("dev", "x", "H", "B")).unwrap();
        s.create(Message::new("prod", "y", "H", "B")).unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(1), w.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(ev.object().metadata.name, "y");
    }

    #[tokio::test]
    async fn compacted_version_is_gone() {
        let s = MemoryStore::<Message>::with_history(2);
        for i in 0..5 {
            s.create(Message::new("default", format!("m{}", i), "H", "B")).unwrap();
        }
        let err = s.watch(&Selector::all(), "1").await.err().unwrap();
        assert!(matches!(err, StoreError::Gone(_)));
        assert!(s.watch(&Selector::all(), "4").await.is_ok());
    }

    #[tokio::test]
    async fn close_watches_ends_streams() {
        let s = store();
        let mut w = s.watch(&Selector::all(), "").await.unwrap();
        s.close_watches();
        let end = tokio::time::timeout(Duration::from_secs(1), w.next()).await.unwrap();
        assert!(end.is_none());
    }
}
