//! Event filter: turns cache transitions into queue keys.

use std::sync::Arc;

use herald_core::{ErrorSink, KeyError, Object, ObjectKey};
use herald_queue::WorkQueue;
use herald_store::EventHandler;
use metrics::counter;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
#[error("cannot derive key for {kind} event; dropped")]
pub struct EnqueueError {
    pub kind: &'static str,
    #[source]
    pub source: KeyError,
}

/// Adds and deletes always enqueue; updates only when the object changed.
///
/// "Changed" is a full structural comparison of the old and new object, so
/// the no-op updates produced by relists and periodic resyncs are dropped here.
pub struct Enqueuer {
    queue: WorkQueue<ObjectKey>,
    sink: Arc<dyn ErrorSink>,
}

impl Enqueuer {
    pub fn new(queue: WorkQueue<ObjectKey>, sink: Arc<dyn ErrorSink>) -> Self {
        Self { queue, sink }
    }

    fn enqueue<K: Object>(&self, obj: &K) {
        match obj.key() {
            Ok(key) => {
                trace!(key = %key, "enqueue");
                counter!("herald_events_enqueued", 1u64);
                self.queue.add(key);
            }
            Err(source) => self.sink.report(&EnqueueError { kind: K::KIND, source }),
        }
    }
}

impl<K: Object> EventHandler<K> for Enqueuer {
    fn on_add(&self, obj: &Arc<K>) {
        self.enqueue(obj.as_ref());
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        if **old == **new {
            counter!("herald_events_filtered", 1u64);
            return;
        }
        self.enqueue(new.as_ref());
    }

    fn on_delete(&self, obj: &Arc<K>) {
        self.enqueue(obj.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::Message;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl ErrorSink for Collect {
        fn report(&self, err: &(dyn std::error::Error + 'static)) {
            self.0.lock().unwrap().push(err.to_string());
        }
    }

    fn setup() -> (WorkQueue<ObjectKey>, Arc<Collect>, Enqueuer) {
        let q = WorkQueue::with_backoff(Duration::from_millis(5), Duration::from_millis(50), &CancellationToken::new());
        let sink = Arc::new(Collect::default());
        let e = Enqueuer::new(q.clone(), sink.clone());
        (q, sink, e)
    }

    fn msg(header: &str) -> Arc<Message> {
        Arc::new(Message::new("default", "m1", header, "B"))
    }

    #[test]
    fn unchanged_update_is_filtered() {
        let (q, _, e) = setup();
        EventHandler::<Message>::on_update(&e, &msg("H"), &msg("H"));
        assert!(q.is_empty());
    }

    #[test]
    fn changed_update_enqueues_once_per_key() {
        let (q, _, e) = setup();
        EventHandler::<Message>::on_update(&e, &msg("H"), &msg("H1"));
        EventHandler::<Message>::on_update(&e, &msg("H1"), &msg("H2"));
        EventHandler::<Message>::on_update(&e, &msg("H2"), &msg("H3"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn status_only_change_counts_as_change() {
        let (q, _, e) = setup();
        let mut sent = (*msg("H")).clone();
        sent.status.sent = true;
        EventHandler::<Message>::on_update(&e, &msg("H"), &Arc::new(sent));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn add_and_delete_always_enqueue() {
        let (q, _, e) = setup();
        EventHandler::<Message>::on_add(&e, &msg("H"));
        EventHandler::<Message>::on_delete(&e, &Arc::new(Message::new("default", "m2", "H", "B")));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn nameless_object_is_reported_and_dropped() {
        let (q, sink, e) = setup();
        EventHandler::<Message>::on_add(&e, &Arc::new(Message::new("default", "", "H", "B")));
        assert!(q.is_empty());
        let reported = sink.0.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("Message"));
    }
}
