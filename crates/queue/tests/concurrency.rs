#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use herald_queue::WorkQueue;
use tokio_util::sync::CancellationToken;

fn queue(cancel: &CancellationToken) -> WorkQueue<u32> {
    WorkQueue::with_backoff(Duration::from_millis(20), Duration::from_millis(200), cancel)
}

#[tokio::test]
async fn shutdown_wakes_blocked_getter() {
    let q = queue(&CancellationToken::new());
    let waiter = tokio::spawn({
        let q = q.clone();
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());
    q.shutdown();
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("get did not return").unwrap();
    assert_eq!(got, None);
}

#[tokio::test]
async fn cancellation_token_shuts_queue_down() {
    let cancel = CancellationToken::new();
    let q = queue(&cancel);
    let waiter = tokio::spawn({
        let q = q.clone();
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("get did not return").unwrap();
    assert_eq!(got, None);
    assert!(q.is_shutting_down());
    q.add(1);
    assert!(q.is_empty());
}

#[tokio::test]
async fn blocked_getter_receives_later_add() {
    let q = queue(&CancellationToken::new());
    let waiter = tokio::spawn({
        let q = q.clone();
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.add(7);
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("get did not return").unwrap();
    assert_eq!(got, Some(7));
}

#[tokio::test]
async fn rate_limited_item_is_redelivered_after_backoff() {
    let q = queue(&CancellationToken::new());
    q.add(1);
    let item = q.get().await.unwrap();
    let t0 = Instant::now();
    q.add_rate_limited(item);
    q.done(&item);
    assert!(q.is_empty(), "item must wait out its backoff");
    let again = tokio::time::timeout(Duration::from_secs(1), q.get()).await.expect("not redelivered");
    assert_eq!(again, Some(1));
    assert!(t0.elapsed() >= Duration::from_millis(20));
    assert_eq!(q.num_requeues(&1), 1);
}

#[tokio::test]
async fn delayed_add_is_dropped_on_shutdown() {
    let q = queue(&CancellationToken::new());
    q.add_after(3, Duration::from_millis(50));
    q.shutdown();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(q.is_empty());
    assert_eq!(q.get().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_two_workers_hold_the_same_item() {
    let cancel = CancellationToken::new();
    let q = queue(&cancel);
    let in_flight: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let q = q.clone();
        let in_flight = Arc::clone(&in_flight);
        let violations = Arc::clone(&violations);
        let processed = Arc::clone(&processed);
        workers.push(tokio::spawn(async move {
            while let Some(item) = q.get().await {
                {
                    let mut held = in_flight.lock().unwrap();
                    if held.contains(&item) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    held.push(item);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.lock().unwrap().retain(|x| *x != item);
                processed.fetch_add(1, Ordering::SeqCst);
                q.done(&item);
            }
        }));
    }

    // Hammer a handful of keys while workers are busy with them.
    for round in 0..50u32 {
        for key in 0..3u32 {
            q.add(key);
        }
        if round % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.shutdown();
    for w in workers {
        tokio::time::timeout(Duration::from_secs(2), w).await.expect("worker did not exit").unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    // dedup keeps the work far below the 150 adds
    let n = processed.load(Ordering::SeqCst);
    assert!(n >= 3 && n < 150, "processed {}", n);
}
