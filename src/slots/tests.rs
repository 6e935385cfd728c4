use super::*;
use crate::config::SlotConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const TTL: Duration = Duration::from_secs(60);

fn exercise_fifo(store: &dyn SlotStore) {
    let now = 1_000;
    for token in ["a", "b", "c"] {
        assert_eq!(store.try_acquire("t1", token, 3, TTL, now).unwrap(), Acquire::Acquired);
    }
    assert_eq!(
        store.try_acquire("t1", "d", 3, TTL, now).unwrap(),
        Acquire::Queued { position: 0 }
    );
    assert_eq!(
        store.try_acquire("t1", "e", 3, TTL, now).unwrap(),
        Acquire::Queued { position: 1 }
    );
    // idempotent for holders and waiters alike
    assert_eq!(store.try_acquire("t1", "a", 3, TTL, now).unwrap(), Acquire::Acquired);
    assert_eq!(
        store.try_acquire("t1", "e", 3, TTL, now).unwrap(),
        Acquire::Queued { position: 1 }
    );
    assert_eq!(store.holders("t1").unwrap().len(), 3);

    // other tenants are independent
    assert_eq!(store.try_acquire("t2", "x", 3, TTL, now).unwrap(), Acquire::Acquired);

    assert_eq!(store.release("t1", "b", 3, TTL, now).unwrap(), vec!["d".to_string()]);
    assert_eq!(
        store.holders("t1").unwrap(),
        vec!["a".to_string(), "c".to_string(), "d".to_string()]
    );
    assert_eq!(store.waiters("t1").unwrap(), vec!["e".to_string()]);

    // withdrawing a waiter admits nobody
    assert!(store.release("t1", "e", 3, TTL, now).unwrap().is_empty());
    assert!(store.waiters("t1").unwrap().is_empty());
    // releasing an unknown token is harmless
    assert!(store.release("t1", "zz", 3, TTL, now).unwrap().is_empty());
    assert_eq!(store.holders("t1").unwrap().len(), 3);
}

fn exercise_reap(store: &dyn SlotStore) {
    let short = Duration::from_secs(1);
    assert_eq!(store.try_acquire("t1", "a", 1, short, 0).unwrap(), Acquire::Acquired);
    assert_eq!(
        store.try_acquire("t1", "b", 1, TTL, 0).unwrap(),
        Acquire::Queued { position: 0 }
    );
    assert!(store.refresh("t1", "a", short, 500).unwrap());
    assert!(!store.refresh("t1", "b", short, 500).unwrap());

    let outcome = store.reap_expired(1_000, TTL, &|_| 1).unwrap();
    assert!(outcome.expired.is_empty());

    let outcome = store.reap_expired(1_600, TTL, &|_| 1).unwrap();
    assert_eq!(outcome.expired, vec![("t1".to_string(), "a".to_string())]);
    assert_eq!(outcome.admitted, vec![("t1".to_string(), "b".to_string())]);
    assert_eq!(store.holders("t1").unwrap(), vec!["b".to_string()]);
}

/// Workers race acquire/release; the held count never passes `max`.
fn exercise_contention(stores: Vec<Arc<dyn SlotStore>>, max: usize) {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for (worker, store) in stores.into_iter().enumerate() {
        for lane in 0..4 {
            let store = store.clone();
            let active = active.clone();
            let peak = peak.clone();
            workers.push(thread::spawn(move || {
                for round in 0..50 {
                    let token = format!("w{}-{}-{}", worker, lane, round);
                    match store.try_acquire("tenant", &token, max, TTL, 1_000).unwrap() {
                        Acquire::Acquired => {
                            let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now_active, Ordering::SeqCst);
                            assert!(store.holders("tenant").unwrap().len() <= max);
                            thread::yield_now();
                            active.fetch_sub(1, Ordering::SeqCst);
                            store.release("tenant", &token, max, TTL, 1_000).unwrap();
                        }
                        Acquire::Queued { .. } => {
                            store.release("tenant", &token, max, TTL, 1_000).unwrap();
                        }
                    }
                }
            }));
        }
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= max);
}

#[test]
fn test_memory_fifo() {
    exercise_fifo(&MemorySlotStore::new());
}

#[test]
fn test_memory_reap() {
    exercise_reap(&MemorySlotStore::new());
}

#[test]
fn test_memory_contention() {
    let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
    exercise_contention(vec![store.clone(), store], 3);
}

#[test]
fn test_sqlite_fifo() {
    exercise_fifo(&SqliteSlotStore::open_in_memory().unwrap());
}

#[test]
fn test_sqlite_reap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slots.db");
    exercise_reap(&SqliteSlotStore::open(path.to_str().unwrap()).unwrap());
}

#[test]
fn test_sqlite_contention_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slots.db");
    let path = path.to_str().unwrap();
    // separate connections stand in for separate worker processes
    let stores: Vec<Arc<dyn SlotStore>> = (0..3)
        .map(|_| Arc::new(SqliteSlotStore::open(path).unwrap()) as Arc<dyn SlotStore>)
        .collect();
    exercise_contention(stores, 3);
}

fn semaphore(max: usize) -> Arc<SlotSemaphore> {
    let config = SlotConfig {
        max_slots: max,
        waiter_poll_ms: 20,
        ..Default::default()
    };
    Arc::new(SlotSemaphore::new(Arc::new(MemorySlotStore::new()), config))
}

#[tokio::test]
async fn test_semaphore_waiter_admitted_on_release() {
    let slots = semaphore(1);
    let cancel = CancellationToken::new();
    assert!(slots.acquire("t1", "first", &cancel).await.unwrap());

    let waiter = {
        let slots = slots.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { slots.acquire("t1", "second", &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(slots.waiters("t1").unwrap(), vec!["second".to_string()]);
    assert!(!waiter.is_finished());

    assert_eq!(slots.release("t1", "first").unwrap(), vec!["second".to_string()]);
    assert!(waiter.await.unwrap().unwrap());
    assert_eq!(slots.holders("t1").unwrap(), vec!["second".to_string()]);
}

#[tokio::test]
async fn test_semaphore_cancel_withdraws_waiter() {
    let slots = semaphore(1);
    let cancel = CancellationToken::new();
    assert!(slots.acquire("t1", "first", &cancel).await.unwrap());

    let waiting = CancellationToken::new();
    let waiter = {
        let slots = slots.clone();
        let waiting = waiting.clone();
        tokio::spawn(async move { slots.acquire("t1", "second", &waiting).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    waiting.cancel();
    assert!(!waiter.await.unwrap().unwrap());
    assert!(slots.waiters("t1").unwrap().is_empty());
    assert_eq!(slots.holders("t1").unwrap(), vec!["first".to_string()]);
}

#[test]
fn test_tenant_override() {
    let mut config = SlotConfig::default();
    config.tenant_max_slots.insert("big".to_string(), 10);
    let slots = SlotSemaphore::new(Arc::new(MemorySlotStore::new()), config);
    assert_eq!(slots.max_for("big"), 10);
    assert_eq!(slots.max_for("other"), 3);
}
