use std::sync::Arc;
use std::time::Duration;

use infersim_common::SimError;
use infersim_core::cache::BlockCache;
use infersim_core::events::KvEvent;
use tokio::sync::mpsc;

fn cache_with_events(capacity: usize) -> (BlockCache, mpsc::Receiver<KvEvent>) {
    let (tx, rx) = mpsc::channel(10_000);
    let (cache, _usage) = BlockCache::new(capacity, Some(tx));
    (cache, rx)
}

fn drain(rx: &mut mpsc::Receiver<KvEvent>) -> Vec<KvEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[test]
fn single_request_lifecycle() {
    let (cache, _rx) = cache_with_events(3);
    let cached = cache.start_request("req1", &[1, 2]).expect("start");
    assert_eq!(cached, 0);
    assert_eq!(cache.ref_count(1), 1);
    assert_eq!(cache.ref_count(2), 1);
    assert_eq!(cache.stats().in_use, 2);

    cache.finish_request("req1").expect("finish");
    assert_eq!(cache.stats().in_use, 0);
    assert!(cache.is_unused(1));
    assert!(cache.is_unused(2));
}

#[test]
fn disjoint_requests_coexist() {
    let (cache, _rx) = cache_with_events(5);
    assert_eq!(cache.start_request("req1", &[1, 2]).unwrap(), 0);
    assert_eq!(cache.start_request("req2", &[3, 4]).unwrap(), 0);
    assert_eq!(cache.stats().in_use, 4);

    cache.finish_request("req1").unwrap();
    cache.finish_request("req2").unwrap();
    let stats = cache.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.unused, 4);
    for b in [1, 2, 3, 4] {
        assert!(cache.is_unused(b));
    }
}

#[test]
fn shared_prefix_is_counted_and_refcounted() {
    let (cache, _rx) = cache_with_events(5);
    assert_eq!(cache.start_request("req1", &[1, 2]).unwrap(), 0);
    let cached = cache.start_request("req2", &[1, 3]).unwrap();
    assert_eq!(cached, 1);
    assert_eq!(cache.ref_count(1), 2);

    cache.finish_request("req1").unwrap();
    assert_eq!(cache.ref_count(1), 1);
    assert!(cache.is_unused(2));
    assert!(!cache.is_unused(1));
}

#[test]
fn eviction_takes_oldest_released_blocks_first() {
    let (cache, mut rx) = cache_with_events(4);
    cache.start_request("req1", &[1, 2]).unwrap();
    cache.start_request("req2", &[3, 4]).unwrap();
    cache.finish_request("req2").unwrap();

    let cached = cache.start_request("req3", &[5, 6]).unwrap();
    assert_eq!(cached, 0);
    assert!(!cache.is_resident(3));
    assert!(!cache.is_resident(4));
    assert_eq!(cache.ref_count(5), 1);
    assert_eq!(cache.ref_count(6), 1);

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            KvEvent::Stored(vec![1, 2]),
            KvEvent::Stored(vec![3, 4]),
            KvEvent::Removed(vec![3, 4]),
            KvEvent::Stored(vec![5, 6]),
        ]
    );
}

#[test]
fn capacity_rejection_mutates_nothing() {
    let (cache, mut rx) = cache_with_events(4);
    cache.start_request("req1", &[1, 2]).unwrap();
    cache.start_request("req2", &[3, 4]).unwrap();

    let err = cache.start_request("req3", &[5, 6]).unwrap_err();
    assert!(matches!(err, SimError::KvCacheCapacity { requested: 6, capacity: 4 }));
    let stats = cache.stats();
    assert_eq!(stats.in_use, 4);
    assert_eq!(stats.unused, 0);
    assert!(!cache.is_resident(5));

    // a rejected request must not leak a record either
    cache.finish_request("req3").unwrap();
    assert_eq!(cache.stats().in_use, 4);

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![KvEvent::Stored(vec![1, 2]), KvEvent::Stored(vec![3, 4])]
    );
}

#[test]
fn revived_blocks_count_against_headroom() {
    let (cache, mut rx) = cache_with_events(2);
    cache.start_request("req1", &[1, 2]).unwrap();
    cache.finish_request("req1").unwrap();

    // reviving 1 frees no slot, so admitting 3 evicts the older unused 2
    let cached = cache.start_request("req2", &[1, 3]).unwrap();
    assert_eq!(cached, 1);
    assert!(!cache.is_resident(2));
    assert_eq!(cache.ref_count(1), 1);

    let events = drain(&mut rx);
    // no event for the revival of 1: it was never removed
    assert_eq!(
        events,
        vec![
            KvEvent::Stored(vec![1, 2]),
            KvEvent::Removed(vec![2]),
            KvEvent::Stored(vec![3]),
        ]
    );
}

#[test]
fn revival_that_cannot_fit_is_rejected_whole() {
    let (cache, _rx) = cache_with_events(3);
    cache.start_request("req1", &[1]).unwrap();
    cache.finish_request("req1").unwrap();
    cache.start_request("req2", &[2, 3]).unwrap();

    // U=2, one revival plus two new blocks exceeds capacity; no partial admission
    let err = cache.start_request("req3", &[1, 4, 5]).unwrap_err();
    assert!(matches!(err, SimError::KvCacheCapacity { requested: 5, capacity: 3 }));
    assert_eq!(cache.stats().in_use, 2);
    assert!(cache.is_unused(1));
    assert!(!cache.is_resident(4));
}

#[test]
fn duplicate_request_id_is_an_error() {
    let (cache, _rx) = cache_with_events(5);
    cache.start_request("req1", &[1]).unwrap();
    let err = cache.start_request("req1", &[2]).unwrap_err();
    assert!(matches!(err, SimError::DuplicateRequest(_)));
    assert!(!cache.is_resident(2));
}

#[test]
fn duplicate_fingerprint_within_request_counts_twice() {
    let (cache, _rx) = cache_with_events(5);
    let cached = cache.start_request("req1", &[7, 7]).unwrap();
    assert_eq!(cached, 0);
    assert_eq!(cache.ref_count(7), 2);

    cache.finish_request("req1").unwrap();
    assert_eq!(cache.ref_count(7), 0);
    assert!(cache.is_unused(7));
}

#[test]
fn finish_is_idempotent() {
    let (cache, _rx) = cache_with_events(3);
    cache.start_request("req1", &[1]).unwrap();
    cache.finish_request("req1").unwrap();
    cache.finish_request("req1").unwrap();
    cache.finish_request("never-started").unwrap();
    assert_eq!(cache.stats().in_use, 0);
    assert_eq!(cache.stats().unused, 1);
}

#[test]
fn usage_watch_tracks_in_use_ratio() {
    let (tx, _rx) = mpsc::channel(16);
    let (cache, usage) = BlockCache::new(4, Some(tx));
    cache.start_request("req1", &[1, 2]).unwrap();
    assert_eq!(*usage.borrow(), 0.5);
    cache.finish_request("req1").unwrap();
    assert_eq!(*usage.borrow(), 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_hammer_settles_clean() {
    let (tx, mut rx) = mpsc::channel(10_000);
    let (cache, _usage) = BlockCache::new(100, Some(tx));
    let cache = Arc::new(cache);

    let mut handles = Vec::new();
    for worker in 0..50usize {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10usize {
                let id = format!("req-{}-{}", worker, i);
                let start = (worker * 7 + i * 13) % 100;
                let len = 1 + (worker + i) % 10;
                let blocks: Vec<u64> = (0..len).map(|k| ((start + k) % 100) as u64).collect();
                match cache.start_request(&id, &blocks) {
                    Ok(_) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        cache.finish_request(&id).expect("finish");
                    }
                    Err(SimError::KvCacheCapacity { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.expect("worker");
    }

    let stats = cache.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.unused <= 100);

    // touch the whole fingerprint space once so the cache settles full
    let everything: Vec<u64> = (0..100).collect();
    cache.start_request("fill", &everything).expect("fill");
    cache.finish_request("fill").expect("fill finish");
    let stats = cache.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.unused, 100);

    // conservation: stores minus removes equals the resident population
    let mut stored = 0i64;
    let mut removed = 0i64;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            KvEvent::Stored(h) => stored += h.len() as i64,
            KvEvent::Removed(h) => removed += h.len() as i64,
        }
    }
    assert_eq!(stored - removed, stats.unused as i64);
}

#[test]
fn works_without_an_event_sink() {
    let (cache, _usage) = BlockCache::new(4, None);
    cache.start_request("req1", &[1, 2]).unwrap();
    cache.finish_request("req1").unwrap();
    cache.start_request("req2", &[3, 4, 5, 6]).unwrap();
    assert!(!cache.is_resident(1));
    assert!(!cache.is_resident(2));
    assert_eq!(cache.stats().in_use, 4);
}
