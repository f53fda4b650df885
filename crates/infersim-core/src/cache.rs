use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use infersim_common::{Result, SimError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;

use crate::events::KvEvent;

/// Point-in-time view of the cache populations, taken under the shared lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub in_use: usize,
    pub unused: usize,
    pub capacity: usize,
    pub usage: f64,
}

struct CacheState {
    /// fingerprint -> number of live requests holding it
    in_use: HashMap<u64, usize>,
    /// fingerprint -> release tick of its last holder
    unused: HashMap<u64, u64>,
    /// request id -> the block list it acquired at start
    requests: HashMap<String, Vec<u64>>,
    /// monotone logical clock; one tick per released block, so LRU order
    /// is total and ties cannot occur
    clock: u64,
}

/// Capacity-bounded, reference-counted population of block fingerprints.
///
/// Resident blocks are either in-use (held by at least one live request) or
/// unused (retained for reuse, evictable oldest-release-first). All mutation
/// happens under one exclusive lock; `stats` and the refcount probes take the
/// shared lock. The usage channel is a `watch`: lossy, last-value-wins, and
/// never blocks the cache.
pub struct BlockCache {
    capacity: usize,
    state: RwLock<CacheState>,
    events: Option<mpsc::Sender<KvEvent>>,
    usage: watch::Sender<f64>,
}

impl BlockCache {
    pub fn new(
        capacity: usize,
        events: Option<mpsc::Sender<KvEvent>>,
    ) -> (Self, watch::Receiver<f64>) {
        let (usage, usage_rx) = watch::channel(0.0);
        let cache = Self {
            capacity,
            state: RwLock::new(CacheState {
                in_use: HashMap::new(),
                unused: HashMap::new(),
                requests: HashMap::new(),
                clock: 0,
            }),
            events,
            usage,
        };
        (cache, usage_rx)
    }

    /// Registers a request and admits its blocks, returning how many of them
    /// were already resident (in-use or unused) before the call.
    ///
    /// Either the whole request is admitted or nothing changes: a duplicate
    /// id and an admission that cannot fit both fail before any mutation.
    pub fn start_request(&self, request_id: &str, blocks: &[u64]) -> Result<usize> {
        let mut state = self.state.write().unwrap();
        if state.requests.contains_key(request_id) {
            return Err(SimError::DuplicateRequest(request_id.to_string()));
        }

        // Source-order partition of distinct fingerprints against the current
        // populations. A fingerprint listed twice in one request stays in its
        // first partition but counts as two references.
        let mut refs: HashMap<u64, usize> = HashMap::new();
        let mut held: Vec<u64> = Vec::new();
        let mut revived: Vec<u64> = Vec::new();
        let mut admitted: Vec<u64> = Vec::new();
        for &b in blocks {
            let count = refs.entry(b).or_insert(0);
            *count += 1;
            if *count > 1 {
                continue;
            }
            if state.in_use.contains_key(&b) {
                held.push(b);
            } else if state.unused.contains_key(&b) {
                revived.push(b);
            } else {
                admitted.push(b);
            }
        }

        // Revived blocks count against headroom: promoting one frees no slot,
        // and only genuinely new blocks may push an unused entry out.
        let needed = state.in_use.len() + admitted.len() + revived.len();
        if needed > self.capacity {
            return Err(SimError::KvCacheCapacity {
                requested: needed,
                capacity: self.capacity,
            });
        }

        for b in &held {
            if let Some(rc) = state.in_use.get_mut(b) {
                *rc += refs[b];
            }
        }
        for b in &revived {
            state.unused.remove(b);
            state.in_use.insert(*b, refs[b]);
        }

        let mut evicted: Vec<u64> = Vec::new();
        for &b in &admitted {
            if state.in_use.len() + state.unused.len() == self.capacity {
                // the capacity check above guarantees an unused entry exists
                let victim = state
                    .unused
                    .iter()
                    .min_by_key(|(_, tick)| **tick)
                    .map(|(b, _)| *b);
                if let Some(victim) = victim {
                    state.unused.remove(&victim);
                    evicted.push(victim);
                }
            }
            state.in_use.insert(b, refs[&b]);
        }

        if !evicted.is_empty() {
            self.send_event(KvEvent::Removed(evicted));
        }
        if !admitted.is_empty() {
            self.send_event(KvEvent::Stored(admitted));
        }

        let cached = held.len() + revived.len();
        state.requests.insert(request_id.to_string(), blocks.to_vec());
        self.publish_usage(&state);
        Ok(cached)
    }

    /// Releases a request's references. Unknown ids are a no-op so upstream
    /// retries and double-completions stay harmless.
    pub fn finish_request(&self, request_id: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let Some(blocks) = state.requests.remove(request_id) else {
            return Ok(());
        };

        let mut missing: Vec<u64> = Vec::new();
        for b in blocks {
            match state.in_use.get_mut(&b) {
                Some(rc) => {
                    *rc -= 1;
                    if *rc == 0 {
                        state.in_use.remove(&b);
                        state.clock += 1;
                        let tick = state.clock;
                        state.unused.insert(b, tick);
                    }
                }
                None => {
                    if !missing.contains(&b) {
                        missing.push(b);
                    }
                }
            }
        }

        self.publish_usage(&state);
        if missing.is_empty() {
            Ok(())
        } else {
            // cleanup already completed; this is diagnostic, not a rollback
            Err(SimError::CacheConsistency(missing))
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read().unwrap();
        CacheStats {
            in_use: state.in_use.len(),
            unused: state.unused.len(),
            capacity: self.capacity,
            usage: state.in_use.len() as f64 / self.capacity as f64,
        }
    }

    /// Live reference count for a fingerprint; 0 when it is not in use.
    pub fn ref_count(&self, block: u64) -> usize {
        let state = self.state.read().unwrap();
        state.in_use.get(&block).copied().unwrap_or(0)
    }

    pub fn is_unused(&self, block: u64) -> bool {
        let state = self.state.read().unwrap();
        state.unused.contains_key(&block)
    }

    pub fn is_resident(&self, block: u64) -> bool {
        let state = self.state.read().unwrap();
        state.in_use.contains_key(&block) || state.unused.contains_key(&block)
    }

    fn publish_usage(&self, state: &CacheState) {
        self.usage
            .send_replace(state.in_use.len() as f64 / self.capacity as f64);
    }

    // Called with the state lock held, so a full channel stalls the cache;
    // the channel is sized generously to keep this off the hot path.
    fn send_event(&self, event: KvEvent) {
        let Some(tx) = &self.events else { return };
        let mut event = event;
        let mut stalled = false;
        loop {
            match tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if !stalled {
                        tracing::warn!(target: "kv_cache", "event channel full, stalling");
                        stalled = true;
                    }
                    event = back;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}
