//! TTL cache correlating in-flight frame ids with their raw frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ai::types::SharedFrame;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_millis(2000);

/// Default capacity before oldest-first eviction kicks in.
pub const DEFAULT_CAPACITY: usize = 256;

/// A cached frame plus its insertion timestamps.
#[derive(Clone)]
pub struct CachedFrame {
    pub frame: SharedFrame,
    pub inserted_at: Instant,
    /// Wall-clock insertion time in epoch milliseconds.
    pub inserted_ts_ms: u64,
}

struct CacheInner {
    entries: Mutex<HashMap<u64, CachedFrame>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Concurrent `frame_id -> CachedFrame` map with per-entry TTL.
///
/// Entries are immutable once inserted. A miss after eviction is expected
/// and non-fatal; callers treat it as an ingestion skip. Cheap to clone.
#[derive(Clone)]
pub struct FrameCache {
    inner: Arc<CacheInner>,
}

impl FrameCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                ttl,
                capacity,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    /// Insert or overwrite. O(1) apart from capacity eviction, which removes
    /// the oldest-inserted entry first.
    pub fn put(&self, frame_id: u64, frame: SharedFrame) {
        let entry = CachedFrame {
            frame,
            inserted_at: Instant::now(),
            inserted_ts_ms: epoch_ms(),
        };
        let mut entries = self.inner.entries.lock();
        entries.insert(frame_id, entry);
        if entries.len() > self.inner.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| *id)
            {
                entries.remove(&oldest);
            }
        }
    }

    /// Fetch a live entry. Expired entries count as misses and are removed
    /// on the spot rather than waiting for the sweeper.
    pub fn get(&self, frame_id: u64) -> Option<CachedFrame> {
        let mut entries = self.inner.entries.lock();
        match entries.get(&frame_id) {
            Some(entry) if entry.inserted_at.elapsed() < self.inner.ttl => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            Some(_) => {
                entries.remove(&frame_id);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Drop an entry, e.g. when the in-flight window evicts its frame.
    pub fn remove(&self, frame_id: u64) {
        self.inner.entries.lock().remove(&frame_id);
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    /// Evict all expired entries. Called by the sweeper; also usable
    /// directly in tests.
    pub fn sweep(&self) -> usize {
        let ttl = self.inner.ttl;
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - entries.len()
    }

    /// Spawn the background sweeper, running at ~TTL/4 cadence until the
    /// returned handle is aborted.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let cadence = (self.inner.ttl / 4).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    tracing::trace!(evicted, "frame cache sweep");
                }
            }
        })
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
