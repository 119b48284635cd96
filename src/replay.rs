//! Replay rejection for the datagram underlay.
//!
//! A fingerprint is the first authentication-tag-length bytes of a
//! datagram's encrypted metadata block, scoped by the peer address it came
//! from. Seeing the same fingerprint twice within the TTL means the packet
//! is a replay (or a pathological duplicate) and must be dropped.

use crate::crypto::TAG_SIZE;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fingerprint length: the tag prefix of the encrypted metadata block.
pub const FINGERPRINT_SIZE: usize = TAG_SIZE;

/// Default memory budget for stored fingerprints (16 MiB).
pub const DEFAULT_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

/// Entries older than this are no longer considered replays.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Number of oldest entries evicted together when the cache is full.
/// Batching amortizes the eviction cost the same way the bounded
/// inventory set does.
const EVICTION_BATCH: usize = 1024;

#[derive(Clone, PartialEq, Eq, Hash)]
struct ReplayKey {
    fingerprint: [u8; FINGERPRINT_SIZE],
    peer: SocketAddr,
}

struct ReplayInner {
    entries: HashMap<ReplayKey, Instant>,
    // Insertion ledger for FIFO eviction and lazy expiry.
    order: VecDeque<(ReplayKey, Instant)>,
}

/// Fixed-capacity, time-bounded replay fingerprint set.
///
/// Check-and-insert is atomic under one lock; the lock is held only for
/// map operations, never across I/O. Injected into the underlay
/// constructor so tests control their own cache instead of sharing
/// process-global state.
pub struct ReplayCache {
    inner: Mutex<ReplayInner>,
    max_entries: usize,
    ttl: Duration,
}

impl ReplayCache {
    pub fn new(capacity_bytes: usize, ttl: Duration) -> Self {
        let max_entries = (capacity_bytes / FINGERPRINT_SIZE).max(1);
        Self {
            inner: Mutex::new(ReplayInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries,
            ttl,
        }
    }

    /// Atomically check whether this fingerprint was already seen from this
    /// peer within the TTL, inserting it either way.
    pub fn is_duplicate(&self, fingerprint: &[u8], peer: SocketAddr) -> bool {
        let mut fp = [0u8; FINGERPRINT_SIZE];
        let take = fingerprint.len().min(FINGERPRINT_SIZE);
        fp[..take].copy_from_slice(&fingerprint[..take]);
        let key = ReplayKey { fingerprint: fp, peer };

        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // Lazy purge: expired entries at the front of the ledger.
        while let Some((old_key, inserted)) = inner.order.front() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            let old_key = old_key.clone();
            inner.order.pop_front();
            // Only remove if not refreshed by a newer insertion.
            if let Some(ts) = inner.entries.get(&old_key) {
                if now.duration_since(*ts) >= self.ttl {
                    inner.entries.remove(&old_key);
                }
            }
        }

        if let Some(ts) = inner.entries.get(&key) {
            if now.duration_since(*ts) < self.ttl {
                debug!("replay fingerprint from {}", peer);
                return true;
            }
        }

        if inner.entries.len() >= self.max_entries {
            for _ in 0..EVICTION_BATCH {
                match inner.order.pop_front() {
                    Some((old_key, _)) => {
                        inner.entries.remove(&old_key);
                    }
                    None => break,
                }
            }
        }

        inner.entries.insert(key.clone(), now);
        inner.order.push_back((key, now));
        false
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES, DEFAULT_TTL)
    }
}
