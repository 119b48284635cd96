//! Bounded ordered segment buffer.
//!
//! The tree is the reliability-layer buffer between the session loops: the
//! output loop blocking-inserts segments to send, the ack path conditionally
//! deletes acknowledged minimums, the input side blocking-inserts received
//! data, and the application-facing reader drains in `seq` order.
//!
//! Ordering is strict by `seq`, ties broken by insertion order. The
//! blocking forms are async and wait on [`Notify`] with the future created
//! before the state check, so a wakeup between check and await is never
//! lost.

use crate::net::segment::Segment;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    #[error("segment tree is empty")]
    Empty,
}

struct TreeInner {
    map: BTreeMap<(u32, u64), Segment>,
    next_tie: u64,
}

/// Bounded, ordered, blocking multiset of segments keyed by sequence number.
pub struct SegmentTree {
    capacity: usize,
    inner: Mutex<TreeInner>,
    /// Signaled when a slot frees up.
    not_full: Notify,
    /// Signaled on every mutation.
    changed: Notify,
}

impl SegmentTree {
    /// Capacity is fixed at construction and must be non-zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(TreeInner {
                map: BTreeMap::new(),
                next_tie: 0,
            }),
            not_full: Notify::new(),
            changed: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots remaining.
    pub fn remaining(&self) -> usize {
        let inner = self.lock();
        self.capacity - inner.map.len()
    }

    /// Non-blocking insert. Returns the segment back when full, leaving the
    /// tree untouched.
    pub fn insert(&self, segment: Segment) -> Result<(), Segment> {
        {
            let mut inner = self.lock();
            if inner.map.len() >= self.capacity {
                return Err(segment);
            }
            let tie = inner.next_tie;
            inner.next_tie += 1;
            inner.map.insert((segment.seq(), tie), segment);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Insert, waiting for a free slot when full.
    pub async fn insert_blocking(&self, segment: Segment) {
        let mut segment = segment;
        loop {
            let notified = self.not_full.notified();
            match self.insert(segment) {
                Ok(()) => return,
                Err(back) => segment = back,
            }
            notified.await;
        }
    }

    /// Non-blocking delete of the minimum-seq segment.
    pub fn delete_min(&self) -> Option<Segment> {
        let segment = {
            let mut inner = self.lock();
            let key = *inner.map.keys().next()?;
            inner.map.remove(&key)
        }?;
        self.not_full.notify_waiters();
        self.changed.notify_waiters();
        Some(segment)
    }

    /// Delete the minimum, waiting while the tree is empty.
    pub async fn delete_min_blocking(&self) -> Segment {
        loop {
            let notified = self.changed.notified();
            if let Some(segment) = self.delete_min() {
                return segment;
            }
            notified.await;
        }
    }

    /// Delete and return the minimum only when `pred` accepts it.
    pub fn delete_min_if<F>(&self, pred: F) -> Option<Segment>
    where
        F: FnOnce(&Segment) -> bool,
    {
        let segment = {
            let mut inner = self.lock();
            let (key, min) = inner.map.iter().next()?;
            if !pred(min) {
                return None;
            }
            let key = *key;
            inner.map.remove(&key)
        }?;
        self.not_full.notify_waiters();
        self.changed.notify_waiters();
        Some(segment)
    }

    pub fn min_seq(&self) -> Result<u32, TreeError> {
        self.lock()
            .map
            .keys()
            .next()
            .map(|(seq, _)| *seq)
            .ok_or(TreeError::Empty)
    }

    pub fn max_seq(&self) -> Result<u32, TreeError> {
        self.lock()
            .map
            .keys()
            .next_back()
            .map(|(seq, _)| *seq)
            .ok_or(TreeError::Empty)
    }

    /// Whether any resident segment carries this exact seq.
    pub fn contains(&self, seq: u32) -> bool {
        self.lock()
            .map
            .range((seq, 0)..=(seq, u64::MAX))
            .next()
            .is_some()
    }

    /// Iterate in seq order while `f` returns true.
    pub fn ascend<F>(&self, mut f: F)
    where
        F: FnMut(&Segment) -> bool,
    {
        let inner = self.lock();
        for segment in inner.map.values() {
            if !f(segment) {
                break;
            }
        }
    }

    /// Mutating scan for the output loop's retransmission bookkeeping.
    pub(crate) fn ascend_mut<F>(&self, mut f: F)
    where
        F: FnMut(&mut Segment) -> bool,
    {
        let mut inner = self.lock();
        for segment in inner.map.values_mut() {
            if !f(segment) {
                break;
            }
        }
    }

    /// Future completing on the next mutation. Create it before inspecting
    /// the tree, await it after a failed inspection.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
