//! Indexed min-heap of idle deadlines.
//!
//! A binary min-heap ordered by expiry instant, plus a map from id to heap
//! position so that any node (not only the root) can be updated or removed
//! in O(log n). The control thread uses one entry per live connection.
//!
//! # Complexity
//!
//! - `add` / `adjust` / `remove`: O(log n)
//! - Firing k expired timers: O(k log n)
//! - Peek next deadline: O(1) after firing
//!
//! Callbacks run synchronously on the thread that drives the heap.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default callback type: a one-shot closure.
pub type TimeoutCallback = Box<dyn FnOnce()>;

struct TimerNode<K, F> {
    id: K,
    expires: Instant,
    cb: F,
}

pub struct TimerHeap<K = u64, F = TimeoutCallback> {
    heap: Vec<TimerNode<K, F>>,
    /// id -> index into `heap`
    index: HashMap<K, usize>,
}

impl<K, F> Default for TimerHeap<K, F>
where
    K: Copy + Eq + Hash,
    F: FnOnce(),
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, F> TimerHeap<K, F>
where
    K: Copy + Eq + Hash,
    F: FnOnce(),
{
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Schedule `cb` to fire `timeout` from now.
    ///
    /// An id that is already scheduled gets its expiry and callback replaced
    /// in place; the node is sifted down, or up if it did not move.
    pub fn add(&mut self, id: K, timeout: Duration, cb: F) {
        self.add_at(id, Instant::now() + timeout, cb);
    }

    pub fn add_at(&mut self, id: K, expires: Instant, cb: F) {
        match self.index.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode { id, expires, cb });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = cb;
                let n = self.heap.len();
                if !self.sift_down(i, n) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Push an existing timer out to `timeout` from now.
    ///
    /// Returns false if `id` is not scheduled.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> bool {
        self.adjust_at(id, Instant::now() + timeout)
    }

    /// Expiries only move later through this call, so the node can only
    /// travel toward the leaves. An earlier instant is handled anyway.
    pub fn adjust_at(&mut self, id: K, expires: Instant) -> bool {
        let Some(&i) = self.index.get(&id) else {
            return false;
        };
        self.heap[i].expires = expires;
        let n = self.heap.len();
        if !self.sift_down(i, n) {
            self.sift_up(i);
        }
        true
    }

    /// Cancel a timer without firing it. Returns false if unknown.
    pub fn remove(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.delete(i);
                true
            }
            None => false,
        }
    }

    /// Fire every timer whose expiry is at or before `now`, in expiry order.
    ///
    /// Returns the number fired.
    pub fn pop_expired_at(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.delete(0);
            (node.cb)();
            fired += 1;
        }
        fired
    }

    pub fn pop_expired(&mut self) -> usize {
        self.pop_expired_at(Instant::now())
    }

    /// Fire expired timers, then report how long until the next one.
    ///
    /// `None` means nothing is scheduled (block indefinitely).
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.next_deadline_at(Instant::now())
    }

    pub fn next_deadline_at(&mut self, now: Instant) -> Option<Duration> {
        self.pop_expired_at(now);
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(now))
    }

    /// Drop every timer without firing.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    // ── heap internals ──────────────────────────────────────────────

    /// Remove the node at `i`: swap with the last node, shrink, then
    /// restore order around the displaced node.
    fn delete(&mut self, i: usize) -> TimerNode<K, F> {
        let node = self.heap.swap_remove(i);
        self.index.remove(&node.id);
        if i < self.heap.len() {
            self.index.insert(self.heap[i].id, i);
            let n = self.heap.len();
            if !self.sift_down(i, n) {
                self.sift_up(i);
            }
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Sift down within `heap[..n]`. Returns true if the node moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.heap.len(), self.index.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&node.id], i);
            if i > 0 {
                assert!(self.heap[(i - 1) / 2].expires <= node.expires);
            }
        }
    }
}
