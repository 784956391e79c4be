//! Worker-local event queue with optional delays.
//!
//! Entries are released in `(due time, insertion order)` order. Immediate
//! entries are simply due at the moment they were queued.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

struct Entry<T> {
    due: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap; invert so the earliest (due, seq) is on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct EventQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queue an item due now.
    pub fn push(&mut self, item: T) {
        self.push_at(item, Instant::now());
    }

    /// Queue an item due after `delay`.
    pub fn push_after(&mut self, item: T, delay: Duration) {
        self.push_at(item, Instant::now() + delay);
    }

    /// Queue an item due at `due`.
    pub fn push_at(&mut self, item: T, due: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { due, seq, item });
    }

    /// Due time of the earliest entry.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.due)
    }

    /// Time left until the earliest entry is due (zero if already due).
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_due().map(|due| due.saturating_duration_since(now))
    }

    /// Pop the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        if self.heap.peek()?.due > now {
            return None;
        }
        self.heap.pop().map(|e| e.item)
    }

    /// Drop every entry the predicate rejects. Returns how many were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.heap.len();
        self.heap.retain(|e| keep(&e.item));
        before - self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
