// SPDX-License-Identifier: Apache-2.0

//! Ordered queue backends: timestamp-ordered storage for task records.
//!
//! Ordering law: for two co-resident tasks with timestamps `ta < tb`,
//! `dequeue_min` never returns the later one first. Ties between equal
//! timestamps break FIFO by enqueue sequence, which keeps drain order
//! deterministic for testing.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::EnqueueError;
use crate::flags::EnqFlags;
use crate::task::{TaskRecord, Timestamp, NO_TIMESTAMP};

/// Minimum-timestamp-ordered storage for task records.
pub trait OrderedQueue {
    /// Stores a record.
    fn enqueue(&mut self, rec: TaskRecord);
    /// Removes and returns the minimum-timestamp record, FIFO on ties.
    fn dequeue_min(&mut self) -> Option<TaskRecord>;
    /// Returns the minimum resident timestamp without removing it.
    fn peek_min_timestamp(&self) -> Option<Timestamp>;
    /// Number of resident records.
    fn len(&self) -> usize;
    /// Returns true if no records are resident.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One heap slot: the ordering key is `(timestamp, seq)` so equal
/// timestamps dequeue in enqueue order.
#[derive(Debug)]
struct HeapEntry {
    ts: Timestamp,
    seq: u64,
    rec: TaskRecord,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed: BinaryHeap is a max-heap and we want the minimum key.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.ts, other.seq).cmp(&(self.ts, self.seq))
    }
}

/// Unbounded binary-heap queue.
#[derive(Debug, Default)]
pub struct TimestampHeap {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl TimestampHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    fn push_entry(&mut self, rec: TaskRecord, seq: u64) {
        self.heap.push(HeapEntry {
            ts: rec.timestamp,
            seq,
            rec,
        });
    }

    fn push(&mut self, rec: TaskRecord) {
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        self.push_entry(rec, seq);
    }
}

impl OrderedQueue for TimestampHeap {
    fn enqueue(&mut self, rec: TaskRecord) {
        self.push(rec);
    }

    fn dequeue_min(&mut self) -> Option<TaskRecord> {
        self.heap.pop().map(|e| e.rec)
    }

    fn peek_min_timestamp(&self) -> Option<Timestamp> {
        self.heap.peek().map(|e| e.ts)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// A capacity-bounded ordered queue.
///
/// `try_enqueue` refuses to grow past the bound; the caller (the
/// scheduler's enqueue path) responds by coalescing, never by blocking.
#[derive(Debug)]
pub struct BoundedQueue {
    inner: TimestampHeap,
    capacity: usize,
}

impl BoundedQueue {
    /// Creates a queue bounded at `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 2, "queue bound must be at least 2");
        Self {
            inner: TimestampHeap::new(),
            capacity,
        }
    }

    /// The capacity bound.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores a record unless the queue is at its bound.
    pub fn try_enqueue(&mut self, rec: TaskRecord) -> Result<(), (TaskRecord, EnqueueError)> {
        if self.inner.len() >= self.capacity {
            return Err((
                rec,
                EnqueueError::QueueFull {
                    capacity: self.capacity,
                },
            ));
        }
        self.inner.push(rec);
        Ok(())
    }

    /// Stores a record even past the bound.
    ///
    /// Reserved for spill-protocol placeholders: a requeuer must always
    /// land on its own shard, so it gets a slot unconditionally.
    pub(crate) fn push_unchecked(&mut self, rec: TaskRecord) {
        self.inner.push(rec);
    }

    /// Drains up to `max` spill-eligible records, returning them in
    /// removal order.
    ///
    /// Eligibility mirrors the overflow protocol: requeuer placeholders
    /// are never drained, untimed records go first (oldest first), and
    /// if no untimed records exist the latest-timestamp records are
    /// taken instead — never the resident minimum, which is the record
    /// a producer may be waiting on.
    pub(crate) fn drain_for_spill(&mut self, max: usize) -> Vec<TaskRecord> {
        if max == 0 || self.inner.heap.is_empty() {
            return Vec::new();
        }

        // Ascending (ts, seq) order.
        let mut entries: Vec<HeapEntry> = Vec::with_capacity(self.inner.heap.len());
        while let Some(e) = self.inner.heap.pop() {
            entries.push(e);
        }

        let eligible = |e: &HeapEntry| !e.rec.flags.contains(EnqFlags::REQUEUER);
        let untimed = |e: &HeapEntry| {
            e.ts == NO_TIMESTAMP || e.rec.flags.contains(EnqFlags::NOTIMESTAMP)
        };

        let mut drained: Vec<HeapEntry> = Vec::new();
        let mut kept: Vec<HeapEntry> = Vec::new();

        if entries.iter().any(|e| eligible(e) && untimed(e)) {
            // Oldest untimed first: untimed entries sort to the tail of
            // the ascending order (NO_TIMESTAMP), FIFO among themselves.
            for e in entries {
                if drained.len() < max && eligible(&e) && untimed(&e) {
                    drained.push(e);
                } else {
                    kept.push(e);
                }
            }
        } else {
            // Timed fallback: take from the back (latest timestamps).
            // The earliest eligible record is spared unconditionally; it
            // is the slot a producer may be waiting on.
            let spared = entries
                .iter()
                .find(|&e| eligible(e))
                .map(|e| (e.ts, e.seq));
            let mut stack = entries;
            while let Some(e) = stack.pop() {
                if drained.len() < max && eligible(&e) && Some((e.ts, e.seq)) != spared {
                    drained.push(e);
                } else {
                    kept.push(e);
                }
            }
        }

        // Keepers retain their original sequence numbers so FIFO ties
        // survive the round-trip.
        for e in kept {
            self.inner.push_entry(e.rec, e.seq);
        }
        drained.into_iter().map(|e| e.rec).collect()
    }
}

impl OrderedQueue for BoundedQueue {
    /// Unconditional store; callers that respect the bound use
    /// [`BoundedQueue::try_enqueue`].
    fn enqueue(&mut self, rec: TaskRecord) {
        self.inner.push(rec);
    }

    fn dequeue_min(&mut self) -> Option<TaskRecord> {
        self.inner.dequeue_min()
    }

    fn peek_min_timestamp(&self) -> Option<Timestamp> {
        self.inner.peek_min_timestamp()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn rec(ts: Timestamp, tag: u64) -> TaskRecord {
        TaskRecord::from_fn(|_, _, _| {}, ts, tag, EnqFlags::NOFLAGS, &[tag])
    }

    fn tag_of(r: &TaskRecord) -> u64 {
        match &r.call {
            crate::task::TaskCall::Func { args, .. } => args.word(0),
            crate::task::TaskCall::Thunk(_) => unreachable!("test records are Func"),
        }
    }

    #[test]
    fn dequeues_in_timestamp_order() {
        let mut q = TimestampHeap::new();
        for (ts, tag) in [(5u64, 0u64), (1, 1), (3, 2), (1, 3), (9, 4)] {
            q.enqueue(rec(ts, tag));
        }
        let order: Vec<Timestamp> = std::iter::from_fn(|| q.dequeue_min())
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(order, vec![1, 1, 3, 5, 9]);
    }

    #[test]
    fn equal_timestamps_dequeue_fifo() {
        let mut q = TimestampHeap::new();
        q.enqueue(rec(1, 10));
        q.enqueue(rec(1, 11));
        q.enqueue(rec(1, 12));
        let tags: Vec<u64> = std::iter::from_fn(|| q.dequeue_min())
            .map(|r| tag_of(&r))
            .collect();
        assert_eq!(tags, vec![10, 11, 12]);
    }

    #[test]
    fn bounded_queue_refuses_past_capacity() {
        let mut q = BoundedQueue::with_capacity(2);
        assert!(q.try_enqueue(rec(1, 0)).is_ok());
        assert!(q.try_enqueue(rec(2, 1)).is_ok());
        let (_, err) = q.try_enqueue(rec(3, 2)).unwrap_err();
        assert_eq!(err, EnqueueError::QueueFull { capacity: 2 });
    }

    #[test]
    fn spill_prefers_untimed_records() {
        let mut q = BoundedQueue::with_capacity(8);
        q.enqueue(rec(1, 0));
        q.enqueue(TaskRecord::from_fn(
            |_, _, _| {},
            NO_TIMESTAMP,
            7,
            EnqFlags::NOTIMESTAMP,
            &[7],
        ));
        q.enqueue(rec(2, 1));

        let drained = q.drain_for_spill(4);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].timestamp, NO_TIMESTAMP);
        assert_eq!(q.len(), 2);
        assert_eq!(q.peek_min_timestamp(), Some(1));
    }

    #[test]
    fn spill_spares_the_resident_minimum() {
        let mut q = BoundedQueue::with_capacity(8);
        for (ts, tag) in [(1u64, 0u64), (2, 1), (3, 2), (4, 3)] {
            q.enqueue(rec(ts, tag));
        }
        let drained = q.drain_for_spill(8);
        // The minimum (ts=1) must survive; the latest go first.
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].timestamp, 4);
        assert_eq!(drained[2].timestamp, 2);
        assert_eq!(q.peek_min_timestamp(), Some(1));
    }

    #[test]
    fn spill_spares_the_minimum_past_a_resident_requeuer() {
        let mut q = BoundedQueue::with_capacity(8);
        q.enqueue(rec(1, 0));
        q.enqueue(rec(2, 1));
        q.enqueue(rec(3, 2));
        q.enqueue(TaskRecord::from_fn(
            |_, _, _| {},
            5,
            0,
            EnqFlags::REQUEUER,
            &[],
        ));
        // The requeuer is skipped before the drain reaches the minimum;
        // ts=1 must still be spared.
        let drained = q.drain_for_spill(8);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].timestamp, 3);
        assert_eq!(q.peek_min_timestamp(), Some(1));
    }

    #[test]
    fn spill_never_drains_requeuers() {
        let mut q = BoundedQueue::with_capacity(8);
        q.enqueue(TaskRecord::from_fn(
            |_, _, _| {},
            1,
            0,
            EnqFlags::REQUEUER,
            &[],
        ));
        q.enqueue(rec(2, 1));
        q.enqueue(rec(3, 2));
        let drained = q.drain_for_spill(8);
        assert!(drained.iter().all(|r| !r.flags.contains(EnqFlags::REQUEUER)));
        assert_eq!(q.len(), 3 - drained.len());
    }

    #[test]
    fn fifo_ties_survive_a_spill_round_trip() {
        let mut q = BoundedQueue::with_capacity(8);
        q.enqueue(rec(1, 20));
        q.enqueue(rec(1, 21));
        q.enqueue(rec(5, 22));
        let _ = q.drain_for_spill(1);
        let tags: Vec<u64> = std::iter::from_fn(|| q.dequeue_min())
            .map(|r| tag_of(&r))
            .collect();
        assert_eq!(tags, vec![20, 21]);
    }
}
