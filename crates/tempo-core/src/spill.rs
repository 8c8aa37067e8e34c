// SPDX-License-Identifier: Apache-2.0

//! Spill/coalesce backpressure: when a bounded queue fills, fold a batch
//! of resident records into a single placeholder task that reinserts
//! them later.
//!
//! The protocol is conservative in both directions: a coalesced batch
//! preserves every spillable-tier flag its members shared (intersection,
//! so a batch is never more speculative than its most restrictive
//! member), and the requeuer placeholder carries the batch minimum
//! timestamp so no member can be starved past its required order.

use tracing::debug;

use crate::flags::EnqFlags;
use crate::queue::BoundedQueue;
use crate::task::{TaskRecord, Timestamp, NO_TIMESTAMP};

/// Placeholder timestamp for frame-style batches, which are ordered by
/// their parent-domain routing rather than by timestamp value.
pub(crate) const FRAME_SPILL_TS: Timestamp = 42;

/// Flags every requeuer placeholder carries: it must land on its own
/// shard (`NOHASH` on the literal token), it produces tasks when it
/// runs (`PRODUCER`), and it must itself never be spilled (`REQUEUER`).
pub(crate) const REQUEUER_FLAGS: EnqFlags = EnqFlags::from_bits(
    EnqFlags::NOHASH.bits() | EnqFlags::PRODUCER.bits() | EnqFlags::REQUEUER.bits(),
);

/// A batch of records drained from a full queue, with the metadata the
/// requeuer placeholder needs.
#[derive(Debug)]
pub(crate) struct SpillBatch {
    /// Drained records in removal order; reinsertion walks from the
    /// back (most recently drained first).
    pub records: Vec<TaskRecord>,
    /// Minimum timestamp any member requires.
    pub min_ts: Timestamp,
    /// Intersection of the members' spillable-tier flags.
    pub flags: EnqFlags,
}

impl SpillBatch {
    /// Drains up to `max` spill-eligible records from `queue` into a
    /// batch. Returns `None` when nothing was eligible, in which case
    /// the queue is untouched and no placeholder must be enqueued.
    pub fn coalesce(queue: &mut BoundedQueue, max: usize) -> Option<Self> {
        let records = queue.drain_for_spill(max);
        if records.is_empty() {
            return None;
        }

        // Intersection seed: a batch is untimed and irrevocable only if
        // every member is.
        let mut flags = EnqFlags::NOTIMESTAMP | EnqFlags::CANTSPEC;
        let mut timed_min: Option<Timestamp> = None;
        let mut any_untimed = false;
        for rec in &records {
            flags = flags & rec.flags;
            if rec.timestamp == NO_TIMESTAMP || rec.flags.contains(EnqFlags::NOTIMESTAMP) {
                any_untimed = true;
            } else {
                timed_min = Some(timed_min.map_or(rec.timestamp, |m| m.min(rec.timestamp)));
            }
        }

        // An untimed member must not be ordered behind any timed one,
        // so a mixed batch requeues at the earliest possible slot.
        let min_ts = match (any_untimed, timed_min) {
            (true, Some(_)) => 0,
            (true, None) => NO_TIMESTAMP,
            (false, timed) => timed.unwrap_or(NO_TIMESTAMP),
        };

        debug!(
            batch = records.len(),
            min_ts,
            flags = flags.bits(),
            "coalesced spill batch"
        );
        Some(Self {
            records,
            min_ts,
            flags,
        })
    }

    /// Flags for this batch's requeuer placeholder.
    #[inline]
    pub fn requeuer_flags(&self) -> EnqFlags {
        REQUEUER_FLAGS | self.flags
    }

    /// Builds the requeuer placeholder record for this batch.
    ///
    /// `shard_token` is the running worker's literal shard index; with
    /// `NOHASH` it guarantees the placeholder lands on the queue it was
    /// drained from.
    pub fn into_record(self, shard_token: u64) -> TaskRecord {
        let ts = self.min_ts;
        let flags = self.requeuer_flags();
        TaskRecord::from_thunk(
            move |ctx, _| ctx.reinsert_spilled(self),
            ts,
            shard_token,
            flags,
        )
    }

    /// Frame variant, used for all-untimed batches in sub-domains: the
    /// batch is forced irrevocable and carries a fixed placeholder
    /// timestamp instead of its members' minimum. The caller routes the
    /// placeholder to the parent domain, so the sub-domain can drain
    /// and close without waiting on the spilled work. Legal only
    /// because untimed members accept any slot in any domain.
    pub fn into_frame_record(mut self, shard_token: u64) -> TaskRecord {
        self.flags = self.flags | EnqFlags::CANTSPEC;
        self.min_ts = FRAME_SPILL_TS;
        self.into_record(shard_token)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::queue::OrderedQueue;

    fn rec(ts: Timestamp, flags: EnqFlags) -> TaskRecord {
        TaskRecord::from_fn(|_, _, _| {}, ts, 0, flags, &[])
    }

    fn full_queue(records: Vec<TaskRecord>) -> BoundedQueue {
        let mut q = BoundedQueue::with_capacity(records.len().max(2));
        for r in records {
            q.enqueue(r);
        }
        q
    }

    #[test]
    fn empty_queue_coalesces_to_none() {
        let mut q = BoundedQueue::with_capacity(4);
        assert!(SpillBatch::coalesce(&mut q, 4).is_none());
    }

    #[test]
    fn flag_intersection_drops_partial_properties() {
        // Two of three members are CANTSPEC: the batch must not be.
        let mut q = full_queue(vec![
            rec(1, EnqFlags::CANTSPEC),
            rec(2, EnqFlags::CANTSPEC),
            rec(3, EnqFlags::NOFLAGS),
        ]);
        // ts=1 is the resident minimum and is spared, leaving the
        // CANTSPEC member at 2 and the plain member at 3 in the batch.
        let batch = SpillBatch::coalesce(&mut q, 8).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(!batch.flags.contains(EnqFlags::CANTSPEC));
        assert!(!batch.flags.contains(EnqFlags::NOTIMESTAMP));
    }

    #[test]
    fn unanimous_cantspec_survives() {
        let mut q = full_queue(vec![
            rec(1, EnqFlags::CANTSPEC),
            rec(2, EnqFlags::CANTSPEC),
            rec(3, EnqFlags::CANTSPEC),
        ]);
        let batch = SpillBatch::coalesce(&mut q, 8).unwrap();
        assert!(batch.flags.contains(EnqFlags::CANTSPEC));
        assert!(batch
            .requeuer_flags()
            .contains(EnqFlags::REQUEUER | EnqFlags::PRODUCER | EnqFlags::NOHASH));
    }

    #[test]
    fn timed_batch_requeues_at_its_minimum() {
        let mut q = full_queue(vec![
            rec(10, EnqFlags::NOFLAGS),
            rec(20, EnqFlags::NOFLAGS),
            rec(30, EnqFlags::NOFLAGS),
        ]);
        let batch = SpillBatch::coalesce(&mut q, 8).unwrap();
        // The resident minimum (10) is spared; the batch minimum is 20.
        assert_eq!(batch.min_ts, 20);
    }

    #[test]
    fn untimed_batch_stays_untimed() {
        let mut q = full_queue(vec![
            rec(NO_TIMESTAMP, EnqFlags::NOTIMESTAMP),
            rec(NO_TIMESTAMP, EnqFlags::NOTIMESTAMP),
        ]);
        let batch = SpillBatch::coalesce(&mut q, 8).unwrap();
        assert_eq!(batch.min_ts, NO_TIMESTAMP);
        assert!(batch.flags.contains(EnqFlags::NOTIMESTAMP));
    }

    #[test]
    fn untimed_members_drain_before_timed_ones() {
        let mut q = full_queue(vec![
            rec(NO_TIMESTAMP, EnqFlags::NOTIMESTAMP),
            rec(9, EnqFlags::NOFLAGS),
            rec(10, EnqFlags::NOFLAGS),
        ]);
        let first = SpillBatch::coalesce(&mut q, 8).unwrap();
        assert!(first.flags.contains(EnqFlags::NOTIMESTAMP));
        assert_eq!(first.records.len(), 1);

        // With the untimed member gone, a second round takes timed
        // records (sparing the minimum).
        let second = SpillBatch::coalesce(&mut q, 8).unwrap();
        assert_eq!(second.min_ts, 10);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn frame_record_is_irrevocable_at_the_placeholder_slot() {
        let mut q = full_queue(vec![
            rec(NO_TIMESTAMP, EnqFlags::NOTIMESTAMP),
            rec(NO_TIMESTAMP, EnqFlags::NOTIMESTAMP),
        ]);
        let batch = SpillBatch::coalesce(&mut q, 8).unwrap();
        let record = batch.into_frame_record(0);
        assert_eq!(record.timestamp, FRAME_SPILL_TS);
        assert!(record.flags.contains(EnqFlags::CANTSPEC | EnqFlags::REQUEUER));
        assert!(record.flags.contains(EnqFlags::NOTIMESTAMP));
    }
}
