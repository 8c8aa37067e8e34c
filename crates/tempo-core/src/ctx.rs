// SPDX-License-Identifier: Apache-2.0

//! Scheduler context: the per-worker handle task code runs against.
//!
//! A `SchedulerCtx` is an explicit owned object, one per worker, holding
//! the domain stack and the running task's frame metadata. All public
//! enqueue entry points funnel through one resolution path: transient
//! flags are resolved against the current frame, the destination domain
//! and shard are chosen, and the record is inserted (locally, or through
//! the [`Substrate`] for a remote shard).

use std::sync::Arc;

use tracing::debug;

use crate::domain::DomainStack;
use crate::flags::EnqFlags;
use crate::hint::{shard_of, Hint};
use crate::queue::OrderedQueue;
use crate::spill::SpillBatch;
use crate::task::{TaskFn, TaskRecord, Timestamp, NO_TIMESTAMP};

/// The substrate side of the scheduler: how records reach other workers
/// and how the backend tracks liveness. Software backends implement
/// this; a context without a substrate is a self-contained single queue.
pub trait Substrate: Send + Sync {
    /// Delivers a record to another worker's shard.
    fn enqueue_raw(&self, shard: u32, rec: TaskRecord);
    /// Called once for every record that enters the system.
    fn task_created(&self);
    /// Called once when a record's invocation returns.
    fn task_retired(&self);
}

/// Metadata of the currently running task.
#[derive(Clone, Copy)]
struct Frame {
    timestamp: Timestamp,
    hint: u64,
    flags: EnqFlags,
    func: Option<TaskFn>,
    /// Domain index the task was dequeued from.
    home: usize,
}

const IDLE_FRAME: Frame = Frame {
    timestamp: NO_TIMESTAMP,
    hint: 0,
    flags: EnqFlags::NOFLAGS,
    func: None,
    home: 0,
};

/// Per-worker scheduler handle.
pub struct SchedulerCtx {
    domains: DomainStack,
    frame: Frame,
    workers: u32,
    worker_id: u32,
    /// Counter backing deterministic `NOHINT` token assignment.
    auto_hint: u64,
    substrate: Option<Arc<dyn Substrate>>,
}

impl core::fmt::Debug for SchedulerCtx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerCtx")
            .field("workers", &self.workers)
            .field("worker_id", &self.worker_id)
            .field("depth", &self.domains.depth())
            .finish_non_exhaustive()
    }
}

impl SchedulerCtx {
    /// Creates a self-contained context: one physical worker, `workers`
    /// logical shards (shard count affects hint placement and reduce
    /// intermediate sizing, not execution order).
    pub fn new(queue_capacity: usize, workers: u32) -> Self {
        assert!(workers >= 1, "a scheduler needs at least one worker");
        Self {
            domains: DomainStack::new(queue_capacity),
            frame: IDLE_FRAME,
            workers,
            worker_id: 0,
            auto_hint: 0,
            substrate: None,
        }
    }

    /// Creates the context for worker `worker_id` of a distributed
    /// backend.
    pub(crate) fn with_substrate(
        queue_capacity: usize,
        workers: u32,
        worker_id: u32,
        substrate: Arc<dyn Substrate>,
    ) -> Self {
        assert!(worker_id < workers);
        Self {
            domains: DomainStack::new(queue_capacity),
            frame: IDLE_FRAME,
            workers,
            worker_id,
            auto_hint: u64::from(worker_id),
            substrate: Some(substrate),
        }
    }

    /// Number of workers in the topology.
    #[inline]
    pub fn num_workers(&self) -> u32 {
        self.workers
    }

    /// This worker's index.
    #[inline]
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Timestamp of the running task; [`NO_TIMESTAMP`] outside a task.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.frame.timestamp
    }

    /// Timestamp of the task that opened the running task's domain;
    /// [`NO_TIMESTAMP`] in the root domain.
    #[inline]
    pub fn super_timestamp(&self) -> Timestamp {
        self.domains.domain(self.frame.home).creator_ts
    }

    /// Shard the running task's hint maps to. On the distributed
    /// backend this equals the executing worker's id; on a logical
    /// topology it is the contention-free slot index for per-worker
    /// state such as reduction intermediates.
    #[inline]
    pub fn current_shard(&self) -> u32 {
        shard_of(self.frame.hint, self.frame.flags, self.workers)
    }

    /// Opens a nested time domain. Enqueues with timestamps above
    /// `max_ts` route to the parent; pass [`NO_TIMESTAMP`] for an
    /// unbounded domain.
    pub fn deepen(&mut self, max_ts: Timestamp) {
        assert!(
            self.substrate.is_none(),
            "deepen() is not available on the distributed backend"
        );
        self.domains.deepen(self.frame.timestamp, max_ts);
    }

    /// Closes the innermost domain. Fatal usage error if it still holds
    /// queued tasks or if no sub-domain is open.
    pub fn undeepen(&mut self) {
        self.domains.undeepen();
    }

    /// Enqueues a task function with up to its transport's argument
    /// budget of words. Transient hint flags are resolved against the
    /// running task's frame.
    pub fn enqueue(
        &mut self,
        func: TaskFn,
        timestamp: Timestamp,
        hint: impl Into<Hint>,
        args: &[u64],
    ) {
        let hint = hint.into();
        let flags = hint.flags;
        if flags.contains(EnqFlags::RUNONABORT) {
            // Software backends are irrevocable: commits always happen,
            // so an abort handler can never fire.
            debug!("RUNONABORT task discarded (no speculation substrate)");
            return;
        }
        let func = if flags.contains(EnqFlags::SAMETASK) {
            assert!(
                self.frame.func.is_some(),
                "SAMETASK enqueue outside a plain task function"
            );
            self.frame.func.unwrap_or(func)
        } else {
            func
        };
        let timestamp = self.resolve_timestamp(timestamp, flags);
        let token = self.resolve_token(hint.token, flags);
        let rec = TaskRecord::from_fn(func, timestamp, token, flags, args);
        self.dispatch(rec, flags);
    }

    /// Enqueues a one-shot closure as a task. This is the continuation
    /// primitive: sequential-looking code is a chain of these.
    pub fn enqueue_lambda<F>(&mut self, f: F, timestamp: Timestamp, hint: impl Into<Hint>)
    where
        F: FnOnce(&mut SchedulerCtx, Timestamp) + Send + 'static,
    {
        let hint = hint.into();
        let flags = hint.flags;
        if flags.contains(EnqFlags::RUNONABORT) {
            debug!("RUNONABORT lambda discarded (no speculation substrate)");
            return;
        }
        let timestamp = self.resolve_timestamp(timestamp, flags);
        let token = self.resolve_token(hint.token, flags);
        let rec = TaskRecord::from_thunk(f, timestamp, token, flags);
        self.dispatch(rec, flags);
    }

    fn resolve_timestamp(&self, given: Timestamp, flags: EnqFlags) -> Timestamp {
        if flags.contains(EnqFlags::SAMETIME) {
            self.frame.timestamp
        } else if flags.contains(EnqFlags::NOTIMESTAMP) {
            NO_TIMESTAMP
        } else {
            given
        }
    }

    fn resolve_token(&mut self, given: u64, flags: EnqFlags) -> u64 {
        if flags.contains(EnqFlags::SAMEHINT) {
            self.frame.hint
        } else if flags.contains(EnqFlags::NOHINT) {
            let token = self.auto_hint;
            self.auto_hint = self.auto_hint.wrapping_add(u64::from(self.workers));
            token
        } else {
            given
        }
    }

    /// Routes a resolved record to its destination queue.
    fn dispatch(&mut self, rec: TaskRecord, flags: EnqFlags) {
        if let Some(substrate) = &self.substrate {
            substrate.task_created();
            let shard = shard_of(rec.hint, rec.flags, self.workers);
            if shard != self.worker_id {
                substrate.enqueue_raw(shard, rec);
                return;
            }
        }
        let idx = self.domains.route(self.frame.home, flags);
        let idx = self.domains.apply_max_ts(idx, rec.timestamp);
        self.insert_local(idx, rec, flags);
    }

    /// Inserts into a local domain queue, invoking the overflow protocol
    /// when the bound is hit. Never blocks.
    fn insert_local(&mut self, idx: usize, rec: TaskRecord, flags: EnqFlags) {
        let Err((rec, err)) = self.domains.domain_mut(idx).queue.try_enqueue(rec) else {
            return;
        };
        debug!(domain = idx, %err, "destination full");
        if flags.contains(EnqFlags::YIELDIFFULL) {
            // The caller asked to yield rather than trigger a spill; the
            // record still needs a slot, so the bound goes soft by one.
            self.domains.domain_mut(idx).queue.push_unchecked(rec);
            return;
        }
        let queue = &mut self.domains.domain_mut(idx).queue;
        let max = (queue.capacity() / 2).max(1);
        match SpillBatch::coalesce(queue, max) {
            Some(batch) => {
                // In a sub-domain, an all-untimed batch takes the frame
                // form and its placeholder routes to the parent, so the
                // domain can drain and close without waiting on spilled
                // cleanup work. Untimed members carry no timestamps from
                // the domain's private value space, so none leak.
                let shard = u64::from(self.worker_id);
                let (requeuer, dest) = if idx > 0 && batch.flags.contains(EnqFlags::NOTIMESTAMP) {
                    (batch.into_frame_record(shard), idx - 1)
                } else {
                    (batch.into_record(shard), idx)
                };
                if let Some(substrate) = &self.substrate {
                    substrate.task_created();
                }
                self.domains.domain_mut(dest).queue.push_unchecked(requeuer);
                let queue = &mut self.domains.domain_mut(idx).queue;
                if let Err((rec, _)) = queue.try_enqueue(rec) {
                    // A one-record batch frees no net slot; admit past
                    // the bound rather than block.
                    queue.push_unchecked(rec);
                }
            }
            None => {
                // Nothing spill-eligible resident. The bound is a
                // resource-exhaustion signal, not a hard wall.
                self.domains.domain_mut(idx).queue.push_unchecked(rec);
            }
        }
    }

    /// Requeuer body: reinserts a spilled batch into its own domain,
    /// most recently drained first. If the destination fills up again,
    /// re-creates itself from the remainder and yields. Every activation
    /// admits at least one record, so a queue that stays at its bound
    /// cannot pin the placeholder in a dequeue-requeue cycle.
    pub(crate) fn reinsert_spilled(&mut self, mut batch: SpillBatch) {
        let home = self.frame.home;
        let mut admitted = false;
        while let Some(rec) = batch.records.pop() {
            let idx = self.domains.apply_max_ts(home, rec.timestamp);
            let queue = &mut self.domains.domain_mut(idx).queue;
            match queue.try_enqueue(rec) {
                Ok(()) => admitted = true,
                Err((rec, _)) if !admitted => {
                    // The destination refilled before this activation;
                    // the first record goes past the bound so the batch
                    // shrinks on every retry.
                    queue.push_unchecked(rec);
                    admitted = true;
                }
                Err((rec, _)) => {
                    batch.records.push(rec);
                    debug!(remaining = batch.records.len(), "requeuer yielding");
                    let requeuer = batch.into_record(u64::from(self.worker_id));
                    if let Some(substrate) = &self.substrate {
                        substrate.task_created();
                    }
                    self.domains.domain_mut(home).queue.push_unchecked(requeuer);
                    return;
                }
            }
        }
    }

    /// Admits a record that arrived from another worker.
    pub(crate) fn admit(&mut self, rec: TaskRecord) {
        let flags = rec.flags;
        let idx = self.domains.apply_max_ts(self.domains.top_index(), rec.timestamp);
        self.insert_local(idx, rec, flags);
    }

    /// Minimum timestamp resident in the root queue, for local-minimum
    /// publication.
    pub(crate) fn local_min(&self) -> Option<Timestamp> {
        self.domains.domain(0).queue.peek_min_timestamp()
    }

    /// Dequeues and runs one task from the innermost non-empty domain.
    /// Returns false when every domain is drained.
    pub(crate) fn step(&mut self) -> bool {
        let Some(idx) = self.domains.innermost_non_empty() else {
            return false;
        };
        let Some(rec) = self.domains.domain_mut(idx).queue.dequeue_min() else {
            return false;
        };
        self.run_record(idx, rec);
        true
    }

    /// Runs one record with its frame installed.
    pub(crate) fn run_record(&mut self, home: usize, rec: TaskRecord) {
        let saved = self.frame;
        self.frame = Frame {
            timestamp: rec.timestamp,
            hint: rec.hint,
            flags: rec.flags,
            func: match rec.call {
                crate::task::TaskCall::Func { func, .. } => Some(func),
                crate::task::TaskCall::Thunk(_) => None,
            },
            home,
        };
        rec.invoke(self);
        if let Some(substrate) = &self.substrate {
            substrate.task_retired();
        }
        self.frame = saved;
    }

    /// Total records resident across all open domains.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        (0..self.domains.depth())
            .map(|i| self.domains.domain(i).queue.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn drain(ctx: &mut SchedulerCtx) {
        while ctx.step() {}
    }

    #[test]
    fn sametime_reuses_the_frame_timestamp() {
        let mut ctx = SchedulerCtx::new(64, 1);
        let seen = Arc::new(AtomicU64::new(0));
        let outer = Arc::clone(&seen);
        ctx.enqueue_lambda(
            move |ctx, _| {
                let inner = Arc::clone(&outer);
                ctx.enqueue_lambda(
                    move |_, ts| inner.store(ts, Ordering::Relaxed),
                    999, // ignored under SAMETIME
                    EnqFlags::SAMETIME,
                );
            },
            7,
            0u64,
        );
        drain(&mut ctx);
        assert_eq!(seen.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn samehint_reuses_the_frame_token() {
        let mut ctx = SchedulerCtx::new(64, 4);
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let outer = Arc::clone(&seen);
        ctx.enqueue_lambda(
            move |ctx, _| {
                let inner = Arc::clone(&outer);
                let home = ctx.current_shard();
                ctx.enqueue_lambda(
                    move |ctx, _| inner.store(u64::from(ctx.current_shard()), Ordering::Relaxed),
                    1,
                    EnqFlags::SAMEHINT,
                );
                assert_eq!(home, ctx.current_shard());
            },
            0,
            67u64,
        );
        drain(&mut ctx);
        let expected = u64::from(shard_of(67, EnqFlags::NOFLAGS, 4));
        assert_eq!(seen.load(Ordering::Relaxed), expected);
    }

    #[test]
    fn nohint_tokens_are_deterministic() {
        let mut a = SchedulerCtx::new(64, 2);
        let mut b = SchedulerCtx::new(64, 2);
        for ctx in [&mut a, &mut b] {
            ctx.enqueue(|_, _, _| {}, 1, EnqFlags::NOHINT, &[]);
        }
        assert_eq!(a.auto_hint, b.auto_hint);
    }

    #[test]
    fn runonabort_tasks_are_discarded() {
        let mut ctx = SchedulerCtx::new(64, 1);
        ctx.enqueue(|_, _, _| {}, 1, EnqFlags::RUNONABORT, &[]);
        assert_eq!(ctx.queued(), 0);
    }

    #[test]
    fn super_timestamp_sees_the_domain_creator() {
        let mut ctx = SchedulerCtx::new(64, 1);
        let seen = Arc::new(AtomicU64::new(0));
        let outer = Arc::clone(&seen);
        ctx.enqueue_lambda(
            move |ctx, _| {
                ctx.deepen(NO_TIMESTAMP);
                let inner = Arc::clone(&outer);
                ctx.enqueue_lambda(
                    move |ctx, _| inner.store(ctx.super_timestamp(), Ordering::Relaxed),
                    0,
                    0u64,
                );
            },
            11,
            0u64,
        );
        // Drain the sub-domain task, then close the domain.
        drain(&mut ctx);
        ctx.undeepen();
        assert_eq!(seen.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn untimed_sub_domain_overflow_escapes_to_the_parent() {
        let mut ctx = SchedulerCtx::new(4, 1);
        let ran = Arc::new(AtomicU64::new(0));
        let seed = Arc::clone(&ran);
        ctx.enqueue_lambda(
            move |ctx, _| {
                ctx.deepen(NO_TIMESTAMP);
                for _ in 0..10u64 {
                    let ran = Arc::clone(&seed);
                    ctx.enqueue_lambda(
                        move |_, _| {
                            ran.fetch_add(1, Ordering::Relaxed);
                        },
                        NO_TIMESTAMP,
                        EnqFlags::NOTIMESTAMP,
                    );
                }
            },
            0,
            0u64,
        );
        ctx.step();
        // Frame placeholders land in the parent; the sub-domain itself
        // never exceeds its bound.
        assert!(ctx.domains.domain(0).queue.len() >= 1);
        assert!(ctx.domains.domain(1).queue.len() <= 4);
        drain(&mut ctx);
        assert_eq!(ran.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn overflow_coalesces_instead_of_blocking() {
        let mut ctx = SchedulerCtx::new(4, 1);
        for i in 0..32u64 {
            ctx.enqueue(|_, _, _| {}, i, 0u64, &[]);
        }
        // All 32 records are accounted for: resident or inside batches.
        assert!(ctx.queued() <= 32);
        drain(&mut ctx);
        assert_eq!(ctx.queued(), 0);
    }
}
