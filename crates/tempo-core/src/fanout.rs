// SPDX-License-Identifier: Apache-2.0

//! Parallel decomposition: turning one logical bulk enqueue into a
//! self-expanding set of enqueuer tasks.
//!
//! Every policy produces exactly one leaf enqueue per element of the
//! range. Policies differ only in how the expansion itself is shaped,
//! which is a throughput knob: width and stride never affect results.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::ctx::SchedulerCtx;
use crate::flags::EnqFlags;
use crate::hint::Hint;
use crate::task::Timestamp;

/// Leaf threshold and maximum fanout of tree expansion.
pub const MAX_CHILDREN: u64 = 8;

/// Elements an expansion task handles before re-enqueueing itself.
const ENQUEUES_PER_TASK: u64 = 4;

/// How a bulk enqueue expands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanoutPolicy {
    /// Complete n-ary tree of enqueuer tasks; fanout widens with range
    /// size up to [`MAX_CHILDREN`].
    Tree,
    /// Fixed set of strands (capped at `4 * num_workers`), each walking
    /// the range at a stride.
    Strands,
    /// Starts a single strand immediately and doubles the strand count
    /// as it walks, so first leaves appear without waiting for the full
    /// expansion.
    Progressive,
}

/// Timestamp assignment for the elements of a bulk enqueue.
#[derive(Clone)]
pub enum TsSpec {
    /// Every element at the same timestamp.
    Constant(Timestamp),
    /// Per-element timestamp function of the index.
    PerIndex(Arc<dyn Fn(u64) -> Timestamp + Send + Sync>),
}

impl TsSpec {
    /// Timestamp for element `i`.
    #[inline]
    pub fn at(&self, i: u64) -> Timestamp {
        match self {
            Self::Constant(ts) => *ts,
            Self::PerIndex(f) => f(i),
        }
    }

    /// Wraps a per-index timestamp function.
    pub fn per_index<F>(f: F) -> Self
    where
        F: Fn(u64) -> Timestamp + Send + Sync + 'static,
    {
        Self::PerIndex(Arc::new(f))
    }
}

impl From<Timestamp> for TsSpec {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        Self::Constant(ts)
    }
}

/// Shared state of one bulk enqueue: the per-element callback and the
/// timestamp source, cloned into every expansion task.
struct FanoutState {
    enq_one: Box<dyn Fn(&mut SchedulerCtx, u64) + Send + Sync>,
    ts: TsSpec,
}

impl SchedulerCtx {
    /// Enqueues `enq_one(ctx, i)` for every `i` in `range`, expanding in
    /// parallel under `policy`. `enq_one` performs the element's actual
    /// enqueue (or any other per-index effect) and must tolerate running
    /// on any worker.
    pub fn enqueue_all<F>(
        &mut self,
        range: Range<u64>,
        enq_one: F,
        ts: impl Into<TsSpec>,
        policy: FanoutPolicy,
    ) where
        F: Fn(&mut SchedulerCtx, u64) + Send + Sync + 'static,
    {
        let state = Arc::new(FanoutState {
            enq_one: Box::new(enq_one),
            ts: ts.into(),
        });
        if range.is_empty() {
            return;
        }
        match policy {
            FanoutPolicy::Tree => spawn_tree(self, &state, range, true),
            FanoutPolicy::Strands => {
                let n = range.end - range.start;
                let cap = 4 * u64::from(self.num_workers());
                let strands = n.div_ceil(ENQUEUES_PER_TASK).clamp(1, cap);
                for s in 0..strands {
                    spawn_strand(self, &state, range.start + s, range.end, strands, s == 0);
                }
            }
            FanoutPolicy::Progressive => {
                spawn_progressive(self, &state, range, true);
            }
        }
    }

    /// Ordered bulk loop with a termination continuation: runs
    /// `body(ctx, i)` as its own task for every `i` in `range`, then
    /// enqueues `done` once every body task has finished.
    pub fn forall<B, C>(&mut self, range: Range<u64>, body: B, ts: impl Into<TsSpec>, done: C)
    where
        B: Fn(&mut SchedulerCtx, u64) + Send + Sync + 'static,
        C: FnOnce(&mut SchedulerCtx) + Send + 'static,
    {
        let ts = ts.into();
        if range.is_empty() {
            self.enqueue_lambda(move |ctx, _| done(ctx), self.timestamp(), EnqFlags::SAMETIME);
            return;
        }
        let tracker = Arc::new(ForallTracker {
            remaining: AtomicU64::new(range.end - range.start),
            done: Mutex::new(Some(Box::new(done))),
        });
        let body = Arc::new(body);
        let leaf_ts = ts.clone();
        self.enqueue_all(
            range,
            move |ctx, i| {
                let body = Arc::clone(&body);
                let tracker = Arc::clone(&tracker);
                ctx.enqueue_lambda(
                    move |ctx, _| {
                        body(ctx, i);
                        tracker.retire(ctx);
                    },
                    leaf_ts.at(i),
                    Hint::new(i, EnqFlags::NOFLAGS),
                );
            },
            ts,
            FanoutPolicy::Strands,
        );
    }
}

/// Completion state of one `forall`.
struct ForallTracker {
    remaining: AtomicU64,
    done: Mutex<Option<Box<dyn FnOnce(&mut SchedulerCtx) + Send>>>,
}

impl ForallTracker {
    /// Marks one body task finished; the last one enqueues the
    /// continuation at its own timestamp.
    fn retire(&self, ctx: &mut SchedulerCtx) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let done = self
                .done
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(done) = done {
                ctx.enqueue_lambda(move |ctx, _| done(ctx), 0, EnqFlags::SAMETIME);
            }
        }
    }
}

/// Fanout for a tree node covering `n` elements: full width for large
/// ranges, a narrower power of two when the range is close to the leaf
/// threshold so children still get several leaves each.
fn fanout_for(n: u64) -> u64 {
    if n > MAX_CHILDREN * MAX_CHILDREN / 2 {
        MAX_CHILDREN
    } else {
        n.div_ceil(MAX_CHILDREN)
            .next_power_of_two()
            .clamp(2, MAX_CHILDREN)
    }
}

fn spawn_tree(ctx: &mut SchedulerCtx, state: &Arc<FanoutState>, range: Range<u64>, leftmost: bool) {
    let n = range.end - range.start;
    if n <= MAX_CHILDREN {
        for i in range {
            (state.enq_one)(ctx, i);
        }
        return;
    }
    let fanout = fanout_for(n);
    let chunk = n.div_ceil(fanout);
    let mut lo = range.start;
    let mut first = true;
    while lo < range.end {
        let hi = (lo + chunk).min(range.end);
        let child = Arc::clone(state);
        let child_range = lo..hi;
        let child_leftmost = leftmost && first;
        // Splitters produce more tasks; the leftmost child stays on the
        // current shard so the subtree that runs first pays no transfer.
        let base = EnqFlags::PRODUCER | EnqFlags::NOHINT;
        let flags = if child_leftmost {
            Hint::replace_no_with_same(base)
        } else {
            base
        };
        ctx.enqueue_lambda(
            move |ctx, _| spawn_tree(ctx, &child, child_range, child_leftmost),
            state.ts.at(lo),
            Hint::new(0, flags),
        );
        lo = hi;
        first = false;
    }
}

fn spawn_strand(
    ctx: &mut SchedulerCtx,
    state: &Arc<FanoutState>,
    start: u64,
    end: u64,
    stride: u64,
    local: bool,
) {
    let child = Arc::clone(state);
    // The first strand stays local; the rest scatter.
    let flags = if local {
        EnqFlags::PRODUCER | EnqFlags::SAMEHINT
    } else {
        EnqFlags::PRODUCER | EnqFlags::NOHINT
    };
    ctx.enqueue_lambda(
        move |ctx, _| run_strand(ctx, &child, start, end, stride),
        state.ts.at(start),
        Hint::new(0, flags),
    );
}

fn run_strand(ctx: &mut SchedulerCtx, state: &Arc<FanoutState>, start: u64, end: u64, stride: u64) {
    let mut i = start;
    let mut handled = 0;
    while i < end && handled < ENQUEUES_PER_TASK {
        (state.enq_one)(ctx, i);
        i += stride;
        handled += 1;
    }
    if i < end {
        // Continue on the same shard; the strand is already placed.
        let child = Arc::clone(state);
        ctx.enqueue_lambda(
            move |ctx, _| run_strand(ctx, &child, i, end, stride),
            state.ts.at(i),
            Hint::new(0, EnqFlags::PRODUCER | EnqFlags::SAMEHINT),
        );
    }
}

fn spawn_progressive(
    ctx: &mut SchedulerCtx,
    state: &Arc<FanoutState>,
    range: Range<u64>,
    local: bool,
) {
    let child = Arc::clone(state);
    let flags = if local {
        EnqFlags::PRODUCER | EnqFlags::SAMEHINT
    } else {
        EnqFlags::PRODUCER | EnqFlags::NOHINT
    };
    ctx.enqueue_lambda(
        move |ctx, _| run_progressive(ctx, &child, range),
        state.ts.at(0),
        Hint::new(0, flags),
    );
}

fn run_progressive(ctx: &mut SchedulerCtx, state: &Arc<FanoutState>, range: Range<u64>) {
    let mut i = range.start;
    let mut handled = 0;
    while i < range.end && handled < ENQUEUES_PER_TASK {
        (state.enq_one)(ctx, i);
        i += 1;
        handled += 1;
    }
    let remaining = range.end - i;
    if remaining == 0 {
        return;
    }
    if remaining > ENQUEUES_PER_TASK {
        // Split the tail in half: strand count doubles every round, so
        // leaves start immediately and width grows with the work left.
        let mid = i + remaining / 2;
        spawn_progressive(ctx, state, i..mid, true);
        spawn_progressive(ctx, state, mid..range.end, false);
    } else {
        spawn_progressive(ctx, state, i..range.end, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SeqRuntime;

    fn count_leaves(policy: FanoutPolicy, n: u64, workers: u32) -> u64 {
        let mut rt = SeqRuntime::with_config(1024, workers);
        let count = Arc::new(AtomicU64::new(0));
        let seed = Arc::clone(&count);
        rt.ctx().enqueue_lambda(
            move |ctx, _| {
                ctx.enqueue_all(
                    0..n,
                    move |_, _| {
                        seed.fetch_add(1, Ordering::Relaxed);
                    },
                    1u64,
                    policy,
                );
            },
            0,
            0u64,
        );
        rt.run();
        count.load(Ordering::Relaxed)
    }

    #[test]
    fn tree_reaches_every_element() {
        for n in [0u64, 1, 7, 8, 9, 64, 65, 1000] {
            assert_eq!(count_leaves(FanoutPolicy::Tree, n, 4), n, "n={n}");
        }
    }

    #[test]
    fn strands_reach_every_element() {
        for n in [0u64, 1, 7, 8, 9, 64, 65, 1000] {
            assert_eq!(count_leaves(FanoutPolicy::Strands, n, 4), n, "n={n}");
        }
    }

    #[test]
    fn progressive_reaches_every_element() {
        for n in [0u64, 1, 7, 8, 9, 64, 65, 1000] {
            assert_eq!(count_leaves(FanoutPolicy::Progressive, n, 4), n, "n={n}");
        }
    }

    #[test]
    fn fanout_narrows_near_the_leaf_threshold() {
        assert_eq!(fanout_for(1000), MAX_CHILDREN);
        assert_eq!(fanout_for(33), MAX_CHILDREN);
        assert!(fanout_for(16) < MAX_CHILDREN);
        assert!(fanout_for(9) >= 2);
    }

    #[test]
    fn forall_runs_done_after_every_body() {
        let mut rt = SeqRuntime::new();
        let count = Arc::new(AtomicU64::new(0));
        let at_done = Arc::new(AtomicU64::new(u64::MAX));
        let (c, d) = (Arc::clone(&count), Arc::clone(&at_done));
        rt.ctx().enqueue_lambda(
            move |ctx, _| {
                let body_count = Arc::clone(&c);
                let done_seen = Arc::clone(&d);
                let done_count = Arc::clone(&c);
                ctx.forall(
                    0..100,
                    move |_, _| {
                        body_count.fetch_add(1, Ordering::Relaxed);
                    },
                    TsSpec::per_index(|i| i + 1),
                    move |_| {
                        done_seen.store(done_count.load(Ordering::Relaxed), Ordering::Relaxed);
                    },
                );
            },
            0,
            0u64,
        );
        rt.run();
        assert_eq!(count.load(Ordering::Relaxed), 100);
        assert_eq!(at_done.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn empty_forall_still_completes() {
        let mut rt = SeqRuntime::new();
        let done = Arc::new(AtomicU64::new(0));
        let d = Arc::clone(&done);
        rt.ctx().enqueue_lambda(
            move |ctx, _| {
                let d = Arc::clone(&d);
                ctx.forall(
                    5..5,
                    |_, _| {},
                    1u64,
                    move |_| {
                        d.store(1, Ordering::Relaxed);
                    },
                );
            },
            0,
            0u64,
        );
        rt.run();
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }
}
