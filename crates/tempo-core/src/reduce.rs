// SPDX-License-Identifier: Apache-2.0

//! Parallel reduction over a shared slice.
//!
//! Elements are folded block by block into one intermediate slot per
//! worker (no contention on the hot path), then collapsed in worker
//! order. The whole reduction runs inside a nested time domain, so it
//! is atomic with respect to the caller's timestamp: callers only ever
//! observe the final value, delivered through a callback in the parent
//! domain.
//!
//! Associative non-commutative operators are supported: blocks fold in
//! range order, a worker's blocks are contiguous and merge in ascending
//! order, and the collapse walks workers in index order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::ctx::SchedulerCtx;
use crate::flags::EnqFlags;
use crate::hint::{Hint, CACHE_LINE};
use crate::task::{Timestamp, NO_TIMESTAMP};

/// Elements per block: one cache line's worth, minimum 2. Shared with
/// the slice algorithms, which split work on the same granularity.
pub(crate) const fn block_size<T>() -> usize {
    let size = core::mem::size_of::<T>();
    let size = if size == 0 { 1 } else { size };
    let per_line = CACHE_LINE / size;
    if per_line < 2 {
        2
    } else {
        per_line
    }
}

/// Shared state of one in-flight reduction.
struct ReduceState<T> {
    items: Arc<[T]>,
    identity: T,
    op: Box<dyn Fn(T, T) -> T + Send + Sync>,
    /// One intermediate per worker, merged in block order.
    partials: Vec<Mutex<Option<T>>>,
    /// Accumulation blocks still outstanding.
    pending: AtomicU64,
    callback: Mutex<Option<Box<dyn FnOnce(&mut SchedulerCtx, Timestamp, T) + Send>>>,
    /// Caller's timestamp; the callback is delivered at it.
    outer_ts: Timestamp,
}

impl SchedulerCtx {
    /// Reduces `items` with the associative operator `op` (with
    /// `identity` as its unit), then enqueues
    /// `callback(ctx, ts, result)`.
    ///
    /// A degenerate single-block input folds serially without opening a
    /// domain. Everything larger deepens, so intermediate states are
    /// invisible outside the reduction.
    pub fn reduce<T, Op, Cb>(
        &mut self,
        items: Arc<[T]>,
        identity: T,
        op: Op,
        ts: Timestamp,
        callback: Cb,
    ) where
        T: Clone + Send + Sync + 'static,
        Op: Fn(T, T) -> T + Send + Sync + 'static,
        Cb: FnOnce(&mut SchedulerCtx, Timestamp, T) + Send + 'static,
    {
        let bs = block_size::<T>();
        let blocks = items.len().div_ceil(bs).max(1);
        if blocks <= 1 {
            let mut acc = identity;
            for x in items.iter() {
                acc = op(acc, x.clone());
            }
            self.enqueue_lambda(move |ctx, t| callback(ctx, t, acc), ts, 0u64);
            return;
        }

        debug!(items = items.len(), blocks, "parallel reduce");
        self.deepen(NO_TIMESTAMP);
        let workers = self.num_workers() as usize;
        let state = Arc::new(ReduceState {
            items,
            identity,
            op: Box::new(op),
            partials: (0..workers).map(|_| Mutex::new(None)).collect(),
            pending: AtomicU64::new(blocks as u64),
            callback: Mutex::new(Some(Box::new(callback))),
            outer_ts: ts,
        });
        for b in 0..blocks {
            // Contiguous block ranges per worker keep cross-worker merge
            // order equal to range order.
            let slot = (b * workers / blocks) as u64;
            let st = Arc::clone(&state);
            self.enqueue_lambda(
                move |ctx, _| accumulate(ctx, &st, b),
                1,
                Hint::new(slot, EnqFlags::NOHASH),
            );
        }
    }
}

/// Folds one block and merges it into this worker's intermediate. The
/// last block to finish enqueues the collapse.
fn accumulate<T>(ctx: &mut SchedulerCtx, state: &Arc<ReduceState<T>>, block: usize)
where
    T: Clone + Send + Sync + 'static,
{
    let bs = block_size::<T>();
    let lo = block * bs;
    let hi = (lo + bs).min(state.items.len());
    let mut acc = state.identity.clone();
    for x in &state.items[lo..hi] {
        acc = (state.op)(acc, x.clone());
    }

    let slot = ctx.current_shard() as usize;
    {
        let mut partial = state.partials[slot]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *partial = Some(match partial.take() {
            None => acc,
            Some(prev) => (state.op)(prev, acc),
        });
    }

    if state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
        let st = Arc::clone(state);
        // The collapse is irrevocable: it consumes the intermediates.
        ctx.enqueue_lambda(
            move |ctx, _| collapse(ctx, &st),
            2,
            Hint::new(0, EnqFlags::CANTSPEC | EnqFlags::SAMEHINT),
        );
    }
}

/// Combines the per-worker intermediates in worker order, delivers the
/// callback to the parent domain, and closes the reduction's domain.
fn collapse<T>(ctx: &mut SchedulerCtx, state: &Arc<ReduceState<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let mut acc = state.identity.clone();
    for slot in &state.partials {
        let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(part) = taken {
            acc = (state.op)(acc, part);
        }
    }
    let cb = state
        .callback
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(cb) = cb {
        ctx.enqueue_lambda(
            move |ctx, t| cb(ctx, t, acc),
            state.outer_ts,
            Hint::new(0, EnqFlags::PARENTDOMAIN),
        );
    }
    ctx.undeepen();
}
