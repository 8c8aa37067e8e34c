// SPDX-License-Identifier: Apache-2.0

//! Parallel slice algorithms: bulk fill and copy expressed as task
//! trees.
//!
//! Both split their index range recursively on block boundaries (one
//! cache line's worth of elements, the granularity `reduce` also uses),
//! so concurrent writers on different shards never touch the same
//! block. The base case handles one block serially. Element stores go
//! through a caller-supplied writer closure: the runtime owns the
//! decomposition and placement, the caller owns the storage.

use std::ops::Range;
use std::sync::Arc;

use crate::ctx::SchedulerCtx;
use crate::flags::EnqFlags;
use crate::hint::Hint;
use crate::reduce::block_size;
use crate::task::Timestamp;

/// Shared state of one splitting algorithm: the block granularity and
/// the serial handler for one block-aligned chunk.
struct SplitState {
    block: u64,
    apply: Box<dyn Fn(Range<u64>) + Send + Sync>,
}

impl SchedulerCtx {
    /// Writes `value` to every index of `range` through `write`, in
    /// parallel at timestamp `ts`.
    pub fn fill<T, W>(&mut self, range: Range<u64>, value: T, write: W, ts: Timestamp)
    where
        T: Send + Sync + 'static,
        W: Fn(u64, &T) + Send + Sync + 'static,
    {
        let state = Arc::new(SplitState {
            block: block_size::<T>() as u64,
            apply: Box::new(move |chunk| {
                for i in chunk {
                    write(i, &value);
                }
            }),
        });
        self.enqueue_lambda(
            move |ctx, ts| split(ctx, &state, range, ts),
            ts,
            EnqFlags::NOHINT,
        );
    }

    /// Copies every element of `src` to the same index of a destination
    /// through `write`, in parallel at timestamp `ts`. Ranges must not
    /// overlap; the writer sees each index exactly once.
    pub fn copy<T, W>(&mut self, src: Arc<[T]>, write: W, ts: Timestamp)
    where
        T: Clone + Send + Sync + 'static,
        W: Fn(u64, T) + Send + Sync + 'static,
    {
        let len = src.len() as u64;
        let state = Arc::new(SplitState {
            block: block_size::<T>() as u64,
            apply: Box::new(move |chunk| {
                for i in chunk {
                    write(i, src[i as usize].clone());
                }
            }),
        });
        self.enqueue_lambda(
            move |ctx, ts| split(ctx, &state, 0..len, ts),
            ts,
            EnqFlags::NOHINT,
        );
    }
}

/// Split point aligned down to a block boundary, strictly inside the
/// range. Callers guarantee the range is longer than one block.
fn cut_point(range: &Range<u64>, block: u64) -> u64 {
    let mid = range.start + (range.end - range.start) / 2;
    let aligned = mid - mid % block;
    if aligned > range.start {
        aligned
    } else {
        range.start + block
    }
}

fn split(ctx: &mut SchedulerCtx, state: &Arc<SplitState>, range: Range<u64>, ts: Timestamp) {
    let n = range.end - range.start;
    if n == 0 {
        return;
    }
    if n <= state.block {
        (state.apply)(range);
        return;
    }
    let cut = cut_point(&range, state.block);
    let left = range.start..cut;
    let right = cut..range.end;
    // Same idiom as the tree enqueuer: the left half stays on the
    // current shard, the right half scatters.
    let base = EnqFlags::PRODUCER | EnqFlags::NOHINT;
    let left_flags = Hint::replace_no_with_same(base);
    let (l, r) = (Arc::clone(state), Arc::clone(state));
    ctx.enqueue_lambda(
        move |ctx, ts| split(ctx, &l, left, ts),
        ts,
        Hint::new(0, left_flags),
    );
    ctx.enqueue_lambda(
        move |ctx, ts| split(ctx, &r, right, ts),
        ts,
        Hint::new(0, base),
    );
}
