// SPDX-License-Identifier: Apache-2.0

//! Sequential backend: one consumer loop over the domain stack.
//!
//! Drains the innermost non-empty domain in strict timestamp order,
//! including tasks enqueued while draining. The logical worker count is
//! configurable: it changes hint placement and per-worker state sizing
//! (reductions), never execution order, which makes multi-worker
//! semantics testable deterministically.

use tracing::debug;

use crate::ctx::SchedulerCtx;

/// Default queue bound per domain.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Single-threaded runtime.
#[derive(Debug)]
pub struct SeqRuntime {
    ctx: SchedulerCtx,
}

impl Default for SeqRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqRuntime {
    /// Creates a runtime with the default queue bound and one logical
    /// worker.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_QUEUE_CAPACITY, 1)
    }

    /// Creates a runtime with an explicit queue bound and logical worker
    /// count.
    pub fn with_config(queue_capacity: usize, workers: u32) -> Self {
        Self {
            ctx: SchedulerCtx::new(queue_capacity, workers),
        }
    }

    /// The scheduler handle, for seeding work before [`SeqRuntime::run`]
    /// and inspecting state after.
    pub fn ctx(&mut self) -> &mut SchedulerCtx {
        &mut self.ctx
    }

    /// Runs until every open domain is drained. Returns the number of
    /// tasks executed.
    pub fn run(&mut self) -> u64 {
        let mut executed = 0u64;
        while self.ctx.step() {
            executed += 1;
        }
        debug!(executed, "sequential drain complete");
        executed
    }
}
