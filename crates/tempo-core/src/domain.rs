// SPDX-License-Identifier: Apache-2.0

//! Fractal time: nested virtual-time domains, each with its own queue.
//!
//! `deepen` pushes a child domain whose timestamps are incomparable
//! with, and logically finer-grained than, the parent's; `undeepen`
//! pops the innermost domain once it has drained. The stack is an
//! explicit owned object held by the scheduler context, not hidden
//! process-global state.

use tracing::debug;

use crate::flags::EnqFlags;
use crate::queue::{BoundedQueue, OrderedQueue};
use crate::task::{Timestamp, NO_TIMESTAMP};

/// One level of the fractal-time stack.
#[derive(Debug)]
pub(crate) struct Domain {
    /// Ordered queue owned exclusively by this domain while open.
    pub queue: BoundedQueue,
    /// Timestamp of the task that opened this domain; `NO_TIMESTAMP`
    /// for the root.
    pub creator_ts: Timestamp,
    /// Upper bound on timestamps that may live here; enqueues above it
    /// route to the parent instead.
    pub max_ts: Timestamp,
}

/// LIFO stack of nested domains; the root is always present.
#[derive(Debug)]
pub(crate) struct DomainStack {
    stack: Vec<Domain>,
    queue_capacity: usize,
}

impl DomainStack {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            stack: vec![Domain {
                queue: BoundedQueue::with_capacity(queue_capacity),
                creator_ts: NO_TIMESTAMP,
                max_ts: NO_TIMESTAMP,
            }],
            queue_capacity,
        }
    }

    /// Number of open domains, root included.
    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Index of the current default enqueue target.
    #[inline]
    pub fn top_index(&self) -> usize {
        self.stack.len() - 1
    }

    #[inline]
    pub fn domain(&self, idx: usize) -> &Domain {
        &self.stack[idx]
    }

    #[inline]
    pub fn domain_mut(&mut self, idx: usize) -> &mut Domain {
        &mut self.stack[idx]
    }

    /// Pushes a child domain created by a task running at `creator_ts`.
    pub fn deepen(&mut self, creator_ts: Timestamp, max_ts: Timestamp) {
        debug!(depth = self.depth(), creator_ts, max_ts, "deepen");
        self.stack.push(Domain {
            queue: BoundedQueue::with_capacity(self.queue_capacity),
            creator_ts,
            max_ts,
        });
    }

    /// Pops the innermost domain.
    ///
    /// Fatal usage errors: closing the root, or closing a domain whose
    /// queue has not drained.
    pub fn undeepen(&mut self) {
        assert!(
            self.stack.len() > 1,
            "undeepen() called with no open sub-domain"
        );
        let top = self.top_index();
        assert!(
            self.stack[top].queue.is_empty(),
            "undeepen() called on a non-empty domain ({} tasks still queued)",
            self.stack[top].queue.len(),
        );
        debug!(depth = self.depth(), "undeepen");
        self.stack.pop();
    }

    /// Resolves the destination domain index for an enqueue.
    ///
    /// `home` is the running task's own domain; the default target is
    /// the stack top. `PARENTDOMAIN` targets the parent of the default
    /// target, `SUBDOMAIN` the domain the task opened, `SUPERDOMAIN`
    /// the domain enclosing the task's home.
    pub fn route(&self, home: usize, flags: EnqFlags) -> usize {
        let top = self.top_index();
        if flags.contains(EnqFlags::SUBDOMAIN) {
            let sub = home + 1;
            assert!(
                sub <= top,
                "SUBDOMAIN routing requires the task to have called deepen()"
            );
            sub
        } else if flags.contains(EnqFlags::PARENTDOMAIN) {
            assert!(top > 0, "PARENTDOMAIN routing from the root domain");
            top - 1
        } else if flags.contains(EnqFlags::SUPERDOMAIN) {
            assert!(home > 0, "SUPERDOMAIN routing from a root-domain task");
            home - 1
        } else {
            top
        }
    }

    /// Applies the per-domain timestamp bound: a timestamp above a
    /// domain's `max_ts` belongs to the parent's value space.
    pub fn apply_max_ts(&self, mut idx: usize, ts: Timestamp) -> usize {
        if ts == NO_TIMESTAMP {
            return idx;
        }
        while idx > 0 && ts > self.stack[idx].max_ts {
            idx -= 1;
        }
        idx
    }

    /// Index of the innermost domain with queued work.
    pub fn innermost_non_empty(&self) -> Option<usize> {
        (0..self.stack.len()).rev().find(|&i| !self.stack[i].queue.is_empty())
    }
}
