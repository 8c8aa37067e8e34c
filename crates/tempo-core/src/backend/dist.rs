// SPDX-License-Identifier: Apache-2.0

//! Thread-distributed backend: per-worker queues with local-minimum
//! publication.
//!
//! Each worker owns a [`SchedulerCtx`] and a mutex-protected inbox.
//! Cross-worker enqueues land in the destination inbox and are admitted
//! at the top of the worker loop. After each task a worker republishes
//! the minimum timestamp resident in its queue; a worker whose minimum
//! is not the global minimum yields once before proceeding, so
//! cross-worker ordering is approximate while per-worker order stays
//! exact. Termination is an exact live-record count: every record is
//! counted when created and uncounted when its invocation returns.
//!
//! Domains are per-worker state, so `deepen` is unavailable here; the
//! distributed backend schedules the root domain only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::debug;

use crate::backend::seq::DEFAULT_QUEUE_CAPACITY;
use crate::ctx::{SchedulerCtx, Substrate};
use crate::task::{TaskRecord, Timestamp, NO_TIMESTAMP};

/// Shared cross-worker state: inboxes, published minima, live-record
/// count.
struct Router {
    inboxes: Vec<Mutex<VecDeque<TaskRecord>>>,
    local_min: Vec<AtomicU64>,
    outstanding: AtomicU64,
}

impl Router {
    fn new(workers: u32) -> Self {
        Self {
            inboxes: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
            local_min: (0..workers).map(|_| AtomicU64::new(NO_TIMESTAMP)).collect(),
            outstanding: AtomicU64::new(0),
        }
    }

    fn pop_inbox(&self, id: u32) -> Option<TaskRecord> {
        self.inboxes[id as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn publish_min(&self, id: u32, min: Option<Timestamp>) {
        self.local_min[id as usize].store(min.unwrap_or(NO_TIMESTAMP), Ordering::Release);
    }

    fn global_min(&self) -> Timestamp {
        self.local_min
            .iter()
            .map(|m| m.load(Ordering::Acquire))
            .min()
            .unwrap_or(NO_TIMESTAMP)
    }

    fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Substrate for Router {
    fn enqueue_raw(&self, shard: u32, rec: TaskRecord) {
        debug!(shard, ts = rec.timestamp, "cross-worker enqueue");
        self.inboxes[shard as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(rec);
    }

    fn task_created(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn task_retired(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Multi-threaded runtime over scoped worker threads.
#[derive(Debug)]
pub struct DistRuntime {
    workers: u32,
    queue_capacity: usize,
}

impl DistRuntime {
    /// Creates a runtime with `workers` threads and the default queue
    /// bound.
    pub fn new(workers: u32) -> Self {
        Self::with_config(workers, DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a runtime with an explicit per-worker queue bound.
    pub fn with_config(workers: u32, queue_capacity: usize) -> Self {
        assert!(workers >= 1, "a scheduler needs at least one worker");
        Self {
            workers,
            queue_capacity,
        }
    }

    /// Seeds work on worker 0 and runs every worker to completion.
    /// Returns the number of tasks executed across all workers.
    pub fn run<F>(&self, seed: F) -> u64
    where
        F: FnOnce(&mut SchedulerCtx),
    {
        let router = Arc::new(Router::new(self.workers));
        let mut ctxs: Vec<SchedulerCtx> = (0..self.workers)
            .map(|id| {
                SchedulerCtx::with_substrate(
                    self.queue_capacity,
                    self.workers,
                    id,
                    Arc::clone(&router) as Arc<dyn Substrate>,
                )
            })
            .collect();
        if let Some(first) = ctxs.first_mut() {
            seed(first);
        }

        let executed = AtomicU64::new(0);
        thread::scope(|s| {
            for (id, ctx) in ctxs.iter_mut().enumerate() {
                let router = &router;
                let executed = &executed;
                s.spawn(move || {
                    worker_loop(ctx, router, id as u32, executed);
                });
            }
        });
        executed.load(Ordering::Acquire)
    }
}

fn worker_loop(ctx: &mut SchedulerCtx, router: &Router, id: u32, executed: &AtomicU64) {
    debug!(worker = id, "worker start");
    loop {
        while let Some(rec) = router.pop_inbox(id) {
            ctx.admit(rec);
        }
        let mine = ctx.local_min();
        router.publish_min(id, mine);
        match mine {
            Some(min) => {
                if router.global_min() < min {
                    // Another worker holds the earliest work; give it a
                    // chance to run first. Best effort only.
                    thread::yield_now();
                }
                if ctx.step() {
                    executed.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                if router.outstanding() == 0 {
                    break;
                }
                thread::yield_now();
            }
        }
    }
    router.publish_min(id, None);
    debug!(worker = id, "worker stop");
}
