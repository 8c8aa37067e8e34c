// SPDX-License-Identifier: Apache-2.0
//! tempo-core: ordered task-scheduling runtime with fractal time domains.
//!
//! Tasks carry logical timestamps establishing required execution order,
//! spatial hints guiding placement, and flags describing scheduling
//! properties. Nested time domains give callers private timestamp
//! spaces; bounded queues shed overload by coalescing batches of tasks
//! into requeuer placeholders instead of blocking producers.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod algorithm;
pub mod backend;
mod ctx;
mod domain;
pub mod error;
pub mod fanout;
pub mod flags;
pub mod hint;
pub mod queue;
mod reduce;
mod spill;
pub mod task;

pub use backend::{DistRuntime, SeqRuntime};
pub use ctx::{SchedulerCtx, Substrate};
pub use error::EnqueueError;
pub use fanout::{FanoutPolicy, TsSpec, MAX_CHILDREN};
pub use flags::EnqFlags;
pub use hint::{Hint, CACHE_LINE};
pub use queue::{BoundedQueue, OrderedQueue, TimestampHeap};
pub use task::{
    ArgPack, TaskCall, TaskFn, TaskRecord, Timestamp, MAX_INLINE_ARGS, NO_TIMESTAMP,
};
