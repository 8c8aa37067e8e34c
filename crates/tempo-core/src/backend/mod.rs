// SPDX-License-Identifier: Apache-2.0

//! Software execution backends.
//!
//! Two reference backends drive a [`crate::SchedulerCtx`]: a sequential
//! runtime that drains one queue in strict timestamp order, and a
//! thread-distributed runtime with per-worker queues and local-minimum
//! publication.

pub mod dist;
pub mod seq;

pub use dist::DistRuntime;
pub use seq::SeqRuntime;
