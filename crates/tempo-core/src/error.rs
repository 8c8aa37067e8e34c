// SPDX-License-Identifier: Apache-2.0

//! Error types for the bounded-queue edge.

use thiserror::Error;

/// Errors from attempting to place a record in a bounded queue.
///
/// These never escape the public enqueue API: a full destination is
/// resource exhaustion handled by the spill/coalesce protocol, not an
/// error surfaced to callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The destination queue is at its capacity bound.
    #[error("destination queue is full ({capacity} records)")]
    QueueFull {
        /// The bound that was hit.
        capacity: usize,
    },
}
