// SPDX-License-Identifier: Apache-2.0

//! Spatial hints: opaque locality keys that guide task placement.
//!
//! A hint token carries no ordering semantics; losing or ignoring one may
//! only cost locality, never correctness.

use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::flags::EnqFlags;

/// Cache line size assumed by [`Hint::cache_line`].
pub const CACHE_LINE: usize = 64;

/// A locality token paired with enqueue flags.
///
/// Constructible from a bare token (`67u64.into()`), bare flags
/// (`EnqFlags::NOHINT.into()`), or both via [`Hint::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hint {
    /// Opaque locality key used only to choose a destination shard.
    pub token: u64,
    /// Scheduling flags for this enqueue.
    pub flags: EnqFlags,
}

impl Hint {
    /// Creates a hint with both a token and flags.
    #[inline]
    pub const fn new(token: u64, flags: EnqFlags) -> Self {
        Self { token, flags }
    }

    /// Derives a locality token from the cache line holding `ptr`.
    #[inline]
    pub fn cache_line<T>(ptr: *const T) -> u64 {
        (ptr as usize / CACHE_LINE) as u64
    }

    /// Replaces `NOHINT` with `SAMEHINT`, leaving other flags untouched.
    ///
    /// Tree enqueuers use this for their leftmost child: when placement
    /// is arbitrary anyway, keeping the child local avoids a cross-shard
    /// transfer for the subtree that runs first.
    #[inline]
    pub(crate) const fn replace_no_with_same(flags: EnqFlags) -> EnqFlags {
        if flags.contains(EnqFlags::NOHINT) {
            EnqFlags::from_bits(
                (flags.bits() & !EnqFlags::NOHINT.bits()) | EnqFlags::SAMEHINT.bits(),
            )
        } else {
            flags
        }
    }
}

impl From<u64> for Hint {
    #[inline]
    fn from(token: u64) -> Self {
        Self::new(token, EnqFlags::NOFLAGS)
    }
}

impl From<EnqFlags> for Hint {
    #[inline]
    fn from(flags: EnqFlags) -> Self {
        Self::new(0, flags)
    }
}

/// Maps a hint token to a worker shard.
///
/// Hashed by default so adversarial token distributions still spread;
/// `NOHASH` switches to plain modulo for callers that precomputed their
/// own placement.
#[inline]
pub(crate) fn shard_of(token: u64, flags: EnqFlags, workers: u32) -> u32 {
    debug_assert!(workers >= 1);
    if flags.contains(EnqFlags::NOHASH) {
        (token % u64::from(workers)) as u32
    } else {
        let mut h = FxHasher::default();
        h.write_u64(token);
        (h.finish() % u64::from(workers)) as u32
    }
}
