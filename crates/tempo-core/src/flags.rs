// SPDX-License-Identifier: Apache-2.0

//! Enqueue flags: OR-able scheduling properties carried by a task.
//!
//! Flags split into two tiers at bit 16:
//! - Bits below 16 are task properties preserved across a spill/coalesce
//!   round-trip (the coalescer intersects them over a batch).
//! - Bits 16 and beyond only make sense relative to the currently running
//!   task and are resolved (then discarded) at enqueue time.

use core::fmt;
use core::ops::{BitAnd, BitOr};

/// Bitset of independent scheduling properties for one enqueue.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EnqFlags(u32);

/// Mask covering the spillable tier (preserved by coalescers).
const SPILLABLE_MASK: u32 = 0x0000_fff0;

impl EnqFlags {
    /// No properties set.
    pub const NOFLAGS: Self = Self(0);

    // Spillable tier: preserved across a spill/coalesce round-trip.
    /// Map the hint to a shard by modulo instead of hashing it.
    pub const NOHASH: Self = Self(1 << 4);
    /// This task will produce more tasks (enqueuers, splitters);
    /// deprioritize it so producers cannot flood consumers.
    pub const PRODUCER: Self = Self(1 << 5);
    /// The task may be executed speculatively.
    pub const MAYSPEC: Self = Self(1 << 6);
    /// The task must not be executed speculatively; it is irrevocable.
    pub const CANTSPEC: Self = Self(1 << 7);
    /// The task has no timestamp and participates in no ordering protocol.
    pub const NOTIMESTAMP: Self = Self(1 << 9);
    /// The task is a requeuer reinserting a previously spilled batch.
    pub const REQUEUER: Self = Self(1 << 10);
    /// The task may run concurrently with same-hint tasks.
    pub const NONSERIALHINT: Self = Self(1 << 11);

    // Non-spillable tier: resolved against the running task at enqueue
    // time and discarded when a task is coalesced.
    /// Ignore the spatial hint; the scheduler assigns one.
    pub const NOHINT: Self = Self(1 << 16);
    /// Reuse the running task's hint (same shard).
    pub const SAMEHINT: Self = Self(1 << 17);
    /// Reuse the running task's function reference (transport elision).
    pub const SAMETASK: Self = Self(1 << 18);
    /// Reuse the running task's timestamp (transport elision).
    pub const SAMETIME: Self = Self(1 << 19);
    /// If the destination is full, requeue the caller and yield instead
    /// of invoking the overflow protocol.
    pub const YIELDIFFULL: Self = Self(1 << 20);
    /// Queue to the parent of the current enqueue target domain.
    pub const PARENTDOMAIN: Self = Self(1 << 21);
    /// Queue to the domain the running task opened with `deepen`.
    pub const SUBDOMAIN: Self = Self(1 << 22);
    /// Queue to the domain enclosing the running task's own domain.
    pub const SUPERDOMAIN: Self = Self(1 << 23);
    /// Run only if the parent task is aborted; discarded on commit.
    pub const RUNONABORT: Self = Self(1 << 24);

    /// Returns the raw bit representation.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Reconstructs a flag set from raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns true if every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns true if any bit of `other` is set in `self`.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Returns true if no bits are set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Restricts to the spillable tier (the bits a coalescer preserves).
    #[inline]
    pub const fn spillable(self) -> Self {
        Self(self.0 & SPILLABLE_MASK)
    }

    /// Removes the bits of `other` from `self`.
    #[inline]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if any domain-routing bit is set.
    #[inline]
    pub const fn routes_domains(self) -> bool {
        self.intersects(Self(
            Self::PARENTDOMAIN.0 | Self::SUBDOMAIN.0 | Self::SUPERDOMAIN.0,
        ))
    }
}

impl BitOr for EnqFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for EnqFlags {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EnqFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnqFlags({:#x})", self.0)
    }
}
