// SPDX-License-Identifier: Apache-2.0

//! Task records: the enqueueable unit of work.
//!
//! A record carries a timestamp, a resolved hint token, its spillable
//! flags, and its call payload. Records are immutable after creation,
//! owned by whichever queue currently holds them, and consumed when run.

use core::fmt;

use crate::ctx::SchedulerCtx;
use crate::flags::EnqFlags;

/// Total-order key establishing required execution order.
/// Lower values are logically earlier.
pub type Timestamp = u64;

/// Reserved timestamp meaning "participates in no ordering protocol".
pub const NO_TIMESTAMP: Timestamp = u64::MAX;

/// Argument words that travel inline with a task record.
///
/// Longer lists are heap-boxed as a single indirect argument; this is a
/// property of the transport, not of scheduling semantics.
pub const MAX_INLINE_ARGS: usize = 5;

/// Hard cap on boxed argument lists. Exceeding it is a fatal usage
/// error: such a list cannot be represented in the transport budget.
pub const MAX_BOXED_ARGS: usize = 64;

/// A task function: receives the scheduler context, its own timestamp,
/// and its argument words.
pub type TaskFn = fn(&mut SchedulerCtx, Timestamp, &ArgPack);

/// Transport representation of a task's argument list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgPack {
    /// Up to [`MAX_INLINE_ARGS`] words carried inline.
    Inline {
        /// Number of live words in `words`.
        len: u8,
        /// Argument word storage; only `words[..len]` is meaningful.
        words: [u64; MAX_INLINE_ARGS],
    },
    /// Oversized lists boxed as one indirect argument.
    Boxed(Box<[u64]>),
}

impl ArgPack {
    /// Packs `words` into the transport representation.
    ///
    /// Lists longer than [`MAX_INLINE_ARGS`] are boxed. Lists longer
    /// than [`MAX_BOXED_ARGS`] abort: they cannot be represented even
    /// when boxed.
    pub fn pack(words: &[u64]) -> Self {
        assert!(
            words.len() <= MAX_BOXED_ARGS,
            "argument list of {} words exceeds the transport budget ({MAX_BOXED_ARGS})",
            words.len(),
        );
        if words.len() <= MAX_INLINE_ARGS {
            let mut inline = [0u64; MAX_INLINE_ARGS];
            inline[..words.len()].copy_from_slice(words);
            Self::Inline {
                len: words.len() as u8,
                words: inline,
            }
        } else {
            Self::Boxed(words.into())
        }
    }

    /// An empty argument list.
    #[inline]
    pub const fn empty() -> Self {
        Self::Inline {
            len: 0,
            words: [0u64; MAX_INLINE_ARGS],
        }
    }

    /// Returns the live argument words.
    #[inline]
    pub fn as_slice(&self) -> &[u64] {
        match self {
            Self::Inline { len, words } => &words[..usize::from(*len)],
            Self::Boxed(words) => words,
        }
    }

    /// Returns argument word `i`.
    ///
    /// Aborts if `i` is out of range; a mismatched arity between an
    /// enqueue and its task function is a usage error, not a runtime
    /// condition.
    #[inline]
    pub fn word(&self, i: usize) -> u64 {
        let words = self.as_slice();
        assert!(
            i < words.len(),
            "task argument {i} requested but only {} were enqueued",
            words.len(),
        );
        words[i]
    }

    /// Number of argument words.
    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true if no arguments were packed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// The call payload of a task record.
pub enum TaskCall {
    /// A plain task function plus its packed argument words.
    Func {
        /// Function to invoke.
        func: TaskFn,
        /// Packed argument words.
        args: ArgPack,
    },
    /// A boxed one-shot continuation (captured closure). This is how
    /// sequential-looking code is expressed as a task chain: the
    /// closure plus its resumption timestamp is an ordinary record.
    Thunk(Box<dyn FnOnce(&mut SchedulerCtx, Timestamp) + Send>),
}

impl fmt::Debug for TaskCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Func { args, .. } => f.debug_struct("Func").field("args", args).finish(),
            Self::Thunk(_) => f.write_str("Thunk"),
        }
    }
}

/// An enqueueable unit of work.
#[derive(Debug)]
pub struct TaskRecord {
    /// Logical timestamp; [`NO_TIMESTAMP`] for untimed tasks.
    pub timestamp: Timestamp,
    /// Resolved locality token (elision flags already applied).
    pub hint: u64,
    /// Spillable-tier flags carried by the record.
    pub flags: EnqFlags,
    /// The call payload, consumed when the record runs.
    pub call: TaskCall,
}

impl TaskRecord {
    /// Creates a record from a task function and argument words.
    pub fn from_fn(
        func: TaskFn,
        timestamp: Timestamp,
        hint: u64,
        flags: EnqFlags,
        args: &[u64],
    ) -> Self {
        Self {
            timestamp,
            hint,
            flags: flags.spillable(),
            call: TaskCall::Func {
                func,
                args: ArgPack::pack(args),
            },
        }
    }

    /// Creates a record from a one-shot continuation.
    pub fn from_thunk<F>(f: F, timestamp: Timestamp, hint: u64, flags: EnqFlags) -> Self
    where
        F: FnOnce(&mut SchedulerCtx, Timestamp) + Send + 'static,
    {
        Self {
            timestamp,
            hint,
            flags: flags.spillable(),
            call: TaskCall::Thunk(Box::new(f)),
        }
    }

    /// Consumes the record and runs its payload.
    pub fn invoke(self, ctx: &mut SchedulerCtx) {
        let ts = self.timestamp;
        match self.call {
            TaskCall::Func { func, args } => func(ctx, ts, &args),
            TaskCall::Thunk(thunk) => thunk(ctx, ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_lists_stay_inline() {
        let p = ArgPack::pack(&[1, 2, 3]);
        assert!(matches!(p, ArgPack::Inline { len: 3, .. }));
        assert_eq!(p.as_slice(), &[1, 2, 3]);
        assert_eq!(p.word(2), 3);
    }

    #[test]
    fn long_lists_are_boxed() {
        let words: Vec<u64> = (0..12).collect();
        let p = ArgPack::pack(&words);
        assert!(matches!(p, ArgPack::Boxed(_)));
        assert_eq!(p.len(), 12);
        assert_eq!(p.word(11), 11);
    }

    #[test]
    #[should_panic(expected = "exceeds the transport budget")]
    fn oversized_lists_abort() {
        let words = vec![0u64; MAX_BOXED_ARGS + 1];
        let _ = ArgPack::pack(&words);
    }

    #[test]
    #[should_panic(expected = "task argument 1 requested")]
    fn arity_mismatch_aborts() {
        let p = ArgPack::pack(&[7]);
        let _ = p.word(1);
    }

    #[test]
    fn record_keeps_only_spillable_flags() {
        let rec = TaskRecord::from_fn(
            |_, _, _| {},
            5,
            0,
            EnqFlags::CANTSPEC | EnqFlags::SAMEHINT,
            &[],
        );
        assert_eq!(rec.flags, EnqFlags::CANTSPEC);
    }
}
