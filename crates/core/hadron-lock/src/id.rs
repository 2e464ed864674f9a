//! Thread identifiers as seen by the lock layer.

use core::fmt;

/// Kernel thread identifier.
///
/// The scheduler hands these out; the locks only compare and store them.
/// The raw value `0` is reserved to mean "no thread" in atomic holder slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Raw value stored in atomic holder slots when nobody holds the lock.
    pub(crate) const NONE_RAW: u64 = 0;

    /// Creates a new `ThreadId`.
    ///
    /// # Panics
    ///
    /// Panics if `val` is 0, which is reserved for "no thread".
    pub const fn new(val: u64) -> Self {
        assert!(val != Self::NONE_RAW, "thread id 0 is reserved");
        Self(val)
    }

    /// Returns the raw `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Decodes an atomic holder slot.
    pub(crate) const fn from_raw(raw: u64) -> Option<Self> {
        if raw == Self::NONE_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Encodes an optional thread for an atomic holder slot.
    pub(crate) const fn to_raw(thread: Option<Self>) -> u64 {
        match thread {
            Some(t) => t.0,
            None => Self::NONE_RAW,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
