//! Recoverable lock errors.
//!
//! Misuse of a lock (double locking, unlocking from a non-holder, blocking
//! where suspension is forbidden, touching a destroyed lock) is a kernel bug
//! and panics. Everything here is an ordinary outcome the caller must handle.

use core::fmt;

/// Error returned by lock operations that did not acquire the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockError {
    /// A non-blocking attempt found the lock held.
    WouldBlock,
    /// The timeout elapsed before ownership was granted.
    TimedOut,
    /// The scheduler interrupted the wait (e.g. a signal was delivered).
    Interrupted,
    /// The lock was destroyed while the caller was waiting on it.
    Destroyed,
}

impl LockError {
    /// Returns a short human-readable description.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WouldBlock => "operation would block",
            Self::TimedOut => "timed out",
            Self::Interrupted => "interrupted",
            Self::Destroyed => "lock destroyed",
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for LockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_as_str() {
        for err in [
            LockError::WouldBlock,
            LockError::TimedOut,
            LockError::Interrupted,
            LockError::Destroyed,
        ] {
            assert_eq!(format!("{err}"), err.as_str());
        }
    }
}
