//! Blocking locks and the machinery they share.
//!
//! Provides [`Mutex`], [`RecursiveLock`] and [`RwLock`], their RAII guards,
//! the [`CoordinatorLock`] that serializes all wait-queue manipulation, and
//! the intrusive [`WaitQueue`] itself.

mod coordinator;
pub mod counter;
mod mutex;
mod recursive;
mod rwlock;
pub mod stress;
pub mod waitqueue;

pub(crate) mod loom_compat;

#[cfg(all(test, not(loom)))]
pub(crate) mod test_sched;

pub use coordinator::{CoordinatorGuard, CoordinatorLock};
pub use counter::{CompositeCount, CountValue, WRITER_UNIT};
pub use mutex::{Mutex, MutexFlags, MutexGuard};
pub use recursive::{RecursiveLock, RecursiveLockGuard};
pub use rwlock::{ReadGuard, RwLock, RwLockFlags, WriteGuard};
pub use waitqueue::{WaitQueue, Waiter, WaiterRole};

use alloc::boxed::Box;
use core::fmt;

/// A lock's diagnostic name.
///
/// Names are usually string literals; locks created for dynamically named
/// objects may own a copy instead.
pub enum LockName {
    /// A borrowed `'static` name.
    Static(&'static str),
    /// A heap-allocated copy owned by the lock.
    Owned(Box<str>),
}

impl LockName {
    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Static(name) => name,
            Self::Owned(name) => name,
        }
    }

    /// Returns `true` if the lock owns its name.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
