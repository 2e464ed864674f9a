//! Reentrant lock built on [`Mutex`].

use core::marker::PhantomData;

use super::loom_compat::{AtomicU32, AtomicU64, Ordering};
use super::Mutex;
use crate::debug::RecursiveLockInfo;
use crate::sched::Scheduler;
use crate::{LockError, ThreadId};

/// Name used when none is given.
pub const DEFAULT_NAME: &str = "recursive lock";

/// A mutex that its holder may lock again.
///
/// Nested acquisitions by the holder only bump a depth counter; the
/// underlying mutex is released when the depth drops back to zero.
pub struct RecursiveLock<S: 'static> {
    lock: Mutex<S>,
    holder: AtomicU64,
    recursion: AtomicU32,
}

impl<S: Scheduler> RecursiveLock<S> {
    /// Creates an unlocked recursive lock. `None` selects a default name.
    pub fn new(sched: &'static S, name: Option<&'static str>) -> Self {
        Self::from_mutex(Mutex::new(sched, name.unwrap_or(DEFAULT_NAME)))
    }

    /// Creates an unlocked recursive lock that keeps its own copy of `name`.
    pub fn with_owned_name(sched: &'static S, name: &str) -> Self {
        Self::from_mutex(Mutex::with_owned_name(sched, name))
    }

    fn from_mutex(lock: Mutex<S>) -> Self {
        Self {
            lock,
            holder: AtomicU64::new(ThreadId::NONE_RAW),
            recursion: AtomicU32::new(0),
        }
    }

    /// Returns the lock's name.
    pub fn name(&self) -> &str {
        self.lock.name()
    }

    /// Returns the holding thread, if any.
    pub fn holder(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.holder.load(Ordering::Relaxed))
    }

    /// Returns `true` once [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.lock.is_destroyed()
    }

    /// Returns the caller's nesting depth, or `None` if the caller does not
    /// hold the lock.
    pub fn recursion_count(&self) -> Option<u32> {
        if self.is_mine() {
            Some(self.recursion.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Acquires the lock, or deepens the caller's existing hold.
    ///
    /// # Panics
    ///
    /// Panics if called where blocking is forbidden.
    pub fn lock(&self) -> Result<(), LockError> {
        assert!(
            self.lock.scheduler().can_block(),
            "recursive_lock_lock(): called with blocking forbidden for lock {:p} (\"{}\")",
            self,
            self.name(),
        );
        if !self.is_mine() {
            self.lock.lock()?;
            self.set_holder(Some(self.current()));
        }
        self.recursion.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Acquires the lock if it is free or already held by the caller.
    pub fn try_lock(&self) -> Result<(), LockError> {
        if !self.is_mine() {
            self.lock.try_lock()?;
            self.set_holder(Some(self.current()));
        }
        self.recursion.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Acquires the lock and returns a guard that undoes one level on drop.
    pub fn lock_guard(&self) -> Result<RecursiveLockGuard<'_, S>, LockError> {
        self.lock()?;
        Ok(RecursiveLockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Undoes one level of nesting, releasing the lock at depth zero.
    ///
    /// # Panics
    ///
    /// Panics if the caller does not hold the lock.
    pub fn unlock(&self) {
        assert!(
            self.is_mine(),
            "recursive_lock {:p} (\"{}\") unlocked by non-holder thread {}",
            self,
            self.name(),
            self.current(),
        );
        if self.recursion.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.set_holder(None);
            self.lock.unlock();
        }
    }

    /// Tears the lock down, failing every queued waiter with
    /// [`LockError::Destroyed`].
    pub fn destroy(&self) {
        self.lock.destroy();
        self.set_holder(None);
        self.recursion.store(0, Ordering::Relaxed);
    }

    /// Takes a snapshot for the debugger.
    pub fn info(&self) -> RecursiveLockInfo<'_> {
        RecursiveLockInfo {
            holder: self.holder(),
            recursion: self.recursion.load(Ordering::Relaxed),
            mutex: self.lock.info(),
        }
    }

    fn is_mine(&self) -> bool {
        self.holder() == Some(self.current())
    }

    fn current(&self) -> ThreadId {
        self.lock.scheduler().current_thread()
    }

    fn set_holder(&self, thread: Option<ThreadId>) {
        self.holder
            .store(ThreadId::to_raw(thread), Ordering::Relaxed);
    }
}

/// RAII guard for one level of a [`RecursiveLock`].
pub struct RecursiveLockGuard<'a, S: Scheduler + 'static> {
    lock: &'a RecursiveLock<S>,
    _not_send: PhantomData<*const ()>,
}

impl<S: Scheduler> Drop for RecursiveLockGuard<'_, S> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
