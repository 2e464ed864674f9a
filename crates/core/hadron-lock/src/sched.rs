//! The scheduler interface consumed by the blocking locks.
//!
//! The locks never switch contexts themselves. A thread that has to wait
//! links a waiter record into the lock's queue, announces itself with
//! [`Scheduler::prepare_to_block`] and suspends through
//! [`Scheduler::block_locked`]; the releasing thread resumes it with
//! [`Scheduler::unblock_locked`]. All of these run with the scheduler's
//! coordinator held.

use core::time::Duration;

use crate::sync::{CoordinatorGuard, CoordinatorLock};
use crate::{LockError, ThreadId};

/// What a thread is about to block on. Reported to the scheduler for
/// introspection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Waiting for a [`Mutex`](crate::sync::Mutex) (or a recursive lock).
    Mutex,
    /// Waiting for an [`RwLock`](crate::sync::RwLock).
    RwLock,
}

/// Upper bound on how long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Give up after this much time has passed from the call.
    Relative(Duration),
    /// Give up once the system clock (time since boot) reaches this value.
    Absolute(Duration),
}

/// Thread scheduling services needed by the blocking locks.
///
/// Implementations own the coordinator lock; every lock bound to the same
/// scheduler serializes its queue manipulation through it.
pub trait Scheduler: Sync {
    /// Returns the identifier of the calling thread.
    fn current_thread(&self) -> ThreadId;

    /// Returns `false` if the calling context may not suspend (interrupts
    /// disabled, running in an interrupt handler).
    fn can_block(&self) -> bool;

    /// Returns the coordinator lock shared by all locks of this scheduler.
    fn coordinator(&self) -> &CoordinatorLock;

    /// Marks `thread` (the caller) as about to block on `lock`.
    ///
    /// Called with the coordinator held, after the caller's waiter record has
    /// been queued and before [`block_locked`](Self::block_locked).
    fn prepare_to_block(
        &self,
        guard: &CoordinatorGuard<'_>,
        thread: ThreadId,
        kind: BlockKind,
        lock: *const (),
    );

    /// Suspends the calling thread until it is unblocked.
    ///
    /// The coordinator is released while the thread sleeps and held again
    /// when this returns. Returns the status passed to
    /// [`unblock_locked`](Self::unblock_locked), or an error if the wait was
    /// interrupted.
    fn block_locked(&self, guard: &mut CoordinatorGuard<'_>) -> Result<(), LockError>;

    /// Like [`block_locked`](Self::block_locked), but gives up with
    /// [`LockError::TimedOut`] when `timeout` expires first.
    fn block_with_timeout_locked(
        &self,
        guard: &mut CoordinatorGuard<'_>,
        timeout: Timeout,
    ) -> Result<(), LockError>;

    /// Resumes a thread blocked in one of the block calls, making it return
    /// `status`. Must not suspend.
    fn unblock_locked(
        &self,
        guard: &CoordinatorGuard<'_>,
        thread: ThreadId,
        status: Result<(), LockError>,
    );
}

/// Blocks the calling thread with or without a timeout.
pub(crate) fn block<S: Scheduler + ?Sized>(
    sched: &S,
    guard: &mut CoordinatorGuard<'_>,
    timeout: Option<Timeout>,
) -> Result<(), LockError> {
    match timeout {
        None => sched.block_locked(guard),
        Some(timeout) => sched.block_with_timeout_locked(guard, timeout),
    }
}
