//! An `UnsafeCell` wrapper for state owned by the coordinator lock.
//!
//! Lock internals that are not single atomics (wait queues, rw-lock reader
//! bookkeeping) live in a [`CoordinatorCell`]. Access requires presenting a
//! [`CoordinatorGuard`], which ties the borrow to the guard: while the state
//! reference is alive the guard cannot be mutably borrowed, so a thread
//! cannot suspend (which needs `&mut CoordinatorGuard`) with a stale
//! reference in hand.

use core::cell::UnsafeCell;

use crate::sync::CoordinatorGuard;

/// State that may only be accessed while the coordinator is held.
#[repr(transparent)]
pub struct CoordinatorCell<T>(UnsafeCell<T>);

// SAFETY: All access goes through `get_mut`, whose contract requires the
// coordinator to be held, so at most one CPU touches the data at a time.
unsafe impl<T: Send> Send for CoordinatorCell<T> {}
// SAFETY: Same as above.
unsafe impl<T: Send> Sync for CoordinatorCell<T> {}

impl<T> CoordinatorCell<T> {
    /// Creates a new `CoordinatorCell` wrapping `value`.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Returns a mutable reference to the protected state.
    ///
    /// # Safety
    ///
    /// `guard` must hold the coordinator that every accessor of this cell
    /// uses, and the caller must not hold another reference obtained from
    /// this cell under the same guard.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<'g>(&'g self, guard: &'g CoordinatorGuard<'_>) -> &'g mut T {
        let _ = guard;
        // SAFETY: The caller guarantees exclusive access under the coordinator.
        unsafe { &mut *self.0.get() }
    }
}
