//! The coordinator spin lock.
//!
//! Every blocking lock bound to a scheduler serializes its queue
//! manipulation through that scheduler's single [`CoordinatorLock`]. It
//! disables interrupts before spinning and restores the previous interrupt
//! state on release, so it may be taken from interrupt handlers that wake
//! threads.
//!
//! Holding a [`CoordinatorGuard`] is what makes "check state, maybe enqueue,
//! maybe suspend" atomic with respect to concurrent unlockers. Functions that
//! are called with the coordinator already held take the guard by reference
//! instead of acquiring it again.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

/// An interrupt-safe spin lock protecting lock wait queues.
pub struct CoordinatorLock {
    locked: AtomicBool,
}

impl CoordinatorLock {
    /// Creates a new unlocked coordinator.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the coordinator, disabling interrupts first.
    pub fn lock(&self) -> CoordinatorGuard<'_> {
        let saved_flags = save_flags_and_cli();
        self.spin_acquire();
        CoordinatorGuard {
            lock: self,
            saved_flags,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the coordinator without spinning.
    pub fn try_lock(&self) -> Option<CoordinatorGuard<'_>> {
        let saved_flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(CoordinatorGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            })
        } else {
            restore_flags(saved_flags);
            None
        }
    }

    /// Returns `true` if some CPU currently holds the coordinator.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn spin_acquire(&self) {
        // TTAS: spin on a shared read until the lock looks free.
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for CoordinatorLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the coordinator is held. Releases it and restores the
/// interrupt state on drop.
pub struct CoordinatorGuard<'a> {
    lock: &'a CoordinatorLock,
    saved_flags: u64,
    // Interrupt state is per-CPU, so the guard must stay on this CPU.
    _not_send: PhantomData<*mut ()>,
}

impl CoordinatorGuard<'_> {
    /// Returns `true` if this guard holds `lock`.
    pub fn holds(&self, lock: &CoordinatorLock) -> bool {
        core::ptr::eq(self.lock, lock)
    }

    /// Temporarily releases the coordinator while `f` runs.
    ///
    /// Used by schedulers to suspend the current thread: the coordinator is
    /// dropped (and interrupts restored) for the duration of the sleep and is
    /// held again when this returns.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.lock.release();
        restore_flags(self.saved_flags);

        let result = f();

        self.saved_flags = save_flags_and_cli();
        self.lock.spin_acquire();
        result
    }
}

impl Drop for CoordinatorGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
        restore_flags(self.saved_flags);
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: Reading RFLAGS and disabling interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn restore_flags(flags: u64) {
    // Only the IF bit matters.
    if flags & (1 << 9) != 0 {
        // SAFETY: Re-enabling interrupts restores a previous state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: Reading DAIF and masking interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "mrs {}, DAIF",
            "msr DAIFSet, #0xf",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn restore_flags(flags: u64) {
    // SAFETY: Restoring DAIF restores a previous state.
    unsafe {
        core::arch::asm!(
            "msr DAIF, {}",
            in(reg) flags,
            options(nomem, nostack, preserves_flags),
        );
    }
}

#[cfg(not(target_os = "none"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    0
}

#[cfg(not(target_os = "none"))]
#[inline]
fn restore_flags(_flags: u64) {}
