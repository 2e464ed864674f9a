//! Non-reentrant blocking mutex.
//!
//! The lock state is a single signed counter:
//!
//! | `count` | meaning                                      |
//! |---------|----------------------------------------------|
//! | `0`     | free                                         |
//! | `-1`    | held, nobody waiting                         |
//! | `< -1`  | held, `-count - 1` threads waiting or racing |
//!
//! Uncontended lock and unlock are one atomic each. A locker that finds the
//! lock held queues itself under the coordinator and sleeps; an unlocker that
//! finds contenders takes the coordinator and hands ownership directly to the
//! head waiter, so a newly arriving thread can never overtake a queued one.
//!
//! Two bits of slow-path state cover the window between a fast-path atomic
//! and the coordinator acquisition that follows it:
//!
//! - [`MutexFlags::RELEASED`]: the unlocker got the coordinator first and
//!   found nobody to hand off to. The contender that is on its way takes the
//!   lock without sleeping.
//! - the ignore-unlock count: a contender timed out after the holder's
//!   fast-path release but before its slow path. The holder's slow path is
//!   swallowed instead of handing off to a thread that is gone.

use alloc::boxed::Box;
use core::marker::PhantomData;

use bitflags::bitflags;

use super::loom_compat::{AtomicI32, AtomicU8, AtomicU64, Ordering};
use super::waitqueue::{self, WaitQueue, WaiterRole, Wake};
use super::{stress, CoordinatorGuard, CoordinatorLock, LockName, RwLock};
use crate::cell::CoordinatorCell;
use crate::debug::{MutexInfo, WaiterList};
use crate::sched::{BlockKind, Scheduler, Timeout};
use crate::{LockError, ThreadId};

bitflags! {
    /// Mutex state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MutexFlags: u8 {
        /// The lock owns a heap copy of its name.
        const OWNS_NAME = 1 << 0;
        /// Released through the slow path with no waiter queued yet.
        const RELEASED = 1 << 1;
        /// [`Mutex::destroy`] has run.
        const DESTROYED = 1 << 2;
    }
}

/// A blocking, non-reentrant mutual-exclusion lock.
///
/// The mutex guards no data of its own; callers bracket their critical
/// sections with [`lock`](Self::lock)/[`unlock`](Self::unlock) or hold a
/// [`MutexGuard`].
pub struct Mutex<S: 'static> {
    sched: &'static S,
    name: LockName,
    count: AtomicI32,
    holder: AtomicU64,
    flags: AtomicU8,
    waiters: CoordinatorCell<WaitQueue>,
    ignore_unlock_count: CoordinatorCell<u32>,
}

impl<S: Scheduler> Mutex<S> {
    /// Creates an unlocked mutex bound to `sched`.
    pub fn new(sched: &'static S, name: &'static str) -> Self {
        Self::with_name(sched, LockName::Static(name))
    }

    /// Creates an unlocked mutex that keeps its own copy of `name`.
    pub fn with_owned_name(sched: &'static S, name: &str) -> Self {
        Self::with_name(sched, LockName::Owned(Box::from(name)))
    }

    fn with_name(sched: &'static S, name: LockName) -> Self {
        let flags = if name.is_owned() {
            MutexFlags::OWNS_NAME
        } else {
            MutexFlags::empty()
        };
        Self {
            sched,
            name,
            count: AtomicI32::new(0),
            holder: AtomicU64::new(ThreadId::NONE_RAW),
            flags: AtomicU8::new(flags.bits()),
            waiters: CoordinatorCell::new(WaitQueue::new()),
            ignore_unlock_count: CoordinatorCell::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Returns the lock's name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the current flags.
    pub fn flags(&self) -> MutexFlags {
        MutexFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Returns the thread holding the lock, if any.
    ///
    /// Only stable when called by the holder itself.
    pub fn holder(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.holder.load(Ordering::Relaxed))
    }

    /// Returns `true` if the lock is held or contended.
    pub fn is_locked(&self) -> bool {
        self.count.load(Ordering::Relaxed) < 0
    }

    /// Returns `true` if the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder() == Some(self.sched.current_thread())
    }

    /// Returns `true` once [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.flags().contains(MutexFlags::DESTROYED)
    }

    /// Takes a consistent snapshot for the debugger.
    pub fn info(&self) -> MutexInfo<'_> {
        let guard = self.sched.coordinator().lock();
        // SAFETY: The coordinator is held.
        let waiters = WaiterList::collect(unsafe { self.waiters.get_mut(&guard) });
        MutexInfo {
            addr: self.as_ptr().addr(),
            name: self.name(),
            flags: self.flags(),
            holder: self.holder(),
            count: self.count.load(Ordering::Relaxed),
            waiters,
        }
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Acquires the lock, sleeping while another thread holds it.
    ///
    /// Fails only with [`LockError::Destroyed`] (the lock was destroyed while
    /// we waited) or an interruption reported by the scheduler.
    ///
    /// # Panics
    ///
    /// Panics if the caller already holds the lock, if it has to sleep where
    /// blocking is forbidden, or if the lock has been destroyed.
    pub fn lock(&self) -> Result<(), LockError> {
        self.lock_with(None)
    }

    /// Like [`lock`](Self::lock), but gives up with [`LockError::TimedOut`]
    /// once `timeout` expires.
    pub fn lock_with_timeout(&self, timeout: Timeout) -> Result<(), LockError> {
        self.lock_with(Some(timeout))
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Result<(), LockError> {
        self.assert_alive("mutex_trylock");
        if self
            .count
            .compare_exchange(0, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(LockError::WouldBlock);
        }
        self.set_holder(Some(self.sched.current_thread()));
        Ok(())
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    pub fn lock_guard(&self) -> Result<MutexGuard<'_, S>, LockError> {
        self.lock()?;
        Ok(MutexGuard::new(self))
    }

    /// Non-blocking variant of [`lock_guard`](Self::lock_guard).
    pub fn try_lock_guard(&self) -> Result<MutexGuard<'_, S>, LockError> {
        self.try_lock()?;
        Ok(MutexGuard::new(self))
    }

    /// Releases the lock, handing it to the first waiter if there is one.
    ///
    /// # Panics
    ///
    /// Panics if the caller does not hold the lock.
    pub fn unlock(&self) {
        self.assert_alive("mutex_unlock");
        self.release_holder(self.sched.current_thread());

        if self.count.fetch_add(1, Ordering::Release) < -1 {
            stress::race_window();
            let guard = self.sched.coordinator().lock();
            self.unlock_slow(&guard);
        }
    }

    /// Releases `from` and acquires `self` as one step under the
    /// coordinator.
    ///
    /// A thread woken by the release of `from` cannot run before the caller
    /// is queued on (or holds) `self`.
    pub fn switch_from(&self, from: &Mutex<S>) -> Result<(), LockError> {
        self.assert_same_coordinator(from.sched.coordinator());
        from.assert_alive("mutex_switch_lock");
        self.assert_alive("mutex_switch_lock");
        let me = self.sched.current_thread();

        let mut guard = self.sched.coordinator().lock();
        from.release_holder(me);
        if from.count.fetch_add(1, Ordering::Release) < -1 {
            from.unlock_slow(&guard);
        }
        self.lock_locked(&mut guard, me)
    }

    /// Releases a read lock on `from` and acquires `self` in one step under
    /// the coordinator.
    pub fn switch_from_read(&self, from: &RwLock<S>) -> Result<(), LockError> {
        self.assert_same_coordinator(from.coordinator());
        self.assert_alive("mutex_switch_from_read_lock");
        let me = self.sched.current_thread();

        let mut guard = self.sched.coordinator().lock();
        from.read_unlock_locked(&guard);
        self.lock_locked(&mut guard, me)
    }

    /// Makes `thread` the holder of record without releasing the lock.
    ///
    /// Used when a lock taken by one thread is released by another (for
    /// example a lock handed to a newly created thread).
    ///
    /// # Panics
    ///
    /// Panics if the caller does not hold the lock.
    pub fn transfer_to(&self, thread: ThreadId) {
        self.assert_alive("mutex_transfer_lock");
        let me = self.sched.current_thread();
        let holder = self.holder();
        assert!(
            holder == Some(me),
            "mutex_transfer_lock(): lock {:p} (\"{}\") is held by {holder:?}, not by thread {me}",
            self,
            self.name,
        );
        self.set_holder(Some(thread));
    }

    /// Tears the lock down, failing every queued waiter with
    /// [`LockError::Destroyed`].
    ///
    /// # Panics
    ///
    /// Panics if threads are waiting and the caller is not the holder, or if
    /// the lock was already destroyed.
    pub fn destroy(&self) {
        let me = self.sched.current_thread();
        let guard = self.sched.coordinator().lock();
        self.assert_alive("mutex_destroy");

        // SAFETY: The coordinator is held.
        let waiters = unsafe { self.waiters.get_mut(&guard) };
        if !waiters.is_empty() {
            assert!(
                self.holder() == Some(me),
                "mutex_destroy(): there are blocking threads, but thread {me} doesn't hold \
                 the lock {:p} (\"{}\")",
                self,
                self.name,
            );
            log::warn!(
                "mutex {:p} (\"{}\") destroyed with {} waiters",
                self,
                self.name,
                waiters.len()
            );
        }

        waiters.drain(Err(LockError::Destroyed), |thread| {
            self.sched
                .unblock_locked(&guard, thread, Err(LockError::Destroyed));
        });
        self.set_holder(None);
        self.count.store(0, Ordering::Relaxed);
        self.flags
            .fetch_or(MutexFlags::DESTROYED.bits(), Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Slow paths
    // -----------------------------------------------------------------------

    fn lock_with(&self, timeout: Option<Timeout>) -> Result<(), LockError> {
        self.assert_alive("mutex_lock");
        let me = self.sched.current_thread();

        if self.count.fetch_sub(1, Ordering::Acquire) < 0 {
            stress::race_window();
            let mut guard = self.sched.coordinator().lock();
            return self.lock_slow(&mut guard, me, timeout);
        }
        self.set_holder(Some(me));
        Ok(())
    }

    /// Lock with the coordinator already held.
    fn lock_locked(&self, guard: &mut CoordinatorGuard<'_>, me: ThreadId) -> Result<(), LockError> {
        if self.count.fetch_sub(1, Ordering::Acquire) < 0 {
            return self.lock_slow(guard, me, None);
        }
        self.set_holder(Some(me));
        Ok(())
    }

    fn lock_slow(
        &self,
        guard: &mut CoordinatorGuard<'_>,
        me: ThreadId,
        timeout: Option<Timeout>,
    ) -> Result<(), LockError> {
        assert!(
            self.sched.can_block(),
            "mutex_lock(): called with blocking forbidden for lock {:p} (\"{}\")",
            self,
            self.name,
        );
        self.assert_alive("mutex_lock");

        if self.flags().contains(MutexFlags::RELEASED) {
            self.flags
                .fetch_and(!MutexFlags::RELEASED.bits(), Ordering::Relaxed);
            self.set_holder(Some(me));
            return Ok(());
        }

        let holder = self.holder();
        assert!(
            holder != Some(me),
            "mutex_lock(): double lock of {:p} (\"{}\") by thread {me}",
            self,
            self.name,
        );

        log::trace!(
            "mutex {:p} (\"{}\"): thread {me} waits, holder {holder:?}",
            self,
            self.name
        );
        let wake = waitqueue::wait(
            self.sched,
            guard,
            &self.waiters,
            WaiterRole::Writer,
            BlockKind::Mutex,
            self.as_ptr(),
            timeout,
        );

        match wake {
            Wake::Dequeued(result) => result,
            Wake::Abandoned(err) => {
                // We no longer contend. If that brings the count back to
                // free, the holder has already released on the fast path and
                // is on its way to hand off to us: swallow that unlock.
                if self.count.fetch_add(1, Ordering::Relaxed) == -1 {
                    // SAFETY: The coordinator is held.
                    *unsafe { self.ignore_unlock_count.get_mut(guard) } += 1;
                }
                log::debug!(
                    "mutex {:p} (\"{}\"): thread {me} gave up waiting: {err}",
                    self,
                    self.name
                );
                Err(err)
            }
        }
    }

    fn unlock_slow(&self, guard: &CoordinatorGuard<'_>) {
        // SAFETY: The coordinator is held.
        let ignore = unsafe { self.ignore_unlock_count.get_mut(guard) };
        if *ignore > 0 {
            *ignore -= 1;
            return;
        }

        // SAFETY: The coordinator is held.
        let waiters = unsafe { self.waiters.get_mut(guard) };
        if let Some(next) = waiters.pop_front(Ok(())) {
            self.set_holder(Some(next));
            log::trace!(
                "mutex {:p} (\"{}\"): handed off to thread {next}",
                self,
                self.name
            );
            self.sched.unblock_locked(guard, next, Ok(()));
        } else {
            // The contender that made us take the slow path has not queued
            // yet.
            self.flags
                .fetch_or(MutexFlags::RELEASED.bits(), Ordering::Relaxed);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn release_holder(&self, me: ThreadId) {
        let holder = self.holder();
        assert!(
            holder == Some(me),
            "mutex_unlock(): lock {:p} (\"{}\") released by thread {me}, but held by {holder:?}",
            self,
            self.name,
        );
        self.set_holder(None);
    }

    fn set_holder(&self, thread: Option<ThreadId>) {
        self.holder
            .store(ThreadId::to_raw(thread), Ordering::Relaxed);
    }

    fn assert_alive(&self, op: &str) {
        assert!(
            !self.is_destroyed(),
            "{op}(): lock {:p} (\"{}\") used after destroy",
            self,
            self.name,
        );
    }

    fn assert_same_coordinator(&self, other: &CoordinatorLock) {
        assert!(
            core::ptr::eq(self.sched.coordinator(), other),
            "lock switch between locks of different schedulers"
        );
    }

    pub(super) fn scheduler(&self) -> &'static S {
        self.sched
    }

    fn as_ptr(&self) -> *const () {
        core::ptr::from_ref(self).cast()
    }
}

/// RAII guard for a held [`Mutex`].
pub struct MutexGuard<'a, S: Scheduler + 'static> {
    mutex: &'a Mutex<S>,
    // The holder is a thread; the guard must be released by it.
    _not_send: PhantomData<*const ()>,
}

impl<'a, S: Scheduler> MutexGuard<'a, S> {
    fn new(mutex: &'a Mutex<S>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// Returns the locked mutex.
    pub fn mutex(&self) -> &'a Mutex<S> {
        self.mutex
    }
}

impl<S: Scheduler> Drop for MutexGuard<'_, S> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Mutex as StdMutex, mpsc};
    use std::time::Duration;

    use super::*;
    use crate::sync::test_sched::{self, HostScheduler};

    fn mutex(name: &'static str) -> (&'static HostScheduler, Mutex<HostScheduler>) {
        let sched = HostScheduler::leak();
        (sched, Mutex::new(sched, name))
    }

    #[test]
    fn uncontended_lock_unlock() {
        let (_, m) = mutex("m");
        assert!(!m.is_locked());
        m.lock().unwrap();
        assert!(m.is_locked());
        assert!(m.is_held_by_current_thread());
        assert_eq!(m.holder(), Some(test_sched::current_id()));
        m.unlock();
        assert!(!m.is_locked());
        assert_eq!(m.holder(), None);
        assert!(m.flags().is_empty());
    }

    #[test]
    fn try_lock_would_block_when_held() {
        let (_, m) = mutex("m");
        m.try_lock().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| assert_eq!(m.try_lock(), Err(LockError::WouldBlock)));
        });
        m.unlock();
        std::thread::scope(|s| {
            s.spawn(|| {
                m.try_lock().unwrap();
                m.unlock();
            });
        });
    }

    #[test]
    fn blocked_locker_receives_ownership() {
        let (sched, m) = mutex("m");
        m.lock().unwrap();
        let b_done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let b = s.spawn(|| {
                m.lock().unwrap();
                assert!(m.is_held_by_current_thread());
                b_done.store(true, Ordering::SeqCst);
                // Unlocking succeeds only if B really is the holder.
                m.unlock();
            });
            sched.wait_for_blocked(&m, 1);
            assert!(!b_done.load(Ordering::SeqCst));
            m.unlock();
            b.join().unwrap();
        });
        assert!(b_done.load(Ordering::SeqCst));
        assert!(!m.is_locked());
    }

    #[test]
    fn hand_off_is_fifo() {
        let (sched, m) = mutex("m");
        let order = StdMutex::new(Vec::new());
        m.lock().unwrap();

        std::thread::scope(|s| {
            for i in 1..=3 {
                let (m, order) = (&m, &order);
                s.spawn(move || {
                    m.lock().unwrap();
                    order.lock().unwrap().push(i);
                    m.unlock();
                });
                // Queue the threads in a known order.
                sched.wait_for_blocked(m, i);
            }
            m.unlock();
        });
        assert_eq!(*order.lock().unwrap(), [1, 2, 3]);
    }

    #[test]
    fn waiting_thread_reports_block_kind() {
        let (sched, m) = mutex("m");
        m.lock().unwrap();
        let id = StdMutex::new(None);
        std::thread::scope(|s| {
            s.spawn(|| {
                *id.lock().unwrap() = Some(test_sched::current_id());
                m.lock().unwrap();
                m.unlock();
            });
            sched.wait_for_blocked(&m, 1);
            let waiter = id.lock().unwrap().unwrap();
            assert_eq!(sched.block_kind(waiter), Some(BlockKind::Mutex));
            m.unlock();
        });
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let (_, m) = mutex("counter");
        let inside = AtomicUsize::new(0);
        let total = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let _g = m.lock_guard().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(total.load(Ordering::Relaxed), 800);
        assert!(!m.is_locked());
        assert!(m.flags().is_empty());
    }

    #[test]
    fn timeout_restores_free_state() {
        let (_, m) = mutex("m");
        m.lock().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                let r = m.lock_with_timeout(Timeout::Relative(Duration::from_millis(20)));
                assert_eq!(r, Err(LockError::TimedOut));
            });
        });
        assert_eq!(m.info().count, -1, "only the holder remains");
        m.unlock();
        assert!(!m.is_locked());
        // The next uncontended caller takes the fast path.
        m.try_lock().unwrap();
        m.unlock();
    }

    /// Times out the waiter at `victim` out of three queued lockers.
    fn timeout_at_position(victim: usize) {
        let (sched, m) = mutex("m");
        let order = StdMutex::new(Vec::new());
        m.lock().unwrap();

        std::thread::scope(|s| {
            for i in 0..3 {
                let (m, order) = (&m, &order);
                s.spawn(move || {
                    if i == victim {
                        let r = m.lock_with_timeout(Timeout::Relative(Duration::from_millis(500)));
                        assert_eq!(r, Err(LockError::TimedOut));
                    } else {
                        m.lock().unwrap();
                        order.lock().unwrap().push(i);
                        m.unlock();
                    }
                });
                sched.wait_for_blocked(m, i + 1);
            }
            // Let the victim expire while the others stay queued.
            let start = std::time::Instant::now();
            while sched.blocked_on(&m) > 2 {
                assert!(start.elapsed() < Duration::from_secs(10));
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(m.info().waiters.len(), 2);
            m.unlock();
        });

        let expected: Vec<usize> = (0..3).filter(|&i| i != victim).collect();
        assert_eq!(*order.lock().unwrap(), expected);
        assert!(!m.is_locked());
        m.try_lock().unwrap();
        m.unlock();
    }

    #[test]
    fn timeout_at_head() {
        timeout_at_position(0);
    }

    #[test]
    fn timeout_in_middle() {
        timeout_at_position(1);
    }

    #[test]
    fn timeout_at_tail() {
        timeout_at_position(2);
    }

    #[test]
    fn interrupted_waiter_leaves_queue() {
        let (sched, m) = mutex("m");
        m.lock().unwrap();
        let id = StdMutex::new(None);
        std::thread::scope(|s| {
            s.spawn(|| {
                *id.lock().unwrap() = Some(test_sched::current_id());
                assert_eq!(m.lock(), Err(LockError::Interrupted));
            });
            sched.wait_for_blocked(&m, 1);
            sched.interrupt(id.lock().unwrap().unwrap());
        });
        assert!(m.info().waiters.is_empty());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn absolute_timeout_in_the_past_fails_immediately() {
        let (_, m) = mutex("m");
        m.lock().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                let r = m.lock_with_timeout(Timeout::Absolute(Duration::ZERO));
                assert_eq!(r, Err(LockError::TimedOut));
            });
        });
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn released_flag_covers_unqueued_contender() {
        // Model a contender that has decremented the count but not yet
        // reached the coordinator when the holder releases.
        let (_, m) = mutex("m");
        m.lock().unwrap();
        m.count.fetch_sub(1, Ordering::Relaxed);
        m.unlock();
        assert!(m.flags().contains(MutexFlags::RELEASED));

        let mut guard = m.sched.coordinator().lock();
        let me = test_sched::current_id();
        m.lock_slow(&mut guard, me, None).unwrap();
        drop(guard);
        assert!(!m.flags().contains(MutexFlags::RELEASED));
        assert_eq!(m.holder(), Some(me));
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn ignore_unlock_swallows_orphaned_hand_off() {
        let (_, m) = mutex("m");
        m.lock().unwrap();
        // A contender announced itself, then timed out after the holder's
        // fast-path release: its fix-up finds the count at -1.
        m.count.fetch_sub(1, Ordering::Relaxed);
        m.set_holder(None);
        assert!(m.count.fetch_add(1, Ordering::Release) < -1);
        {
            let guard = m.sched.coordinator().lock();
            assert_eq!(m.count.fetch_add(1, Ordering::Relaxed), -1);
            // SAFETY: The coordinator is held.
            *unsafe { m.ignore_unlock_count.get_mut(&guard) } += 1;
            m.unlock_slow(&guard);
            // SAFETY: The coordinator is held.
            assert_eq!(*unsafe { m.ignore_unlock_count.get_mut(&guard) }, 0);
        }
        assert!(!m.flags().contains(MutexFlags::RELEASED));
        assert!(!m.is_locked());
        m.try_lock().unwrap();
        m.unlock();
    }

    #[test]
    fn destroy_fails_all_waiters() {
        let (sched, m) = mutex("m");
        m.lock().unwrap();
        let failed = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 1..=3 {
                let (m, failed) = (&m, &failed);
                s.spawn(move || {
                    assert_eq!(m.lock(), Err(LockError::Destroyed));
                    failed.fetch_add(1, Ordering::SeqCst);
                });
                sched.wait_for_blocked(m, i);
            }
            m.destroy();
        });
        assert_eq!(failed.load(Ordering::SeqCst), 3);
        assert!(m.is_destroyed());
        assert_eq!(m.holder(), None);
    }

    #[test]
    fn destroy_free_lock() {
        let (_, m) = mutex("m");
        m.destroy();
        assert!(m.is_destroyed());
    }

    #[test]
    #[should_panic(expected = "used after destroy")]
    fn lock_after_destroy_panics() {
        let (_, m) = mutex("m");
        m.destroy();
        let _ = m.lock();
    }

    #[test]
    #[should_panic(expected = "doesn't hold")]
    fn destroy_with_waiters_by_non_holder_panics() {
        struct Release<'a>(&'a AtomicBool);
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let (sched, m) = mutex("m");
        let locked = AtomicBool::new(false);
        let release = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                m.lock().unwrap();
                locked.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
                m.unlock();
            });
            while !locked.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            s.spawn(|| {
                m.lock().unwrap();
                m.unlock();
            });
            sched.wait_for_blocked(&m, 1);

            // Let the holder finish once we unwind.
            let _release = Release(&release);
            m.destroy();
        });
    }

    #[test]
    #[should_panic(expected = "double lock")]
    fn double_lock_panics() {
        let (_, m) = mutex("m");
        m.lock().unwrap();
        let _ = m.lock();
    }

    #[test]
    #[should_panic(expected = "released by thread")]
    fn unlock_by_non_holder_panics() {
        let (_, m) = mutex("m");
        m.unlock();
    }

    #[test]
    #[should_panic(expected = "blocking forbidden")]
    fn blocking_where_forbidden_panics() {
        let (_, m) = mutex("m");
        std::thread::scope(|s| {
            s.spawn(|| m.lock().unwrap()).join().unwrap();
        });
        test_sched::forbid_blocking(true);
        let _ = m.lock();
    }

    #[test]
    fn guard_releases_on_drop() {
        let (_, m) = mutex("m");
        {
            let g = m.lock_guard().unwrap();
            assert!(core::ptr::eq(g.mutex(), &m));
            assert!(m.try_lock_guard().is_err());
        }
        assert!(!m.is_locked());
    }

    #[test]
    fn switch_from_moves_between_mutexes() {
        let sched = HostScheduler::leak();
        let a = Mutex::new(sched, "a");
        let b = Mutex::new(sched, "b");
        a.lock().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                a.lock().unwrap();
                assert!(b.is_locked(), "b was taken before a was released");
                a.unlock();
            });
            sched.wait_for_blocked(&a, 1);
            b.switch_from(&a).unwrap();
        });
        assert!(b.is_held_by_current_thread());
        assert!(!a.is_locked());
        b.unlock();
    }

    #[test]
    fn switch_from_read_releases_reader() {
        let sched = HostScheduler::leak();
        let rw = RwLock::new(sched, "rw");
        let m = Mutex::new(sched, "m");
        rw.read_lock().unwrap();
        m.switch_from_read(&rw).unwrap();
        assert!(m.is_held_by_current_thread());
        // The read lock is gone: a writer gets straight in.
        rw.write_lock().unwrap();
        rw.write_unlock();
        m.unlock();
    }

    #[test]
    fn transfer_moves_holder() {
        let (_, m) = mutex("m");
        let m = &m;
        let (id_tx, id_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        m.lock().unwrap();

        std::thread::scope(|s| {
            s.spawn(move || {
                id_tx.send(test_sched::current_id()).unwrap();
                go_rx.recv().unwrap();
                m.unlock();
            });
            let other = id_rx.recv().unwrap();
            m.transfer_to(other);
            assert_eq!(m.holder(), Some(other));
            assert!(!m.is_held_by_current_thread());
            go_tx.send(()).unwrap();
        });
        assert!(!m.is_locked());
    }

    #[test]
    #[should_panic(expected = "mutex_transfer_lock")]
    fn transfer_by_non_holder_panics() {
        let (_, m) = mutex("m");
        m.transfer_to(ThreadId::new(u64::MAX));
    }

    #[test]
    fn owned_name_sets_flag() {
        let sched = HostScheduler::leak();
        let name = format!("inode {}", 42);
        let m = Mutex::with_owned_name(sched, &name);
        drop(name);
        assert_eq!(m.name(), "inode 42");
        assert!(m.flags().contains(MutexFlags::OWNS_NAME));
        assert!(core::ptr::eq(m.scheduler(), sched));
    }
}
