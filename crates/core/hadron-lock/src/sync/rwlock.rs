//! Blocking reader-writer lock.
//!
//! Readers and writers announce themselves on one [`CompositeCount`]: a
//! reader adds 1, a writer adds [`WRITER_UNIT`](super::WRITER_UNIT). A
//! reader whose announcement found no writer is in, without touching the
//! coordinator. Everything else is decided under the coordinator with two
//! extra counters:
//!
//! - `active_readers`: readers inside the critical section that the writer
//!   at the head of the queue has to wait for.
//! - `pending_readers`: readers a departing writer saw in the counter but
//!   not in the queue. They announced themselves in the window between the
//!   writer's release and its queue scan, and are let in when they reach the
//!   slow path even if another writer has arrived since.
//!
//! A read unlock only retracts its unit without the coordinator while no
//! writer is present. Otherwise it retracts under the coordinator, where a
//! writer that gives up cannot slip in between the retraction and the
//! `active_readers` update.
//!
//! The queue is FIFO. A release admits either the writer at its head or
//! every reader up to the first queued writer.

use alloc::boxed::Box;
use core::marker::PhantomData;

use bitflags::bitflags;

use super::counter::{CompositeCount, CountValue, WRITER_UNIT};
use super::loom_compat::{AtomicU8, AtomicU64, Ordering};
use super::waitqueue::{self, WaitQueue, WaiterRole, Wake};
use super::{stress, CoordinatorGuard, CoordinatorLock, LockName};
use crate::cell::CoordinatorCell;
use crate::debug::{RwLockInfo, WaiterList};
use crate::sched::{BlockKind, Scheduler, Timeout};
use crate::{LockError, ThreadId};

bitflags! {
    /// Reader-writer lock flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RwLockFlags: u8 {
        /// The lock owns a heap copy of its name.
        const OWNS_NAME = 1 << 0;
        /// [`RwLock::destroy`] has run.
        const DESTROYED = 1 << 1;
    }
}

/// Bookkeeping touched only under the coordinator.
#[derive(Debug, Default)]
struct RwState {
    /// Write-lock nesting depth of the holder.
    write_depth: u32,
    /// Read locks the write holder took on top of its write lock.
    self_reads: u32,
    active_readers: i64,
    pending_readers: i64,
}

/// Who a call to `unblock` let in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admitted {
    Nobody,
    Writer,
    Readers(i64),
}

impl Admitted {
    fn readers(self) -> i64 {
        match self {
            Self::Readers(n) => n,
            Self::Nobody | Self::Writer => 0,
        }
    }
}

/// A blocking reader-writer lock.
///
/// The write holder may take the write lock again and may take read locks;
/// neither blocks.
pub struct RwLock<S: 'static> {
    sched: &'static S,
    name: LockName,
    count: CompositeCount,
    holder: AtomicU64,
    flags: AtomicU8,
    waiters: CoordinatorCell<WaitQueue>,
    state: CoordinatorCell<RwState>,
}

impl<S: Scheduler> RwLock<S> {
    /// Creates an unlocked reader-writer lock bound to `sched`.
    pub fn new(sched: &'static S, name: &'static str) -> Self {
        Self::with_name(sched, LockName::Static(name))
    }

    /// Creates an unlocked lock that keeps its own copy of `name`.
    pub fn with_owned_name(sched: &'static S, name: &str) -> Self {
        Self::with_name(sched, LockName::Owned(Box::from(name)))
    }

    fn with_name(sched: &'static S, name: LockName) -> Self {
        let flags = if name.is_owned() {
            RwLockFlags::OWNS_NAME
        } else {
            RwLockFlags::empty()
        };
        Self {
            sched,
            name,
            count: CompositeCount::new(),
            holder: AtomicU64::new(ThreadId::NONE_RAW),
            flags: AtomicU8::new(flags.bits()),
            waiters: CoordinatorCell::new(WaitQueue::new()),
            state: CoordinatorCell::new(RwState::default()),
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
    pub fn flags(&self) -> RwLockFlags {
        RwLockFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Returns the thread holding the write lock, if any.
    pub fn writer(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.holder.load(Ordering::Relaxed))
    }

    /// Returns `true` if the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.writer() == Some(self.sched.current_thread())
    }

    /// Returns `true` once [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.flags().contains(RwLockFlags::DESTROYED)
    }

    /// Takes a consistent snapshot for the debugger.
    pub fn info(&self) -> RwLockInfo<'_> {
        let guard = self.sched.coordinator().lock();
        // SAFETY: The coordinator is held.
        let state = unsafe { self.state.get_mut(&guard) };
        // SAFETY: The coordinator is held.
        let waiters = WaiterList::collect(unsafe { self.waiters.get_mut(&guard) });
        RwLockInfo {
            addr: self.as_ptr().addr(),
            name: self.name(),
            flags: self.flags(),
            holder: self.writer(),
            count: self.count.load().raw(),
            active_readers: state.active_readers,
            pending_readers: state.pending_readers,
            write_depth: state.write_depth,
            self_reads: state.self_reads,
            waiters,
        }
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    /// Acquires a read lock, sleeping while a writer holds or waits for the
    /// lock.
    pub fn read_lock(&self) -> Result<(), LockError> {
        self.read_lock_with(None)
    }

    /// Like [`read_lock`](Self::read_lock), but gives up with
    /// [`LockError::TimedOut`] once `timeout` expires.
    pub fn read_lock_with_timeout(&self, timeout: Timeout) -> Result<(), LockError> {
        self.read_lock_with(Some(timeout))
    }

    /// Acquires a read lock and returns a guard that releases it on drop.
    pub fn read_guard(&self) -> Result<ReadGuard<'_, S>, LockError> {
        self.read_lock()?;
        Ok(ReadGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Releases a read lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not read-locked.
    pub fn read_unlock(&self) {
        self.assert_alive("rw_lock_read_unlock");
        match self.count.sub_reader_unless_writer() {
            Ok(old) => self.assert_was_read_locked(old),
            Err(_) => {
                stress::race_window();
                let guard = self.sched.coordinator().lock();
                self.release_reader_locked(&guard);
            }
        }
    }

    /// Releases a read lock with the coordinator already held.
    pub(super) fn read_unlock_locked(&self, guard: &CoordinatorGuard<'_>) {
        debug_assert!(
            guard.holds(self.sched.coordinator()),
            "rw_lock_read_unlock(): guard is for another coordinator"
        );
        self.assert_alive("rw_lock_read_unlock");
        self.release_reader_locked(guard);
    }

    /// Retracts the caller's reader unit and settles the bookkeeping.
    ///
    /// Writer units are only added and retracted under the coordinator, so
    /// the writer state seen by the retraction cannot change before the
    /// bookkeeping below runs.
    fn release_reader_locked(&self, guard: &CoordinatorGuard<'_>) {
        let old = self.count.sub_reader();
        if old.has_writer() {
            self.read_unlock_slow(guard);
        } else {
            self.assert_was_read_locked(old);
        }
    }

    fn read_lock_with(&self, timeout: Option<Timeout>) -> Result<(), LockError> {
        self.assert_alive("rw_lock_read_lock");
        if !self.count.add_reader().has_writer() {
            return Ok(());
        }
        stress::race_window();
        let mut guard = self.sched.coordinator().lock();
        self.read_lock_slow(&mut guard, timeout)
    }

    fn read_lock_slow(
        &self,
        guard: &mut CoordinatorGuard<'_>,
        timeout: Option<Timeout>,
    ) -> Result<(), LockError> {
        self.assert_alive("rw_lock_read_lock");
        let me = self.sched.current_thread();

        // SAFETY: The coordinator is held.
        let state = unsafe { self.state.get_mut(guard) };
        if self.writer() == Some(me) {
            state.self_reads += 1;
            return Ok(());
        }

        // The writer that made us take the slow path may already be gone and
        // another one may have overtaken us; the departing writer counted us
        // as pending, so we do not wait.
        if state.pending_readers > 0 {
            state.pending_readers -= 1;
            if self.count.load().has_writer() {
                state.active_readers += 1;
            }
            return Ok(());
        }
        debug_assert!(self.count.load().has_writer());

        assert!(
            self.sched.can_block(),
            "rw_lock_read_lock(): called with blocking forbidden for lock {:p} (\"{}\")",
            self,
            self.name,
        );
        log::trace!(
            "rw lock {:p} (\"{}\"): reader {me} waits",
            self,
            self.name
        );
        let wake = waitqueue::wait(
            self.sched,
            guard,
            &self.waiters,
            WaiterRole::Reader,
            BlockKind::RwLock,
            self.as_ptr(),
            timeout,
        );

        match wake {
            Wake::Dequeued(result) => result,
            Wake::Abandoned(err) => {
                self.count.sub_reader();
                log::debug!(
                    "rw lock {:p} (\"{}\"): reader {me} gave up waiting: {err}",
                    self,
                    self.name
                );
                Err(err)
            }
        }
    }

    fn read_unlock_slow(&self, guard: &CoordinatorGuard<'_>) {
        let me = self.sched.current_thread();
        // SAFETY: The coordinator is held.
        let state = unsafe { self.state.get_mut(guard) };

        if self.writer() == Some(me) {
            assert!(
                state.self_reads > 0,
                "rw_lock_read_unlock(): write holder {me} of lock {:p} (\"{}\") holds no read lock",
                self,
                self.name,
            );
            state.self_reads -= 1;
            return;
        }

        state.active_readers -= 1;
        if state.active_readers > 0 {
            return;
        }
        if state.active_readers < 0 {
            state.active_readers = 0;
            panic!(
                "rw_lock_read_unlock(): lock {:p} (\"{}\") not read-locked",
                self, self.name
            );
        }
        self.unblock(guard, state);
    }

    fn assert_was_read_locked(&self, old: CountValue) {
        assert!(
            old.reader_units() > 0,
            "rw_lock_read_unlock(): lock {:p} (\"{}\") not read-locked",
            self,
            self.name,
        );
    }

    // -----------------------------------------------------------------------
    // Writers
    // -----------------------------------------------------------------------

    /// Acquires the write lock, sleeping until all readers and earlier
    /// writers are gone. The holder may call this again.
    pub fn write_lock(&self) -> Result<(), LockError> {
        self.write_lock_with(None)
    }

    /// Like [`write_lock`](Self::write_lock), but gives up with
    /// [`LockError::TimedOut`] once `timeout` expires.
    pub fn write_lock_with_timeout(&self, timeout: Timeout) -> Result<(), LockError> {
        self.write_lock_with(Some(timeout))
    }

    /// Acquires the write lock and returns a guard that releases it on drop.
    pub fn write_guard(&self) -> Result<WriteGuard<'_, S>, LockError> {
        self.write_lock()?;
        Ok(WriteGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Releases one level of the write lock.
    ///
    /// Read locks the holder took while writing survive the release as
    /// ordinary read locks.
    ///
    /// # Panics
    ///
    /// Panics if the caller does not hold the write lock.
    pub fn write_unlock(&self) {
        self.assert_alive("rw_lock_write_unlock");
        let me = self.sched.current_thread();
        let guard = self.sched.coordinator().lock();
        self.write_unlock_locked(&guard, me);
    }

    fn write_lock_with(&self, timeout: Option<Timeout>) -> Result<(), LockError> {
        self.assert_alive("rw_lock_write_lock");
        let me = self.sched.current_thread();
        let mut guard = self.sched.coordinator().lock();
        self.write_lock_locked(&mut guard, me, timeout)
    }

    fn write_lock_locked(
        &self,
        guard: &mut CoordinatorGuard<'_>,
        me: ThreadId,
        timeout: Option<Timeout>,
    ) -> Result<(), LockError> {
        // SAFETY: The coordinator is held.
        let state = unsafe { self.state.get_mut(guard) };
        if self.writer() == Some(me) {
            state.write_depth += 1;
            return Ok(());
        }

        let old = self.count.add_writer();
        if old.is_free() {
            self.set_writer(Some(me));
            state.write_depth = 1;
            return Ok(());
        }

        // First writer in line: remember how many readers are inside.
        if !old.has_writer() {
            state.active_readers = old.reader_units() - state.pending_readers;
        }

        assert!(
            self.sched.can_block(),
            "rw_lock_write_lock(): called with blocking forbidden for lock {:p} (\"{}\")",
            self,
            self.name,
        );
        log::trace!(
            "rw lock {:p} (\"{}\"): writer {me} waits",
            self,
            self.name
        );
        let wake = waitqueue::wait(
            self.sched,
            guard,
            &self.waiters,
            WaiterRole::Writer,
            BlockKind::RwLock,
            self.as_ptr(),
            timeout,
        );

        match wake {
            Wake::Dequeued(result) => result,
            Wake::Abandoned(err) => {
                self.abandon_write(guard);
                log::debug!(
                    "rw lock {:p} (\"{}\"): writer {me} gave up waiting: {err}",
                    self,
                    self.name
                );
                Err(err)
            }
        }
    }

    fn write_unlock_locked(&self, guard: &CoordinatorGuard<'_>, me: ThreadId) {
        // SAFETY: The coordinator is held.
        let state = unsafe { self.state.get_mut(guard) };
        let holder = self.writer();
        assert!(
            holder == Some(me),
            "rw_lock_write_unlock(): lock {:p} (\"{}\") not write-locked by thread {me} \
             (holder {holder:?})",
            self,
            self.name,
        );

        state.write_depth -= 1;
        if state.write_depth > 0 {
            return;
        }

        // Our own read locks outlive the write lock.
        let carried = i64::from(state.self_reads);
        state.self_reads = 0;
        self.set_writer(None);

        let remaining = after_sub_writer(self.count.sub_writer());
        stress::race_window();
        if remaining.is_free() {
            return;
        }

        if remaining.has_writer() {
            // The next writer waits for exactly our carried reads.
            state.active_readers = carried;
            self.unblock(guard, state);
        } else {
            // Readers that announced themselves after our release are not in
            // the queue yet; let them in without waiting when they arrive.
            let woken = self.unblock(guard, state).readers();
            state.pending_readers = remaining.reader_units() - carried - woken;
        }
    }

    /// Undoes a queued writer's announcement after it gave up.
    fn abandon_write(&self, guard: &CoordinatorGuard<'_>) {
        // SAFETY: The coordinator is held.
        let state = unsafe { self.state.get_mut(guard) };
        let remaining = after_sub_writer(self.count.sub_writer());

        if remaining.has_writer() {
            // We may have been the head the next grant was waiting on.
            self.unblock(guard, state);
        } else {
            // Last writer gone: readers queued behind us go in now, and
            // readers still on their way must not wait either.
            let woken = self.unblock(guard, state).readers();
            state.pending_readers = remaining.reader_units() - state.active_readers - woken;
            state.active_readers = 0;
        }
    }

    /// Admits the next waiter(s), if the lock state allows it.
    fn unblock(&self, guard: &CoordinatorGuard<'_>, state: &mut RwState) -> Admitted {
        if self.writer().is_some() {
            return Admitted::Nobody;
        }
        // SAFETY: The coordinator is held.
        let waiters = unsafe { self.waiters.get_mut(guard) };

        match waiters.front_role() {
            None => Admitted::Nobody,
            Some(WaiterRole::Writer) => {
                if state.active_readers > 0 || state.pending_readers > 0 {
                    return Admitted::Nobody;
                }
                let Some(thread) = waiters.pop_front(Ok(())) else {
                    return Admitted::Nobody;
                };
                self.set_writer(Some(thread));
                state.write_depth = 1;
                log::trace!(
                    "rw lock {:p} (\"{}\"): handed off to writer {thread}",
                    self,
                    self.name
                );
                self.sched.unblock_locked(guard, thread, Ok(()));
                Admitted::Writer
            }
            Some(WaiterRole::Reader) => {
                let mut woken = 0;
                while waiters.front_role() == Some(WaiterRole::Reader) {
                    let Some(thread) = waiters.pop_front(Ok(())) else {
                        break;
                    };
                    self.sched.unblock_locked(guard, thread, Ok(()));
                    woken += 1;
                }
                if self.count.load().has_writer() {
                    state.active_readers += woken;
                }
                log::trace!(
                    "rw lock {:p} (\"{}\"): woke {woken} readers",
                    self,
                    self.name
                );
                Admitted::Readers(woken)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tears the lock down, failing every queued waiter with
    /// [`LockError::Destroyed`].
    ///
    /// With waiters present the caller is expected to hold the write lock.
    /// If it does not, the error is logged and the write lock is taken first
    /// (`--cfg hadron_lock_debug` panics instead).
    pub fn destroy(&self) {
        let me = self.sched.current_thread();
        let mut guard = self.sched.coordinator().lock();
        self.assert_alive("rw_lock_destroy");

        // SAFETY: The coordinator is held.
        let contended = !unsafe { self.waiters.get_mut(&guard) }.is_empty();
        if contended && self.writer() != Some(me) {
            log::error!(
                "rw_lock_destroy(): there are blocking threads, but thread {me} doesn't hold \
                 the write lock ({:p} \"{}\")",
                self,
                self.name
            );
            if cfg!(hadron_lock_debug) {
                panic!(
                    "rw_lock_destroy(): there are blocking threads, but thread {me} doesn't \
                     hold the write lock ({:p} \"{}\")",
                    self, self.name
                );
            }
            if self.write_lock_locked(&mut guard, me, None).is_err() {
                return;
            }
        }

        // SAFETY: The coordinator is held.
        let waiters = unsafe { self.waiters.get_mut(&guard) };
        if !waiters.is_empty() {
            log::warn!(
                "rw lock {:p} (\"{}\") destroyed with {} waiters",
                self,
                self.name,
                waiters.len()
            );
        }
        waiters.drain(Err(LockError::Destroyed), |thread| {
            self.sched
                .unblock_locked(&guard, thread, Err(LockError::Destroyed));
        });

        // SAFETY: The coordinator is held.
        *unsafe { self.state.get_mut(&guard) } = RwState::default();
        self.set_writer(None);
        self.flags
            .fetch_or(RwLockFlags::DESTROYED.bits(), Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    pub(super) fn coordinator(&self) -> &CoordinatorLock {
        self.sched.coordinator()
    }

    fn set_writer(&self, thread: Option<ThreadId>) {
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

    fn as_ptr(&self) -> *const () {
        core::ptr::from_ref(self).cast()
    }
}

/// Counter value after a writer's retraction, given the value before it.
fn after_sub_writer(old: CountValue) -> CountValue {
    CountValue::from_raw(old.raw() - WRITER_UNIT)
}

/// RAII guard for a read lock.
pub struct ReadGuard<'a, S: Scheduler + 'static> {
    lock: &'a RwLock<S>,
    _not_send: PhantomData<*const ()>,
}

impl<S: Scheduler> Drop for ReadGuard<'_, S> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// RAII guard for one level of the write lock.
pub struct WriteGuard<'a, S: Scheduler + 'static> {
    lock: &'a RwLock<S>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, S: Scheduler> WriteGuard<'a, S> {
    /// Takes a read lock on top of the held write lock.
    pub fn read_guard(&self) -> Result<ReadGuard<'a, S>, LockError> {
        self.lock.read_guard()
    }
}

impl<S: Scheduler> Drop for WriteGuard<'_, S> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
