//! A [`Scheduler`] for host unit tests.
//!
//! Kernel threads are played by OS threads; blocking parks the thread and
//! unblocking unparks it. Every test leaks its own instance so tests running
//! in parallel do not share a coordinator.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::Thread;
use std::time::{Duration, Instant};

use super::{CoordinatorGuard, CoordinatorLock, Mutex, RwLock};
use crate::cell::CoordinatorCell;
use crate::sched::{BlockKind, Scheduler, Timeout};
use crate::{LockError, ThreadId};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadId = ThreadId::new(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
    static BLOCKING_FORBIDDEN: Cell<bool> = const { Cell::new(false) };
}

/// Upper bound for [`HostScheduler::wait_for_blocked`] before a test is
/// declared hung.
const STUCK_AFTER: Duration = Duration::from_secs(10);

/// Returns the calling OS thread's kernel thread id.
pub(crate) fn current_id() -> ThreadId {
    CURRENT.with(|id| *id)
}

/// Makes [`Scheduler::can_block`] return `false` on the calling thread
/// while `forbidden` is set.
pub(crate) fn forbid_blocking(forbidden: bool) {
    BLOCKING_FORBIDDEN.with(|f| f.set(forbidden));
}

/// A lock whose blocked threads [`HostScheduler`] can count.
///
/// Only the lock types themselves implement this, so passing a reference
/// to a reference does not compile.
pub(crate) trait WaitTarget {
    /// The address the lock reports to [`Scheduler::prepare_to_block`].
    fn wait_addr(&self) -> usize {
        core::ptr::from_ref(self).addr()
    }
}

impl WaitTarget for Mutex<HostScheduler> {}
impl WaitTarget for RwLock<HostScheduler> {}

struct Slot {
    thread: Thread,
    lock: usize,
    kind: BlockKind,
    status: Option<Result<(), LockError>>,
}

pub(crate) struct HostScheduler {
    coordinator: CoordinatorLock,
    boot: Instant,
    slots: CoordinatorCell<HashMap<ThreadId, Slot>>,
}

impl HostScheduler {
    pub(crate) fn new() -> Self {
        Self {
            coordinator: CoordinatorLock::new(),
            boot: Instant::now(),
            slots: CoordinatorCell::new(HashMap::new()),
        }
    }

    /// Creates a scheduler that lives for the rest of the test process.
    pub(crate) fn leak() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    /// Number of threads currently blocked on `lock`.
    pub(crate) fn blocked_on<L: WaitTarget>(&self, lock: &L) -> usize {
        let addr = lock.wait_addr();
        let guard = self.coordinator.lock();
        // SAFETY: The coordinator is held.
        let slots = unsafe { self.slots.get_mut(&guard) };
        slots
            .values()
            .filter(|s| s.lock == addr && s.status.is_none())
            .count()
    }

    /// Returns the block kind `thread` announced, if it is blocked.
    pub(crate) fn block_kind(&self, thread: ThreadId) -> Option<BlockKind> {
        let guard = self.coordinator.lock();
        // SAFETY: The coordinator is held.
        let slots = unsafe { self.slots.get_mut(&guard) };
        slots
            .get(&thread)
            .filter(|s| s.status.is_none())
            .map(|s| s.kind)
    }

    /// Spins until at least `n` threads are blocked on `lock`.
    pub(crate) fn wait_for_blocked<L: WaitTarget>(&self, lock: &L, n: usize) {
        let start = Instant::now();
        while self.blocked_on(lock) < n {
            assert!(
                start.elapsed() < STUCK_AFTER,
                "timed out waiting for {n} blocked threads"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Interrupts a blocked thread, as a signal would.
    pub(crate) fn interrupt(&self, thread: ThreadId) {
        let guard = self.coordinator.lock();
        // SAFETY: The coordinator is held.
        let slots = unsafe { self.slots.get_mut(&guard) };
        let slot = slots.get_mut(&thread).expect("thread is not blocked");
        slot.status = Some(Err(LockError::Interrupted));
        slot.thread.unpark();
    }

    /// Takes the caller's status if it has been woken.
    fn take_status(&self, guard: &CoordinatorGuard<'_>) -> Option<Result<(), LockError>> {
        let me = current_id();
        // SAFETY: The coordinator is held.
        let slots = unsafe { self.slots.get_mut(guard) };
        let status = slots.get(&me).expect("blocking without prepare_to_block").status;
        if status.is_some() {
            slots.remove(&me);
        }
        status
    }

    fn give_up(&self, guard: &CoordinatorGuard<'_>) {
        // SAFETY: The coordinator is held.
        unsafe { self.slots.get_mut(guard) }.remove(&current_id());
    }
}

impl Scheduler for HostScheduler {
    fn current_thread(&self) -> ThreadId {
        current_id()
    }

    fn can_block(&self) -> bool {
        !BLOCKING_FORBIDDEN.with(Cell::get)
    }

    fn coordinator(&self) -> &CoordinatorLock {
        &self.coordinator
    }

    fn prepare_to_block(
        &self,
        guard: &CoordinatorGuard<'_>,
        thread: ThreadId,
        kind: BlockKind,
        lock: *const (),
    ) {
        assert_eq!(thread, current_id());
        let slot = Slot {
            thread: std::thread::current(),
            lock: lock.addr(),
            kind,
            status: None,
        };
        // SAFETY: The coordinator is held.
        unsafe { self.slots.get_mut(guard) }.insert(thread, slot);
    }

    fn block_locked(&self, guard: &mut CoordinatorGuard<'_>) -> Result<(), LockError> {
        loop {
            if let Some(status) = self.take_status(guard) {
                return status;
            }
            guard.unlocked(std::thread::park);
        }
    }

    fn block_with_timeout_locked(
        &self,
        guard: &mut CoordinatorGuard<'_>,
        timeout: Timeout,
    ) -> Result<(), LockError> {
        let deadline = match timeout {
            Timeout::Relative(d) => Instant::now() + d,
            Timeout::Absolute(since_boot) => self.boot + since_boot,
        };
        loop {
            if let Some(status) = self.take_status(guard) {
                return status;
            }
            let now = Instant::now();
            if now >= deadline {
                self.give_up(guard);
                return Err(LockError::TimedOut);
            }
            guard.unlocked(|| std::thread::park_timeout(deadline - now));
        }
    }

    fn unblock_locked(
        &self,
        guard: &CoordinatorGuard<'_>,
        thread: ThreadId,
        status: Result<(), LockError>,
    ) {
        // SAFETY: The coordinator is held.
        let slots = unsafe { self.slots.get_mut(guard) };
        let slot = slots.get_mut(&thread).expect("unblocking a thread that is not blocked");
        slot.status = Some(status);
        slot.thread.unpark();
    }
}
