//! Intrusive FIFO queue of blocked threads.
//!
//! A [`Waiter`] lives on the stack of the thread that blocks. It is linked
//! into the lock's [`WaitQueue`] for the duration of the block and unlinked
//! before the blocking call returns, either by the thread that grants it the
//! lock (or destroys the lock) or by the waiter itself after a timeout. No
//! memory is allocated on either side.
//!
//! The queue stores raw pointers. It is always embedded in a
//! [`CoordinatorCell`](crate::cell::CoordinatorCell), so every operation runs
//! with the coordinator held.

use core::marker::{PhantomData, PhantomPinned};
use core::ptr::NonNull;

use super::CoordinatorGuard;
use crate::cell::CoordinatorCell;
use crate::sched::{BlockKind, Scheduler, Timeout};
use crate::{LockError, ThreadId};

/// What a queued thread wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterRole {
    /// Shared access (rw-lock readers).
    Reader,
    /// Exclusive access (mutex lockers and rw-lock writers).
    Writer,
}

impl WaiterRole {
    /// Single-letter tag used by the debugger dumps.
    pub const fn tag(self) -> char {
        match self {
            Self::Reader => 'r',
            Self::Writer => 'w',
        }
    }
}

/// A blocked thread's queue record.
pub struct Waiter {
    thread: ThreadId,
    role: WaiterRole,
    next: Option<NonNull<Waiter>>,
    /// Tail of the queue. Only meaningful on the head.
    last: Option<NonNull<Waiter>>,
    /// Set by whoever dequeues the waiter.
    outcome: Option<Result<(), LockError>>,
    _pinned: PhantomPinned,
}

impl Waiter {
    /// Creates an unlinked waiter record for `thread`.
    pub const fn new(thread: ThreadId, role: WaiterRole) -> Self {
        Self {
            thread,
            role,
            next: None,
            last: None,
            outcome: None,
            _pinned: PhantomPinned,
        }
    }

    /// Returns the waiting thread.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Returns the waiter's role.
    pub fn role(&self) -> WaiterRole {
        self.role
    }

    /// Returns how the wait ended, or `None` while still queued.
    pub fn outcome(&self) -> Option<Result<(), LockError>> {
        self.outcome
    }
}

/// Intrusive singly linked FIFO of [`Waiter`]s.
///
/// The head caches a pointer to the tail so that enqueueing is O(1).
/// Removal of an arbitrary waiter (timeouts) is an O(n) scan.
pub struct WaitQueue {
    head: Option<NonNull<Waiter>>,
}

// SAFETY: The queue only points at waiters whose owners are blocked, and it
// is only accessed with the coordinator held.
unsafe impl Send for WaitQueue {}

impl WaitQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Returns `true` if no thread is queued.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the number of queued waiters.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns the role of the waiter at the head of the queue.
    pub fn front_role(&self) -> Option<WaiterRole> {
        // SAFETY: Linked waiters stay valid until dequeued.
        self.head.map(|head| unsafe { head.as_ref().role })
    }

    /// Appends `waiter` to the tail of the queue.
    ///
    /// # Safety
    ///
    /// `waiter` must point to a valid, unlinked [`Waiter`] that is neither
    /// moved nor dropped until it has been dequeued again (by
    /// [`pop_front`](Self::pop_front), [`remove`](Self::remove) or
    /// [`drain`](Self::drain)).
    pub unsafe fn push_back(&mut self, waiter: NonNull<Waiter>) {
        let w = waiter.as_ptr();
        // SAFETY: The caller guarantees `waiter` is valid; the head and tail
        // are valid because linked waiters stay alive until dequeued.
        unsafe {
            (*w).next = None;
            (*w).outcome = None;
            match self.head {
                Some(head) => {
                    let head = head.as_ptr();
                    if let Some(tail) = (*head).last {
                        (*tail.as_ptr()).next = Some(waiter);
                    }
                    (*head).last = Some(waiter);
                }
                None => {
                    (*w).last = Some(waiter);
                    self.head = Some(waiter);
                }
            }
        }
        self.validate();
    }

    /// Dequeues the head waiter, records `outcome` in it and returns its
    /// thread so the caller can unblock it.
    ///
    /// The record must not be touched after the coordinator is released:
    /// once the waiter observes its outcome it returns and its stack frame is
    /// gone.
    pub fn pop_front(&mut self, outcome: Result<(), LockError>) -> Option<ThreadId> {
        let head = self.head?;
        let w = head.as_ptr();
        // SAFETY: Linked waiters stay valid until dequeued, and the waiter
        // cannot observe its outcome before the coordinator is released.
        let thread = unsafe {
            self.head = (*w).next;
            if let Some(next) = self.head {
                (*next.as_ptr()).last = (*w).last;
            }
            (*w).next = None;
            (*w).last = None;
            let thread = (*w).thread;
            (*w).outcome = Some(outcome);
            thread
        };
        self.validate();
        Some(thread)
    }

    /// Unlinks `target` from anywhere in the queue.
    ///
    /// Returns `false` if `target` was not queued (it had already been
    /// dequeued by another thread).
    pub fn remove(&mut self, target: NonNull<Waiter>) -> bool {
        let mut previous: Option<NonNull<Waiter>> = None;
        let mut current = self.head;

        while let Some(cur) = current {
            if cur == target {
                let c = cur.as_ptr();
                // SAFETY: All pointers reached from the head are linked and
                // therefore valid.
                unsafe {
                    let next = (*c).next;
                    match previous {
                        None => {
                            // First in line: the successor inherits the tail.
                            self.head = next;
                            if let Some(next) = next {
                                (*next.as_ptr()).last = (*c).last;
                            }
                        }
                        Some(prev) => {
                            (*prev.as_ptr()).next = next;
                            if next.is_none() {
                                if let Some(head) = self.head {
                                    (*head.as_ptr()).last = Some(prev);
                                }
                            }
                        }
                    }
                    (*c).next = None;
                    (*c).last = None;
                }
                self.validate();
                return true;
            }
            previous = current;
            // SAFETY: `cur` is linked and therefore valid.
            current = unsafe { (*cur.as_ptr()).next };
        }

        false
    }

    /// Dequeues every waiter, recording `outcome` in each, and calls `f` with
    /// each thread in queue order.
    pub fn drain(&mut self, outcome: Result<(), LockError>, mut f: impl FnMut(ThreadId)) -> usize {
        let mut count = 0;
        while let Some(thread) = self.pop_front(outcome) {
            f(thread);
            count += 1;
        }
        count
    }

    /// Iterates over the queued threads and their roles, head first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            _queue: PhantomData,
        }
    }

    /// Checks the head/tail invariants.
    ///
    /// Cheap checks always run in debug builds; `hadron_lock_debug` walks the
    /// whole queue.
    fn validate(&self) {
        let Some(head) = self.head else {
            return;
        };
        // SAFETY: Linked waiters stay valid until dequeued.
        let tail = unsafe { head.as_ref().last };
        debug_assert!(tail.is_some(), "wait queue head has no tail pointer");
        // SAFETY: As above.
        debug_assert!(
            tail.is_none_or(|t| unsafe { t.as_ref().next.is_none() }),
            "wait queue tail has a successor"
        );

        #[cfg(hadron_lock_debug)]
        {
            let mut walked = head;
            // SAFETY: As above.
            while let Some(next) = unsafe { walked.as_ref().next } {
                walked = next;
            }
            assert!(
                Some(walked) == tail,
                "wait queue corrupted: cached tail does not match the last waiter"
            );
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`WaitQueue::iter`].
pub struct Iter<'a> {
    current: Option<NonNull<Waiter>>,
    _queue: PhantomData<&'a WaitQueue>,
}

impl Iterator for Iter<'_> {
    type Item = (ThreadId, WaiterRole);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.current?;
        // SAFETY: The queue is borrowed, so every linked waiter stays valid.
        let waiter = unsafe { cur.as_ref() };
        self.current = waiter.next;
        Some((waiter.thread, waiter.role))
    }
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// How a call to [`wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// Another thread dequeued the waiter and recorded this outcome.
    Dequeued(Result<(), LockError>),
    /// The block ended (timeout, interruption) while the waiter was still
    /// queued. The waiter has removed itself; the caller must undo whatever
    /// counter it adjusted before blocking.
    Abandoned(LockError),
}

/// Queues the calling thread at the tail of `queue` and blocks it.
///
/// Called with the coordinator held; returns with it held again.
pub(crate) fn wait<S: Scheduler + ?Sized>(
    sched: &S,
    guard: &mut CoordinatorGuard<'_>,
    queue: &CoordinatorCell<WaitQueue>,
    role: WaiterRole,
    kind: BlockKind,
    lock: *const (),
    timeout: Option<Timeout>,
) -> Wake {
    debug_assert!(
        guard.holds(sched.coordinator()),
        "wait(): guard is for another coordinator"
    );
    let thread = sched.current_thread();
    let mut waiter = Waiter::new(thread, role);
    let record = NonNull::from(&mut waiter);

    // SAFETY: The coordinator is held. `waiter` lives until the end of this
    // function, and it is unlinked before then: either a dequeuer removes it
    // (and records an outcome) or we remove it below.
    unsafe { queue.get_mut(guard).push_back(record) };
    sched.prepare_to_block(guard, thread, kind, lock);

    let status = crate::sched::block(sched, guard, timeout);

    // SAFETY: The coordinator is held again, and dequeuers only write the
    // record while holding it.
    if let Some(outcome) = unsafe { record.as_ref().outcome() } {
        return Wake::Dequeued(outcome);
    }

    // SAFETY: The coordinator is held.
    let removed = unsafe { queue.get_mut(guard).remove(record) };
    assert!(
        removed,
        "thread {thread} woke without an outcome but is not queued"
    );
    match status {
        Err(err) => Wake::Abandoned(err),
        Ok(()) => panic!("thread {thread} resumed by the scheduler without being dequeued"),
    }
}
