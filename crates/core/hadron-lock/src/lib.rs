//! Blocking synchronization primitives for the Hadron kernel.
//!
//! This crate contains the sleeping locks used by kernel threads: a
//! non-reentrant [`Mutex`](sync::Mutex), a [`RecursiveLock`](sync::RecursiveLock)
//! built on top of it, and a reader-writer [`RwLock`](sync::RwLock). All three
//! share one blocking discipline: an uncontended fast path on a single atomic,
//! and an intrusive FIFO [`WaitQueue`](sync::WaitQueue) of stack-resident
//! waiters that is only touched under the scheduler's coordinator lock.
//!
//! The scheduler itself is an external collaborator reached through the
//! [`Scheduler`](sched::Scheduler) trait, so the locks can be tested on the
//! host with `cargo test` and loom against a thread-parking scheduler.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cell;
pub mod debug;
pub mod error;
pub mod id;
pub mod sched;
pub mod sync;

pub use error::LockError;
pub use id::ThreadId;
