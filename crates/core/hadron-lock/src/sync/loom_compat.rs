//! Loom compatibility shim.
//!
//! When compiled with `cfg(loom)`, re-exports loom's atomics so the lock
//! state words can be model-checked. Otherwise, re-exports the standard
//! `core::sync::atomic` types.
//!
//! The coordinator spin lock stays on `core` atomics: loom
//! cannot make progress through a spin loop.

// ---------------------------------------------------------------------------
// Loom mode
// ---------------------------------------------------------------------------

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{
    AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering,
};

// ---------------------------------------------------------------------------
// Normal mode
// ---------------------------------------------------------------------------

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{
    AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering,
};
