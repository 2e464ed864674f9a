//! Race-window widening for lock stress testing.
//!
//! The blocking locks have a few windows between a fast-path atomic and the
//! slow path's coordinator acquisition that other CPUs can slip into: a
//! mutex unlocker that has already incremented the count, a reader that has
//! announced itself while a writer releases. Built with
//! `--cfg hadron_lock_stress`, the locks call [`race_window`] inside each of
//! them, which spins for a random number of iterations. Otherwise it
//! compiles to nothing.
//!
//! ## Design
//!
//! - **PRNG**: one global xorshift64 state. Lost updates between CPUs only
//!   repeat a value, which is harmless here.
//! - **Delay**: a busy loop of `[0, max_spins)` iterations. Nothing here
//!   takes a lock or reads a clock, so it is callable from any context.
//! - Before [`init`] is called the delay is zero.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Upper bound on the spin count. Zero disables the delay.
static MAX_SPINS: AtomicU32 = AtomicU32::new(0);

/// xorshift64 state.
static PRNG_STATE: AtomicU64 = AtomicU64::new(FALLBACK_SEED);

const FALLBACK_SEED: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Configures the stress delays.
///
/// - `max_spins`: largest number of spin iterations per window; 0 disables.
/// - `seed`: PRNG seed, e.g. a boot timestamp. 0 selects a fixed fallback,
///   since zero is a fixed point of xorshift.
pub fn init(max_spins: u32, seed: u64) {
    let seed = if seed == 0 { FALLBACK_SEED } else { seed };
    PRNG_STATE.store(seed, Ordering::Relaxed);
    MAX_SPINS.store(max_spins, Ordering::Relaxed);
}

/// Returns the configured spin bound.
pub fn max_spins() -> u32 {
    MAX_SPINS.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// PRNG
// ---------------------------------------------------------------------------

#[inline]
fn next_random() -> u64 {
    let mut x = PRNG_STATE.load(Ordering::Relaxed);
    if x == 0 {
        x = FALLBACK_SEED;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    PRNG_STATE.store(x, Ordering::Relaxed);
    x
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Spins for a random number of iterations in `[0, max_spins)`.
///
/// Must not acquire any lock: it is called from inside lock paths.
#[inline]
pub fn stress_delay() {
    let max = max_spins();
    if max == 0 {
        return;
    }
    let spins = next_random() % u64::from(max);
    for _ in 0..spins {
        core::hint::spin_loop();
    }
}

/// Marks a race window in a lock path.
#[inline(always)]
pub fn race_window() {
    #[cfg(hadron_lock_stress)]
    stress_delay();
}
