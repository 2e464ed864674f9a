//! The reader-writer lock's composite counter.
//!
//! One signed 64-bit atomic holds both the number of outstanding reader
//! units (low 32 bits) and the number of writers holding or waiting, in
//! multiples of [`WRITER_UNIT`]. Readers and writers announce themselves
//! with a single `fetch_add`, and the value returned tells each side whether
//! it may proceed without taking the coordinator.

use super::loom_compat::{AtomicI64, Ordering};

/// Amount added to the counter by each writer.
///
/// Must exceed the largest number of concurrently outstanding readers.
pub const WRITER_UNIT: i64 = 1 << 32;

/// A value read from a [`CompositeCount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountValue(i64);

impl CountValue {
    /// Wraps a raw counter value.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Number of reader units outstanding (held, active or pending).
    pub const fn reader_units(self) -> i64 {
        self.0 % WRITER_UNIT
    }

    /// Number of writers holding or queued.
    pub const fn writer_units(self) -> i64 {
        self.0 / WRITER_UNIT
    }

    /// Returns `true` if a writer holds the lock or is queued for it.
    pub const fn has_writer(self) -> bool {
        self.0 >= WRITER_UNIT
    }

    /// Returns `true` if nobody holds or waits for the lock.
    pub const fn is_free(self) -> bool {
        self.0 == 0
    }
}

/// Atomic reader/writer counter.
pub struct CompositeCount(AtomicI64);

impl CompositeCount {
    /// Creates a zeroed counter.
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Reads the current value.
    #[inline]
    pub fn load(&self) -> CountValue {
        CountValue(self.0.load(Ordering::Acquire))
    }

    /// Announces a reader. Returns the previous value.
    #[inline]
    pub fn add_reader(&self) -> CountValue {
        CountValue(self.0.fetch_add(1, Ordering::AcqRel))
    }

    /// Retracts a reader. Returns the previous value.
    #[inline]
    pub fn sub_reader(&self) -> CountValue {
        CountValue(self.0.fetch_sub(1, Ordering::AcqRel))
    }

    /// Retracts a reader only if no writer holds or waits for the lock.
    ///
    /// Returns the previous value, or `Err` with the value that showed a
    /// writer (the counter is left untouched then).
    #[inline]
    pub fn sub_reader_unless_writer(&self) -> Result<CountValue, CountValue> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if CountValue(current).has_writer() {
                return Err(CountValue(current));
            }
            match self.0.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(old) => return Ok(CountValue(old)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Announces a writer. Returns the previous value.
    #[inline]
    pub fn add_writer(&self) -> CountValue {
        CountValue(self.0.fetch_add(WRITER_UNIT, Ordering::AcqRel))
    }

    /// Retracts a writer. Returns the previous value.
    #[inline]
    pub fn sub_writer(&self) -> CountValue {
        CountValue(self.0.fetch_sub(WRITER_UNIT, Ordering::AcqRel))
    }
}

impl Default for CompositeCount {
    fn default() -> Self {
        Self::new()
    }
}
