//! Process-wide memory gauges.
//!
//! Everything here is advisory: updates are `Relaxed`, individual values
//! lag reality, and a snapshot across several counters can be mutually
//! inconsistent for a moment. That is fine for the diagnostics they feed,
//! and no allocation path may ever branch on them — the allocator
//! instances keep their own exact accounting in `total_memory_used`.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// A byte gauge that tolerates torn add/sub ordering.
///
/// Adds and subtracts from different threads may land in any order, so the
/// raw signed value can briefly dip below zero (a subtract overtaking its
/// matching add). Reads clamp at zero instead of treating that transient
/// as corruption.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    // Not const under loom (its atomics cannot be built in const context);
    // statics of this type go through `static_atomic!` instead.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    pub fn add(&self, bytes: usize) {
        self.0.fetch_add(Self::clamped(bytes), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, bytes: usize) {
        self.0.fetch_sub(Self::clamped(bytes), Ordering::Relaxed);
    }

    /// Read with explicit ordering, clamped at zero.
    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    /// Relaxed read, clamped at zero.
    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    // A delta beyond isize::MAX would be a bug somewhere upstream; a
    // diagnostic gauge is the wrong place to die for it.
    #[inline]
    fn clamped(bytes: usize) -> isize {
        bytes.min(isize::MAX as usize).cast_signed()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Address space reserved by the allocator: the primary's class space plus
// every live large mapping (header pages and alignment slack included).
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Memory committed (gains physical backing on first touch).
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown by subsystem.
crate::sync::static_atomic! {
    pub static PRIMARY_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SECONDARY_MAPPED: Counter = Counter::new();
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_sub() {
        let c = Counter::new();
        c.add(100);
        c.add(50);
        c.sub(30);
        assert_eq!(c.get(), 120);
    }

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0, "negative transients must read as zero");
        c.add(25);
        assert_eq!(c.load(Ordering::Relaxed), 15);
    }
}
