// Synchronization primitives, routed through one chokepoint.
//
// Model-checked builds (`--cfg loom`) swap every primitive for its loom
// twin; regular builds get std, plus `spin` for the spin mutex. Nothing
// outside this file may name std::sync or loom directly — an atomic that
// slips past the shim is invisible to the loom scheduler and quietly
// punches a hole in the exhaustive tests.
#![allow(unused_imports, unused_macros)]

pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering, fence,
    };

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering, fence,
    };
}

#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, RwLock};

// ---------------------------------------------------------------------------
// Spin mutex
//
// Guards the large-object registry: a few pointer writes per critical
// section, never a syscall, so spinning beats parking. loom cannot model
// a true busy-wait (its scheduler only advances at tracked operations), so
// model runs substitute a loom Mutex behind the same two-method surface.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use spin::Mutex as SpinMutex;

#[cfg(loom)]
pub(crate) struct SpinMutex<T>(loom::sync::Mutex<T>);

#[cfg(loom)]
impl<T> SpinMutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(loom::sync::Mutex::new(value))
    }

    pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// UnsafeCell
//
// The two UnsafeCells disagree on their escape hatch: std hands out a
// `*mut T` from `.get()`, loom insists on a `with_mut` callback. The macro
// below papers over the difference so callers write one form.
// ---------------------------------------------------------------------------
pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::UnsafeCell;

    #[cfg(not(loom))]
    pub(crate) use std::cell::UnsafeCell;
}

/// Borrow an `UnsafeCell`'s contents mutably, under either backend.
///
/// # Safety
/// Exclusive access must hold for the lifetime of the borrow — the usual
/// `UnsafeCell::get` obligation, just spelled once for both builds.
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: exclusivity promised by the caller.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: exclusivity promised by the caller.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_get_mut;

pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, current, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, current, spawn, yield_now};
}

// ---------------------------------------------------------------------------
// OnceLock
//
// loom ships no OnceLock. The cfg(loom) stand-in keeps the value behind a
// std Mutex<Option<T>> — deliberately std, not loom: these cells live in
// `static` items and a loom Mutex cannot be built in const context. The
// lock only serialises the one-shot initialisation; after that the cell is
// effectively immutable, so there is no interleaving here worth exploring.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    slot: std::sync::Mutex<Option<T>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> Option<&T> {
        let guard = self.slot.lock().unwrap();
        let value: *const T = guard.as_ref()?;
        // Safety: once set, the value is neither moved nor dropped while
        // &self is live, so the reference stays valid past the guard.
        Some(unsafe { &*value })
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &T {
        let mut guard = self.slot.lock().unwrap();
        let value: *const T = guard.get_or_insert_with(init);
        // Safety: as in `get` — the slot is never emptied.
        unsafe { &*value }
    }

    pub(crate) fn set(&self, value: T) -> Result<(), T> {
        let mut guard = self.slot.lock().unwrap();
        if guard.is_none() {
            *guard = Some(value);
            return Ok(());
        }
        Err(value)
    }
}

#[cfg(loom)]
// Safety: every access to the slot goes through its Mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

// ---------------------------------------------------------------------------
// Const-init statics
//
// loom's atomics and locks cannot initialise a `static` directly (their
// constructors are not const). These macros keep a plain const-initialised
// static for std builds and route model runs through `loom::lazy_static!`,
// which also rebuilds the value for every explored execution. Each macro
// carries two arms because lazy_static matches the literal `pub` token — a
// captured `vis` fragment would not re-match it.
// ---------------------------------------------------------------------------

/// Declare a static whose loom twin lacks const construction:
/// `static_atomic! { [pub] static NAME: Ty = expr; }`
#[allow(unused_macro_rules)]
macro_rules! static_atomic {
    (static $name:ident : $ty:ty = $value:expr ;) => {
        #[cfg(not(loom))]
        static $name: $ty = $value;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $name: $ty = $value;
        }
    };
    (pub static $name:ident : $ty:ty = $value:expr ;) => {
        #[cfg(not(loom))]
        pub static $name: $ty = $value;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $name: $ty = $value;
        }
    };
}
pub(crate) use static_atomic;

/// Same deal for `RwLock` statics (the test-harness lock):
/// `static_rwlock! { [pub] static NAME: RwLock<T> = expr; }`
#[allow(unused_macro_rules)]
macro_rules! static_rwlock {
    (static $name:ident : $ty:ty = $value:expr ;) => {
        #[cfg(not(loom))]
        static $name: $ty = $value;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $name: $ty = $value;
        }
    };
    (pub static $name:ident : $ty:ty = $value:expr ;) => {
        #[cfg(not(loom))]
        pub static $name: $ty = $value;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $name: $ty = $value;
        }
    };
}
pub(crate) use static_rwlock;
