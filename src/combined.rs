//! Combined allocator: size-classed front for everything a class can hold,
//! page-granular large allocator for the rest, one uniform query surface.
//!
//! Also hosts the process-global instance (`init` + [`GlobalHeap`]) and the
//! thread-local cache handle that drains itself back into the primary when
//! its thread exits.

use std::ptr::{self, NonNull};

use crate::cache::AllocatorCache;
use crate::primary::{ConfigError, PrimaryConfig, SizeClassAllocator};
use crate::secondary::LargeMmapAllocator;
use crate::size_class::{DefaultSizeClassMap, SizeClassMap};
use crate::stats;
use crate::sync::OnceLock;
use crate::sync::atomic::Ordering;
use crate::sync::cell::UnsafeCell;

pub struct CombinedAllocator<M: SizeClassMap = DefaultSizeClassMap> {
    primary: SizeClassAllocator<M>,
    secondary: LargeMmapAllocator,
}

impl<M: SizeClassMap> CombinedAllocator<M> {
    /// Create an allocator pair with the default primary configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the schedule or configuration is invalid.
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(PrimaryConfig::default())
    }

    /// Create an allocator pair with a custom primary configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the schedule or configuration is invalid.
    pub fn with_config(config: PrimaryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            primary: SizeClassAllocator::with_config(config)?,
            secondary: LargeMmapAllocator::new(),
        })
    }

    /// Allocate `size` bytes at the given power-of-two alignment, through
    /// the calling thread's cache. `size == 0` is served as one byte —
    /// returning null for it breaks too many legacy clients. Returns
    /// `None` only on arithmetic overflow of the request.
    pub fn allocate(
        &self,
        cache: &mut AllocatorCache<M>,
        size: usize,
        alignment: usize,
        cleared: bool,
    ) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        let mut size = if size == 0 { 1 } else { size };
        size.checked_add(alignment)?;
        if alignment > 8 {
            // Class sizes that are multiples of the alignment guarantee
            // aligned blocks; rounding the size up arranges exactly that.
            size = size.next_multiple_of(alignment);
        }
        let res = if self.primary.can_allocate(size, alignment) {
            Some(cache.allocate(&self.primary, M::class_of(size)))
        } else {
            self.secondary.allocate(size, alignment)
        };
        if alignment > 8
            && let Some(p) = res
        {
            assert!(
                (p.as_ptr() as usize).is_multiple_of(alignment),
                "allocator returned {p:p} for alignment {alignment}"
            );
        }
        if cleared
            && let Some(p) = res
        {
            // Safety: freshly allocated block of at least `size` bytes.
            unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        }
        res
    }

    /// Free a block. Null is a no-op. Dispatches on primary ownership;
    /// anything else must be a live large-block user base.
    ///
    /// # Safety
    /// `p` must be null or a pointer previously returned by this
    /// allocator's `allocate`/`reallocate` and not freed since.
    pub unsafe fn deallocate(&self, cache: &mut AllocatorCache<M>, p: *mut u8) {
        let Some(p) = NonNull::new(p) else { return };
        if self.primary.pointer_is_mine(p.as_ptr()) {
            let class = self.primary.class_id(p.as_ptr());
            cache.deallocate(&self.primary, class, p);
        } else {
            // Safety: upheld by caller — not the primary's, so a live
            // large-block user base.
            unsafe { self.secondary.deallocate(p) };
        }
    }

    /// Resize a block by allocate-copy-free. Never shrinks in place.
    /// `p == null` degenerates to `allocate`; `new_size == 0` degenerates
    /// to `deallocate` and returns `None`.
    ///
    /// # Safety
    /// Same contract as [`deallocate`](Self::deallocate) for `p`.
    pub unsafe fn reallocate(
        &self,
        cache: &mut AllocatorCache<M>,
        p: *mut u8,
        new_size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(p) else {
            return self.allocate(cache, new_size, alignment, false);
        };
        if new_size == 0 {
            // Safety: upheld by caller.
            unsafe { self.deallocate(cache, p) };
            return None;
        }
        assert!(
            self.pointer_is_mine(p),
            "reallocate of foreign pointer {p:p}"
        );
        // Safety: p is a live user base (checked above).
        let old_size = unsafe { self.get_actually_allocated_size(old) };
        let copy = new_size.min(old_size);
        let new_p = self.allocate(cache, new_size, alignment, false);
        if let Some(q) = new_p {
            // Safety: distinct live blocks, both at least `copy` bytes.
            unsafe { ptr::copy_nonoverlapping(old.as_ptr(), q.as_ptr(), copy) };
        }
        // Safety: upheld by caller; freed exactly once.
        unsafe { self.deallocate(cache, p) };
        new_p
    }

    /// True iff `p` was handed out by either side and is live (for the
    /// primary: lies in its class space).
    #[must_use]
    pub fn pointer_is_mine(&self, p: *const u8) -> bool {
        self.primary.pointer_is_mine(p) || self.secondary.pointer_is_mine(p)
    }

    /// The block's fixed side-band metadata region.
    ///
    /// # Safety
    /// `p` must point into a live block from this allocator.
    #[must_use]
    pub unsafe fn get_metadata(&self, p: NonNull<u8>) -> NonNull<u8> {
        if self.primary.pointer_is_mine(p.as_ptr()) {
            // Safety: metadata() is pure arithmetic; the entry is committed
            // for every carved block.
            unsafe { NonNull::new_unchecked(self.primary.metadata(p.as_ptr())) }
        } else {
            // Safety: upheld by caller.
            unsafe { self.secondary.get_metadata(p) }
        }
    }

    /// Base of the block containing `p`, if `p` points into one.
    #[must_use]
    pub fn get_block_begin(&self, p: *const u8) -> Option<NonNull<u8>> {
        if self.primary.pointer_is_mine(p) {
            NonNull::new(self.primary.block_begin(p))
        } else {
            self.secondary.get_block_begin(p)
        }
    }

    /// Usable capacity of the block `p` points into (at least the size
    /// requested at allocation).
    ///
    /// # Safety
    /// `p` must point into a live block from this allocator (for the
    /// secondary: be its user base).
    #[must_use]
    pub unsafe fn get_actually_allocated_size(&self, p: NonNull<u8>) -> usize {
        if self.primary.pointer_is_mine(p.as_ptr()) {
            self.primary.size(p.as_ptr())
        } else {
            // Safety: upheld by caller.
            unsafe { self.secondary.get_actually_allocated_size(p) }
        }
    }

    /// Bytes committed by the primary plus bytes mapped by the secondary.
    #[must_use]
    pub fn total_memory_used(&self) -> usize {
        self.primary.total_memory_used() + self.secondary.total_memory_used()
    }

    /// Drain a thread's cache into the primary. Call when the owning
    /// thread exits (or for GC-like reclamation with the owner quiescent).
    pub fn swallow_cache(&self, cache: &mut AllocatorCache<M>) {
        cache.drain(&self.primary);
    }

    /// Tear down the primary's address range. For test harnesses only.
    ///
    /// # Safety
    /// No allocation may be live and nothing may touch the allocator
    /// afterwards (other than drop).
    pub unsafe fn test_only_unmap(&self) {
        // Safety: upheld by caller.
        unsafe { self.primary.test_only_unmap() };
    }

    #[must_use]
    pub fn primary(&self) -> &SizeClassAllocator<M> {
        &self.primary
    }

    #[must_use]
    pub fn secondary(&self) -> &LargeMmapAllocator {
        &self.secondary
    }
}

// ---------------------------------------------------------------------------
// Snapshot of the diagnostic counters
// ---------------------------------------------------------------------------

pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub primary_committed: usize,
    pub secondary_mapped: usize,
}

/// Read the global diagnostic counters. Values are relaxed snapshots; see
/// the `stats` module notes.
#[must_use]
pub fn memory_stats() -> MemoryStats {
    MemoryStats {
        total_reserved: stats::TOTAL_RESERVED.load(Ordering::Relaxed),
        total_committed: stats::TOTAL_COMMITTED.load(Ordering::Relaxed),
        primary_committed: stats::PRIMARY_COMMITTED.load(Ordering::Relaxed),
        secondary_mapped: stats::SECONDARY_MAPPED.load(Ordering::Relaxed),
    }
}

// ---------------------------------------------------------------------------
// Global instance + thread-local cache handle
// ---------------------------------------------------------------------------

static GLOBAL_HEAP: OnceLock<CombinedAllocator<DefaultSizeClassMap>> = OnceLock::new();

thread_local! {
    static THREAD_CACHE: CacheHandle = CacheHandle::new();
}

/// Per-thread handle owning the thread-local cache.
///
/// `cache` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS). None of the facade operations re-enter the
/// TLS access point — they work against the primary and secondary directly.
struct CacheHandle {
    cache: UnsafeCell<AllocatorCache<DefaultSizeClassMap>>,
}

impl CacheHandle {
    fn new() -> Self {
        Self {
            cache: UnsafeCell::new(AllocatorCache::new()),
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        // Drain cached blocks back to the primary on thread exit; a dead
        // thread's cache would otherwise strand its runs.
        if let Some(heap) = GLOBAL_HEAP.get() {
            // Safety: Drop provides exclusive access.
            let cache = crate::sync::unsafe_cell_get_mut!(self.cache);
            heap.swallow_cache(cache);
        }
    }
}

/// Install the process-global allocator. Call once before first use.
///
/// # Errors
///
/// Returns `ConfigError` if already initialized or construction fails.
pub fn init() -> Result<(), ConfigError> {
    GLOBAL_HEAP
        .set(CombinedAllocator::new()?)
        .map_err(|_| ConfigError("already initialized".into()))
}

/// The process-global allocator, reached through each thread's own cache.
pub struct GlobalHeap;

impl GlobalHeap {
    /// Returns the initialized global allocator.
    ///
    /// # Panics
    ///
    /// Panics if [`init`] has not been called.
    #[must_use]
    pub fn get() -> &'static CombinedAllocator<DefaultSizeClassMap> {
        GLOBAL_HEAP.get().expect("shadowheap is not initialized")
    }

    /// [`CombinedAllocator::allocate`] through the calling thread's cache.
    pub fn allocate(size: usize, alignment: usize, cleared: bool) -> Option<NonNull<u8>> {
        let heap = Self::get();
        THREAD_CACHE.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy.
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            heap.allocate(cache, size, alignment, cleared)
        })
    }

    /// [`CombinedAllocator::deallocate`] through the calling thread's cache.
    ///
    /// # Safety
    /// Same contract as [`CombinedAllocator::deallocate`].
    pub unsafe fn deallocate(p: *mut u8) {
        let heap = Self::get();
        THREAD_CACHE.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy.
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            // Safety: upheld by caller.
            unsafe { heap.deallocate(cache, p) };
        });
    }

    /// [`CombinedAllocator::reallocate`] through the calling thread's cache.
    ///
    /// # Safety
    /// Same contract as [`CombinedAllocator::reallocate`].
    pub unsafe fn reallocate(
        p: *mut u8,
        new_size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let heap = Self::get();
        THREAD_CACHE.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy.
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            // Safety: upheld by caller.
            unsafe { heap.reallocate(cache, p, new_size, alignment) }
        })
    }

    /// Drain the calling thread's cache into the primary.
    pub fn drain_thread_cache() {
        let heap = Self::get();
        THREAD_CACHE.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy.
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            heap.swallow_cache(cache);
        });
    }

    #[must_use]
    pub fn total_memory_used() -> usize {
        Self::get().total_memory_used()
    }
}
