//! Primary size-classed allocator.
//!
//! One contiguous address-space reservation, split into `NUM_CLASSES`
//! regions of `region_size` bytes each, the base aligned to `region_size`.
//! Class membership and block geometry are therefore pure arithmetic on the
//! pointer — no loads, no locks:
//!
//! ```text
//!   class(p)       = (p - space_beg) >> log2(region_size)
//!   block_begin(p) = region_beg + (offset / block_size) * block_size
//!   metadata(p)    = region_end - (block_index + 1) * BLOCK_METADATA_SIZE
//! ```
//!
//! Within a region, blocks are carved bump-wise from the front and their
//! fixed-size metadata entries from the back, so the two never meet and a
//! block's metadata can never alias user bytes. Pages are committed on
//! demand as the watermarks advance; commit syscalls are issued with the
//! per-class lock released and re-integrated afterwards, so no lock is ever
//! held across a syscall.
//!
//! The region base is `region_size`-aligned and every power-of-two request
//! size is itself a class size, which makes power-of-two allocations
//! naturally aligned.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use crate::free_list::FreeList;
use crate::size_class::SizeClassMap;
use crate::stats;
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::vm;

/// Bytes of side-band metadata kept for every block: two words, enough for
/// the size + tag pair a shadow runtime records per allocation.
pub const BLOCK_METADATA_SIZE: usize = 16;

/// Default per-class region: 4 GiB of address space. The whole reservation
/// (`NUM_CLASSES` regions plus alignment slack) is `PROT_NONE` until used,
/// so the cost is virtual only.
pub const DEFAULT_REGION_SIZE: usize = 1 << 32;

/// Configuration for [`SizeClassAllocator`]. Validated at construction.
#[derive(Clone, Debug)]
pub struct PrimaryConfig {
    /// Address-space region per size class, in bytes. Power of two, at
    /// least twice the schedule's largest class size.
    pub region_size: usize,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
        }
    }
}

/// Rejected allocator configuration.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocator configuration rejected: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Per-class back-end state, guarded by that class's lock.
struct Region {
    /// Central pool of freed blocks, shared by all threads.
    free_list: FreeList,
    /// Blocks carved from the region so far (bump counter).
    carved: usize,
    /// Bytes committed from the region start (user blocks).
    committed_user: usize,
    /// Bytes committed from the region end (metadata entries).
    committed_meta: usize,
    /// Debug-only: which carved blocks currently sit in the central pool.
    /// Catches double frees before they corrupt the intrusive links.
    #[cfg(debug_assertions)]
    pooled: FixedBitSet,
}

impl Region {
    fn new() -> Self {
        Self {
            free_list: FreeList::new(),
            carved: 0,
            committed_user: 0,
            committed_meta: 0,
            #[cfg(debug_assertions)]
            pooled: FixedBitSet::new(),
        }
    }
}

/// Commit work planned under the lock, executed with it released.
struct CommitRequest {
    user_beg: usize,
    user_len: usize,
    meta_beg: usize,
    meta_len: usize,
    user_target: usize,
    meta_target: usize,
}

enum CarvePlan {
    /// Committed memory already covers this many fresh blocks.
    Ready(usize),
    /// Pages must be committed first.
    Commit(CommitRequest),
    /// The region cannot hold any more blocks.
    Exhausted,
}

/// The size-classed back end: bulk source and sink of block runs for the
/// per-thread caches, and the authority on block identity.
pub struct SizeClassAllocator<M: SizeClassMap> {
    /// `region_size`-aligned start of the class regions.
    space_beg: usize,
    space_size: usize,
    region_size: usize,
    region_shift: u32,
    /// Original reservation (before alignment), for release.
    map_beg: NonNull<u8>,
    map_size: usize,
    regions: Vec<Mutex<Region>>,
    committed_bytes: AtomicUsize,
    unmapped: AtomicBool,
    _schedule: PhantomData<M>,
}

// Safety: the regions are guarded by their mutexes; everything else is
// immutable after construction apart from the atomics.
unsafe impl<M: SizeClassMap> Send for SizeClassAllocator<M> {}
// Safety: same reasoning; the identity queries are pure arithmetic on
// immutable fields.
unsafe impl<M: SizeClassMap> Sync for SizeClassAllocator<M> {}

impl<M: SizeClassMap> SizeClassAllocator<M> {
    /// Create an allocator with the default region size.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration or schedule is invalid.
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(PrimaryConfig::default())
    }

    /// Create an allocator with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `region_size` is not a power of two, is too
    /// small for the schedule's largest class, or the total space does not
    /// fit in the address space.
    pub fn with_config(config: PrimaryConfig) -> Result<Self, ConfigError> {
        M::validate();
        let region_size = config.region_size;
        let page = vm::page_size();

        if !region_size.is_power_of_two() {
            return Err(ConfigError(format!(
                "region size {region_size} is not a power of two"
            )));
        }
        if region_size < M::MAX_SIZE * 2 {
            return Err(ConfigError(format!(
                "region size {region_size} cannot hold the largest class ({}) plus metadata",
                M::MAX_SIZE
            )));
        }
        if region_size < page * 4 {
            return Err(ConfigError(format!(
                "region size {region_size} is below four pages ({page}-byte pages)"
            )));
        }

        let space_size = M::NUM_CLASSES
            .checked_mul(region_size)
            .ok_or_else(|| ConfigError("class space overflows the address space".into()))?;
        let map_size = space_size
            .checked_add(region_size)
            .ok_or_else(|| ConfigError("class space overflows the address space".into()))?;

        let map_beg = vm::reserve_range(map_size, "SizeClassAllocator");
        let space_beg = (map_beg.as_ptr() as usize).next_multiple_of(region_size);
        stats::TOTAL_RESERVED.add(map_size);

        let regions = (0..M::NUM_CLASSES)
            .map(|_| Mutex::new(Region::new()))
            .collect();

        Ok(Self {
            space_beg,
            space_size,
            region_size,
            region_shift: region_size.trailing_zeros(),
            map_beg,
            map_size,
            regions,
            committed_bytes: AtomicUsize::new(0),
            unmapped: AtomicBool::new(false),
            _schedule: PhantomData,
        })
    }

    // -----------------------------------------------------------------
    // Identity queries — lock-free, O(1), safe on arbitrary pointers
    // -----------------------------------------------------------------

    /// True iff `p` lies in this allocator's class space.
    #[inline]
    #[must_use]
    pub fn pointer_is_mine(&self, p: *const u8) -> bool {
        let addr = p as usize;
        addr >= self.space_beg && addr < self.space_beg + self.space_size
    }

    /// Size class of a pointer this allocator owns.
    #[inline]
    #[must_use]
    pub fn class_id(&self, p: *const u8) -> usize {
        debug_assert!(self.pointer_is_mine(p), "class_id of foreign pointer {p:p}");
        (p as usize - self.space_beg) >> self.region_shift
    }

    /// User-visible size of the block containing `p`.
    #[inline]
    #[must_use]
    pub fn size(&self, p: *const u8) -> usize {
        M::size_of(self.class_id(p))
    }

    /// Base address of the block containing `p`.
    #[inline]
    #[must_use]
    pub fn block_begin(&self, p: *const u8) -> *mut u8 {
        let class = self.class_id(p);
        let block_size = M::size_of(class);
        let region_beg = self.region_beg(class);
        let offset = p as usize - region_beg;
        (region_beg + (offset / block_size) * block_size) as *mut u8
    }

    /// Address of the fixed side-band metadata of the block containing `p`.
    /// The entry is [`BLOCK_METADATA_SIZE`] bytes, lives at the far end of
    /// the block's region, and never aliases user bytes.
    #[inline]
    #[must_use]
    pub fn metadata(&self, p: *const u8) -> *mut u8 {
        let class = self.class_id(p);
        let block_size = M::size_of(class);
        let region_beg = self.region_beg(class);
        let index = (p as usize - region_beg) / block_size;
        let region_end = region_beg + self.region_size;
        (region_end - (index + 1) * BLOCK_METADATA_SIZE) as *mut u8
    }

    /// Whether a `(size, alignment)` request can be served by a class.
    /// Power-of-two sizes land in power-of-two classes, so any such request
    /// comes back naturally aligned; larger alignments are satisfied when
    /// the class size is a multiple of the alignment (the facade rounds the
    /// size up to the alignment to guarantee that).
    #[inline]
    #[must_use]
    pub fn can_allocate(&self, size: usize, alignment: usize) -> bool {
        debug_assert!(alignment.is_power_of_two());
        size >= 1 && size <= M::MAX_SIZE && alignment <= M::size_of(M::class_of(size))
    }

    /// Bytes of the reservation currently committed (user blocks plus
    /// metadata pages).
    #[must_use]
    pub fn total_memory_used(&self) -> usize {
        self.committed_bytes.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------
    // Bulk transfer — per-class lock, syscalls outside it
    // -----------------------------------------------------------------

    /// Refill `out_list` with a run of blocks of `class`: at least one, at
    /// most `max_cached(class)`. Aborts if the region is exhausted.
    pub fn bulk_allocate(&self, class: usize, out_list: &mut FreeList) {
        assert!(class < M::NUM_CLASSES, "class {class} out of range");
        debug_assert!(out_list.is_empty(), "refill into a non-empty list");
        let batch = M::max_cached(class);
        let block_size = M::size_of(class);
        let region_beg = self.region_beg(class);

        let mut region = self.regions[class]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while region.free_list.len() < batch {
            let want = batch - region.free_list.len();
            match self.plan_carve(class, &region, want) {
                CarvePlan::Ready(count) => {
                    for _ in 0..count {
                        let index = region.carved;
                        region.carved = index + 1;
                        let block = region_beg + index * block_size;
                        // Safety: region bases are never at address zero.
                        let node = unsafe { NonNull::new_unchecked(block as *mut u8) };
                        #[cfg(debug_assertions)]
                        {
                            region.pooled.grow(index + 1);
                            region.pooled.insert(index);
                        }
                        region.free_list.push_front(node);
                    }
                    break;
                }
                CarvePlan::Commit(req) => {
                    // Commit with the class lock released; re-integrate the
                    // watermarks afterwards. A racing thread committing an
                    // overlapping range is a harmless re-protect.
                    drop(region);
                    if req.user_len > 0 {
                        // Safety: the range lies inside our reservation.
                        unsafe {
                            vm::commit_range(
                                NonNull::new_unchecked(req.user_beg as *mut u8),
                                req.user_len,
                                "SizeClassAllocator",
                            );
                        }
                    }
                    if req.meta_len > 0 {
                        // Safety: the range lies inside our reservation.
                        unsafe {
                            vm::commit_range(
                                NonNull::new_unchecked(req.meta_beg as *mut u8),
                                req.meta_len,
                                "SizeClassAllocator",
                            );
                        }
                    }
                    region = self.regions[class]
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let mut delta = 0;
                    if req.user_target > region.committed_user {
                        delta += req.user_target - region.committed_user;
                        region.committed_user = req.user_target;
                    }
                    if req.meta_target > region.committed_meta {
                        delta += req.meta_target - region.committed_meta;
                        region.committed_meta = req.meta_target;
                    }
                    if delta > 0 {
                        self.committed_bytes.fetch_add(delta, Ordering::Relaxed);
                        stats::TOTAL_COMMITTED.add(delta);
                        stats::PRIMARY_COMMITTED.add(delta);
                    }
                    // Re-plan: the pool may have changed while unlocked.
                }
                CarvePlan::Exhausted => break,
            }
        }

        let take = region.free_list.len().min(batch);
        assert!(
            take >= 1,
            "size-class region for class {class} exhausted ({} blocks carved)",
            region.carved
        );
        for _ in 0..take {
            let node = match region.free_list.pop_front() {
                Some(node) => node,
                None => unreachable!("pool length lied"),
            };
            #[cfg(debug_assertions)]
            {
                let index = (node.as_ptr() as usize - region_beg) / block_size;
                debug_assert!(region.pooled.contains(index));
                region.pooled.set(index, false);
            }
            out_list.push_front(node);
        }
    }

    /// Absorb every block of `in_list` into the central pool for `class`.
    /// The blocks become reusable by any thread; `in_list` is left empty.
    pub fn bulk_deallocate(&self, class: usize, in_list: &mut FreeList) {
        assert!(class < M::NUM_CLASSES, "class {class} out of range");
        let block_size = M::size_of(class);
        let region_beg = self.region_beg(class);

        let mut region = self.regions[class]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while let Some(node) = in_list.pop_front() {
            let addr = node.as_ptr() as usize;
            debug_assert!(
                self.pointer_is_mine(node.as_ptr()),
                "foreign pointer {node:p} freed into the primary"
            );
            debug_assert_eq!(
                self.class_id(node.as_ptr()),
                class,
                "pointer {node:p} freed into the wrong class"
            );
            debug_assert!(
                (addr - region_beg).is_multiple_of(block_size),
                "pointer {node:p} is not a block base"
            );
            #[cfg(debug_assertions)]
            {
                let index = (addr - region_beg) / block_size;
                assert!(index < region.carved, "pointer {node:p} was never carved");
                assert!(
                    !region.pooled.contains(index),
                    "double free of {node:p} (class {class})"
                );
                region.pooled.insert(index);
            }
            region.free_list.push_front(node);
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Release the whole reservation. For test harnesses only.
    ///
    /// # Safety
    /// No allocation from this instance may be live, and no method may be
    /// called on it afterwards (other than drop).
    pub unsafe fn test_only_unmap(&self) {
        self.release_space();
    }

    fn release_space(&self) {
        if self.unmapped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Safety: the reservation is ours; callers guarantee nothing
        // references it any more.
        unsafe { vm::unmap_pages(self.map_beg, self.map_size) };
        stats::TOTAL_RESERVED.sub(self.map_size);
        let committed = self.committed_bytes.swap(0, Ordering::Relaxed);
        stats::TOTAL_COMMITTED.sub(committed);
        stats::PRIMARY_COMMITTED.sub(committed);
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    #[inline]
    fn region_beg(&self, class: usize) -> usize {
        self.space_beg + (class << self.region_shift)
    }

    /// Decide how the next carve of up to `want` blocks can proceed.
    fn plan_carve(&self, class: usize, region: &Region, want: usize) -> CarvePlan {
        let block_size = M::size_of(class);
        let page = vm::page_size();
        // Two pages of slack keep the page-rounded user and metadata
        // watermarks from ever overlapping in a nearly-full region.
        let capacity = self.region_size.saturating_sub(2 * page)
            / (block_size + BLOCK_METADATA_SIZE);
        let want = want.min(capacity.saturating_sub(region.carved));
        if want == 0 {
            return CarvePlan::Exhausted;
        }

        let need_user = (region.carved + want) * block_size;
        let need_meta = (region.carved + want) * BLOCK_METADATA_SIZE;
        let user_target = need_user.next_multiple_of(page);
        let meta_target = need_meta.next_multiple_of(page);

        if user_target <= region.committed_user && meta_target <= region.committed_meta {
            return CarvePlan::Ready(want);
        }

        let region_beg = self.region_beg(class);
        let region_end = region_beg + self.region_size;
        CarvePlan::Commit(CommitRequest {
            user_beg: region_beg + region.committed_user,
            user_len: user_target.saturating_sub(region.committed_user),
            meta_beg: region_end - meta_target,
            meta_len: meta_target.saturating_sub(region.committed_meta),
            user_target,
            meta_target,
        })
    }
}

impl<M: SizeClassMap> Drop for SizeClassAllocator<M> {
    fn drop(&mut self) {
        self.release_space();
    }
}
