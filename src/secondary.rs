//! Secondary allocator for large and over-aligned blocks.
//!
//! Every allocation gets its own page-aligned mapping. The first page is
//! the header page: a [`Header`] record at its start, and the rest — at
//! least half a page — is user-accessible metadata, mirroring the side-band
//! contract of the size-classed allocator. The user region starts at the
//! second page (pushed further only for alignments above the page size), so
//! the header is always recoverable in O(1) as `user_page - page_size`.
//!
//! All live headers are threaded into one process-wide doubly-linked list
//! under a spin mutex. Membership and containment queries walk that list —
//! linear, but large blocks are rare and callers dispatch on the primary
//! first. Unmapping happens after the critical section, so the mutex is
//! never held across a syscall.

use std::ptr::{self, NonNull};

use crate::stats;
use crate::sync::SpinMutex;
use crate::vm;

/// Out-of-band record at the start of a large mapping's header page.
#[repr(C)]
struct Header {
    map_beg: usize,
    map_size: usize,
    /// Requested user size.
    size: usize,
    next: *mut Header,
    prev: *mut Header,
}

pub struct LargeMmapAllocator {
    page_size: usize,
    /// Head of the live-header list. All link mutation and traversal
    /// happens under this mutex.
    list: SpinMutex<*mut Header>,
}

// Safety: the header pointers are only dereferenced while the registry
// mutex is held, or for fields that are written once before the header is
// published and never change afterwards (map_beg, map_size, size).
unsafe impl Send for LargeMmapAllocator {}
// Safety: same reasoning.
unsafe impl Sync for LargeMmapAllocator {}

impl LargeMmapAllocator {
    pub fn new() -> Self {
        let page_size = vm::page_size();
        // The metadata contract promises at least half a page past the
        // header.
        assert!(std::mem::size_of::<Header>() <= page_size / 2);
        Self {
            page_size,
            list: SpinMutex::new(ptr::null_mut()),
        }
    }

    /// Allocate `size` bytes at the given power-of-two alignment.
    /// Returns `None` only when the mapping size computation overflows;
    /// a failed mapping syscall aborts.
    pub fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let mut map_size = self.round_up_map_size(size)?;
        if alignment > self.page_size {
            map_size = map_size.checked_add(alignment)?;
        }

        let map_beg = vm::map_pages(map_size, "LargeMmapAllocator").as_ptr() as usize;
        let map_end = map_beg + map_size;
        let mut res = map_beg + self.page_size;
        if res & (alignment - 1) != 0 {
            res += alignment - (res & (alignment - 1));
        }
        debug_assert_eq!(res & (alignment - 1), 0);
        assert!(res + size <= map_end);

        let h = self.header_of(res);
        // Safety: h is the first page of the mapping we just created;
        // nothing else references it yet.
        unsafe {
            (*h).map_beg = map_beg;
            (*h).map_size = map_size;
            (*h).size = size;
        }
        {
            let mut head = self.list.lock();
            // Safety: linking under the registry mutex.
            unsafe {
                (*h).next = *head;
                (*h).prev = ptr::null_mut();
                if !(*head).is_null() {
                    (**head).prev = h;
                }
            }
            *head = h;
        }
        stats::TOTAL_RESERVED.add(map_size);
        stats::TOTAL_COMMITTED.add(map_size);
        stats::SECONDARY_MAPPED.add(map_size);

        NonNull::new(res as *mut u8)
    }

    /// Return a block to the OS.
    ///
    /// # Safety
    /// `p` must be the user base of a live allocation from this allocator,
    /// and must not be used afterwards.
    pub unsafe fn deallocate(&self, p: NonNull<u8>) {
        let h = self.header_of(p.as_ptr() as usize);
        // Unlink first; the unmap syscall runs outside the critical section.
        let (map_beg, map_size) = {
            let mut head = self.list.lock();
            // Safety: caller guarantees p is live, so h is in the registry.
            unsafe {
                let prev = (*h).prev;
                let next = (*h).next;
                if !prev.is_null() {
                    (*prev).next = next;
                }
                if !next.is_null() {
                    (*next).prev = prev;
                }
                if *head == h {
                    *head = next;
                }
                ((*h).map_beg, (*h).map_size)
            }
        };
        // Safety: the mapping is exactly [map_beg, map_beg + map_size) and
        // nothing references it any more.
        unsafe {
            vm::unmap_pages(
                NonNull::new_unchecked(map_beg as *mut u8),
                map_size,
            );
        }
        stats::TOTAL_RESERVED.sub(map_size);
        stats::TOTAL_COMMITTED.sub(map_size);
        stats::SECONDARY_MAPPED.sub(map_size);
    }

    /// True iff `p` is the user base of a live large allocation. Interior
    /// pointers are not recognized here; see [`get_block_begin`].
    ///
    /// [`get_block_begin`]: Self::get_block_begin
    pub fn pointer_is_mine(&self, p: *const u8) -> bool {
        let addr = p as usize;
        // Fast reject: user bases are always page-aligned.
        if addr & (self.page_size - 1) != 0 {
            return false;
        }
        let head = self.list.lock();
        let mut h = *head;
        while !h.is_null() {
            if self.user_of(h) == addr {
                return true;
            }
            // Safety: registry headers are live while the mutex is held.
            h = unsafe { (*h).next };
        }
        false
    }

    /// User base of the live block whose user range contains `p`, if any.
    pub fn get_block_begin(&self, p: *const u8) -> Option<NonNull<u8>> {
        let addr = p as usize;
        let head = self.list.lock();
        let mut h = *head;
        while !h.is_null() {
            let user = self.user_of(h);
            // Safety: registry headers are live while the mutex is held.
            let size = unsafe { (*h).size };
            if addr >= user && addr < user + size {
                return NonNull::new(user as *mut u8);
            }
            h = unsafe { (*h).next };
        }
        None
    }

    /// Side-band metadata of a block: the header page past the [`Header`]
    /// record. At least `page_size / 2` bytes.
    ///
    /// # Safety
    /// `p` must be the user base of a live allocation from this allocator.
    pub unsafe fn get_metadata(&self, p: NonNull<u8>) -> NonNull<u8> {
        let h = self.header_of(p.as_ptr() as usize);
        // Safety: the header page outlives the block; the record sits at
        // its start.
        unsafe { NonNull::new_unchecked(h.add(1).cast::<u8>()) }
    }

    /// Usable capacity of a block: its size rounded up to the page.
    ///
    /// # Safety
    /// `p` must be the user base of a live allocation from this allocator.
    pub unsafe fn get_actually_allocated_size(&self, p: NonNull<u8>) -> usize {
        let h = self.header_of(p.as_ptr() as usize);
        // Safety: header fields are immutable after publication.
        let size = unsafe { (*h).size };
        size.next_multiple_of(self.page_size)
    }

    /// Bytes currently mapped for live blocks, headers and alignment slack
    /// included.
    pub fn total_memory_used(&self) -> usize {
        let head = self.list.lock();
        let mut h = *head;
        let mut total = 0;
        while !h.is_null() {
            // Safety: registry headers are live while the mutex is held.
            unsafe {
                total += (*h).map_size;
                h = (*h).next;
            }
        }
        total
    }

    #[inline]
    fn header_of(&self, user: usize) -> *mut Header {
        assert!(
            user & (self.page_size - 1) == 0,
            "not a large-block user pointer: {user:#x}"
        );
        (user - self.page_size) as *mut Header
    }

    #[inline]
    fn user_of(&self, h: *mut Header) -> usize {
        debug_assert!((h as usize).is_multiple_of(self.page_size));
        h as usize + self.page_size
    }

    fn round_up_map_size(&self, size: usize) -> Option<usize> {
        size.checked_next_multiple_of(self.page_size)?
            .checked_add(self.page_size)
    }
}

impl Default for LargeMmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeMmapAllocator {
    fn drop(&mut self) {
        // Unmap anything still outstanding so dropping an allocator in a
        // test harness does not leak mappings.
        let mut h = *self.list.lock();
        while !h.is_null() {
            // Safety: we own the registry exclusively in drop.
            unsafe {
                let next = (*h).next;
                let (map_beg, map_size) = ((*h).map_beg, (*h).map_size);
                vm::unmap_pages(NonNull::new_unchecked(map_beg as *mut u8), map_size);
                stats::TOTAL_RESERVED.sub(map_size);
                stats::TOTAL_COMMITTED.sub(map_size);
                stats::SECONDARY_MAPPED.sub(map_size);
                h = next;
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const MIB: usize = 1 << 20;

    #[test]
    fn test_allocate_basic() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = LargeMmapAllocator::new();
        let p = secondary.allocate(3 * MIB, 8).unwrap();

        assert!((p.as_ptr() as usize).is_multiple_of(vm::page_size()));
        assert!(secondary.pointer_is_mine(p.as_ptr()));
        // The whole user range is writable.
        // Safety: live block of 3 MiB.
        unsafe {
            p.as_ptr().write(0x11);
            p.as_ptr().add(3 * MIB - 1).write(0x22);
            assert_eq!(p.as_ptr().read(), 0x11);
        }

        // Safety: p is live and not used afterwards.
        unsafe { secondary.deallocate(p) };
        assert_eq!(secondary.total_memory_used(), 0);
    }

    #[test]
    fn test_allocate_over_aligned() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = LargeMmapAllocator::new();
        let p = secondary.allocate(3 * MIB, MIB).unwrap();

        assert!((p.as_ptr() as usize).is_multiple_of(MIB));
        // Safety: p is live.
        unsafe {
            assert_eq!(
                secondary.get_actually_allocated_size(p),
                (3 * MIB).next_multiple_of(vm::page_size())
            );
        }
        assert_eq!(
            secondary.get_block_begin(unsafe { p.as_ptr().add(4096) }),
            Some(p)
        );

        // Safety: p is live and not used afterwards.
        unsafe { secondary.deallocate(p) };
        assert_eq!(secondary.total_memory_used(), 0);
    }

    #[test]
    fn test_sub_page_sizes_are_page_backed() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = LargeMmapAllocator::new();
        let p = secondary.allocate(1, 8).unwrap();
        // Safety: p is live.
        unsafe {
            assert_eq!(secondary.get_actually_allocated_size(p), vm::page_size());
            secondary.deallocate(p);
        }
    }

    #[test]
    fn test_pointer_is_mine_semantics() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = LargeMmapAllocator::new();
        let p = secondary.allocate(2 * MIB, 8).unwrap();

        // Misaligned pointers short-circuit.
        assert!(!secondary.pointer_is_mine(unsafe { p.as_ptr().add(1) }));
        // Interior page-aligned pointers are containment, not membership.
        let interior = unsafe { p.as_ptr().add(vm::page_size()) };
        assert!(!secondary.pointer_is_mine(interior));
        assert_eq!(secondary.get_block_begin(interior), Some(p));
        // Pointers past the block match nothing.
        let beyond = unsafe { p.as_ptr().add(2 * MIB) };
        assert_eq!(secondary.get_block_begin(beyond), None);

        // Safety: p is live and not used afterwards.
        unsafe { secondary.deallocate(p) };
        assert!(!secondary.pointer_is_mine(p.as_ptr()));
    }

    #[test]
    fn test_metadata_area() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = LargeMmapAllocator::new();
        let p = secondary.allocate(MIB, 8).unwrap();

        // Safety: p is live.
        let meta = unsafe { secondary.get_metadata(p) };
        let page = vm::page_size();
        let meta_addr = meta.as_ptr() as usize;
        let user_addr = p.as_ptr() as usize;

        // Metadata sits in the header page, outside the user range, with
        // at least half a page of room.
        assert!(meta_addr < user_addr);
        assert!(user_addr - meta_addr <= page);
        let room = user_addr - meta_addr;
        assert!(room >= page / 2);
        // Safety: the metadata area is part of the committed mapping.
        unsafe {
            std::ptr::write_bytes(meta.as_ptr(), 0x77, room);
            assert_eq!(*meta.as_ptr(), 0x77);
            // User bytes were not clobbered (fresh mapping reads zero).
            assert_eq!(*p.as_ptr(), 0);
        }

        // Safety: p is live and not used afterwards.
        unsafe { secondary.deallocate(p) };
    }

    #[test]
    fn test_registry_handles_many_blocks() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = LargeMmapAllocator::new();
        let page = vm::page_size();

        let mut blocks = Vec::new();
        for i in 1..=8 {
            blocks.push((secondary.allocate(i * page, 8).unwrap(), i * page));
        }
        let expected: usize = blocks.iter().map(|&(_, s)| s + page).sum();
        assert_eq!(secondary.total_memory_used(), expected);

        for &(p, _) in &blocks {
            assert!(secondary.pointer_is_mine(p.as_ptr()));
        }

        // Free from the middle first to exercise the unlink paths.
        let (mid, _) = blocks.remove(4);
        // Safety: mid is live.
        unsafe { secondary.deallocate(mid) };
        assert!(!secondary.pointer_is_mine(mid.as_ptr()));

        for (p, _) in blocks {
            // Safety: p is live.
            unsafe { secondary.deallocate(p) };
        }
        assert_eq!(secondary.total_memory_used(), 0);
    }

    #[test]
    fn test_allocate_overflow_returns_null() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = LargeMmapAllocator::new();
        assert!(secondary.allocate(usize::MAX, 8).is_none());
        assert!(secondary.allocate(usize::MAX - vm::page_size(), 8).is_none());
    }

    #[test]
    fn test_concurrent_registry() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let secondary = crate::sync::Arc::new(LargeMmapAllocator::new());
        let mut handles = vec![];

        for t in 0u8..4 {
            let s = secondary.clone();
            handles.push(crate::sync::thread::spawn(move || {
                let page = vm::page_size();
                let mut live = Vec::new();
                for i in 0..32 {
                    let p = s.allocate(page * (1 + i % 3), 8).unwrap();
                    // Safety: fresh block.
                    unsafe {
                        p.as_ptr().write(t);
                        assert_eq!(p.as_ptr().read(), t);
                    }
                    live.push(p);
                    if i % 2 == 0 {
                        let victim = live.swap_remove(live.len() / 2);
                        // Safety: victim is live.
                        unsafe { s.deallocate(victim) };
                    }
                }
                for p in live {
                    // Safety: p is live.
                    unsafe { s.deallocate(p) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(secondary.total_memory_used(), 0);
    }

    #[test]
    fn test_drop_releases_outstanding_blocks() {
        let _guard = crate::TEST_MUTEX.write().unwrap();
        let before = stats::SECONDARY_MAPPED.get();
        {
            let secondary = LargeMmapAllocator::new();
            let _a = secondary.allocate(MIB, 8).unwrap();
            let _b = secondary.allocate(2 * MIB, 8).unwrap();
            assert!(stats::SECONDARY_MAPPED.get() > before);
        }
        assert_eq!(stats::SECONDARY_MAPPED.get(), before);
    }
}
